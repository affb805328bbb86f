//! PHP handling over FastCGI to a TCP backend (php-fpm style).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cgi::response_from_cgi_output;
use crate::error::{GatewayError, GatewayResult};
use crate::fastcgi;
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::router::{EffectiveHost, RequestHandler};
use crate::utils;

pub(crate) const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PhpHandler;

#[async_trait]
impl RequestHandler for PhpHandler {
    fn claims(&self, request: &GatewayRequest, host: &EffectiveHost) -> bool {
        if host.php_proxy_fcgi.is_empty() {
            return false;
        }
        is_php_request(request, host)
    }

    async fn handle(
        &self,
        request: &GatewayRequest,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        let (script_name, script_filename) = resolve_script(request, host);
        tracing::debug!(
            target: "gatehouse::php",
            script = %script_name,
            backend = %host.php_proxy_fcgi,
            "forwarding to fastcgi backend"
        );

        let mut stream = TcpStream::connect(&host.php_proxy_fcgi)
            .await
            .map_err(|err| {
                GatewayError::Upstream(format!("cannot reach {}: {err}", host.php_proxy_fcgi))
            })?;

        let params = fastcgi::request_params(
            request,
            &host.document_root,
            &script_name,
            &script_filename,
            &host.server_name,
            &host.server_port,
        );

        let output = timeout(
            UPSTREAM_TIMEOUT,
            fastcgi::exchange(&mut stream, &params, request.body()),
        )
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(host.php_proxy_fcgi.clone()))??;

        if !output.stderr.is_empty() {
            tracing::error!(
                target: "gatehouse::php",
                backend = %host.php_proxy_fcgi,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "fastcgi backend reported errors"
            );
        }
        Ok(response_from_cgi_output(&output.stdout))
    }
}

/// Whether the URL should be routed to PHP. `.php` targets always match;
/// other file-like URLs never do. An extension-less URL matches only when an
/// `index.php` front controller exists in the resolved directory.
pub(crate) fn is_php_request(request: &GatewayRequest, host: &EffectiveHost) -> bool {
    let path = request.path();
    if path.ends_with(".php") {
        return true;
    }
    if utils::has_extension(path) {
        return false;
    }
    front_controller_dir(request, host)
        .map(|dir| dir.join("index.php").is_file())
        .unwrap_or(false)
}

/// Directory probed for `index.php`: the path itself when it resolves to a
/// directory, its parent otherwise.
fn front_controller_dir(request: &GatewayRequest, host: &EffectiveHost) -> Option<PathBuf> {
    let root = PathBuf::from(&host.document_root);
    let candidate = root.join(request.path().trim_start_matches('/'));
    if candidate.is_dir() {
        return Some(candidate);
    }
    candidate.parent().map(Path::to_path_buf)
}

/// Derive (SCRIPT_NAME, SCRIPT_FILENAME) for the FastCGI request.
fn resolve_script(request: &GatewayRequest, host: &EffectiveHost) -> (String, String) {
    let path = request.path();
    let root = &host.document_root;

    if path.ends_with(".php") {
        return (path.to_string(), format!("{root}{path}"));
    }

    let candidate = PathBuf::from(root).join(path.trim_start_matches('/'));
    if candidate.is_dir() {
        let index = utils::find_index_file(&candidate, &host.directory_index)
            .unwrap_or_else(|| "index.php".to_string());
        let script_name = if path == "/" {
            format!("/{index}")
        } else {
            format!("{}/{index}", path.trim_end_matches('/'))
        };
        let script_filename = format!("{root}{script_name}");
        return (script_name, script_filename);
    }

    // Extension-less pretty URL routed through the front controller.
    let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    let script_name = format!("{dir}/index.php");
    let script_filename = format!("{root}{script_name}");
    (script_name, script_filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn host_for(root: &Path, backend: &str) -> EffectiveHost {
        EffectiveHost {
            server_name: "php.test".into(),
            document_root: root.display().to_string(),
            php_proxy_fcgi: backend.into(),
            server_port: "80".into(),
            mime_types: Arc::new(Vec::new()),
            ..EffectiveHost::default()
        }
    }

    fn request(target: &str) -> GatewayRequest {
        let peer: SocketAddr = "127.0.0.1:6100".parse().unwrap();
        GatewayRequest::testing(Method::GET, target, peer)
    }

    #[test]
    fn php_urls_always_claim() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_for(dir.path(), "127.0.0.1:9000");
        assert!(PhpHandler.claims(&request("/app.php"), &host));
        assert!(PhpHandler.claims(&request("/sub/app.php?x=1"), &host));
        assert!(!PhpHandler.claims(&request("/logo.png"), &host));
    }

    #[test]
    fn no_backend_means_no_claim() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_for(dir.path(), "");
        assert!(!PhpHandler.claims(&request("/app.php"), &host));
    }

    #[test]
    fn extensionless_urls_need_a_front_controller() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_for(dir.path(), "127.0.0.1:9000");
        assert!(!PhpHandler.claims(&request("/api/users"), &host));

        std::fs::write(dir.path().join("index.php"), "<?php ?>").unwrap();
        assert!(PhpHandler.claims(&request("/pretty-url"), &host));
    }

    #[test]
    fn script_resolution_variants() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php ?>").unwrap();
        let host = host_for(dir.path(), "127.0.0.1:9000");
        let root = host.document_root.clone();

        let (name, file) = resolve_script(&request("/blog/post.php"), &host);
        assert_eq!(name, "/blog/post.php");
        assert_eq!(file, format!("{root}/blog/post.php"));

        let (name, file) = resolve_script(&request("/"), &host);
        assert_eq!(name, "/index.php");
        assert_eq!(file, format!("{root}/index.php"));

        let (name, _) = resolve_script(&request("/pretty-url"), &host);
        assert_eq!(name, "/index.php");
    }

    #[tokio::test]
    async fn round_trip_against_fake_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (begin, _, _) = fastcgi::read_record(&mut stream).await.unwrap();
            assert_eq!(begin, fastcgi::FCGI_BEGIN_REQUEST);
            loop {
                let (record_type, _, content) = fastcgi::read_record(&mut stream).await.unwrap();
                if record_type == fastcgi::FCGI_STDIN && content.is_empty() {
                    break;
                }
            }
            let mut reply = Vec::new();
            fastcgi::encode_record(
                &mut reply,
                fastcgi::FCGI_STDOUT,
                b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\ncreated",
            );
            fastcgi::encode_record(&mut reply, fastcgi::FCGI_END_REQUEST, &[0u8; 8]);
            stream.write_all(&reply).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php ?>").unwrap();
        let host = host_for(dir.path(), &addr.to_string());

        let response = PhpHandler.handle(&request("/index.php"), &host).await.unwrap();
        server.await.unwrap();

        assert_eq!(response.status(), http::StatusCode::CREATED);
        assert_eq!(response.body(), b"created");
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        // Port 9 on localhost is not listening in the test environment.
        let host = host_for(dir.path(), "127.0.0.1:9");
        let err = PhpHandler.handle(&request("/x.php"), &host).await.unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::BAD_GATEWAY);
    }
}
