//! Reverse proxying over Unix domain sockets: HTTP/1.1 and FastCGI modes.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use http::StatusCode;
use httparse::Status;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::cgi::response_from_cgi_output;
use crate::error::{GatewayError, GatewayResult};
use crate::fastcgi;
use crate::php::UPSTREAM_TIMEOUT;
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::router::{EffectiveHost, RequestHandler};
use crate::utils;

pub struct ProxyHandler;

#[async_trait]
impl RequestHandler for ProxyHandler {
    fn claims(&self, request: &GatewayRequest, host: &EffectiveHost) -> bool {
        if !host.proxy_path.is_empty() {
            return request.path().starts_with(&host.proxy_path);
        }
        if host.proxy_unix_socket.is_empty() {
            return false;
        }
        // Directory-style URLs stay with the static handler so listings and
        // index resolution keep working.
        let path = request.path();
        if path == "/" || path.ends_with('/') {
            return false;
        }
        if host.proxy_type.eq_ignore_ascii_case("fcgi") {
            return path.ends_with(".php");
        }
        true
    }

    async fn handle(
        &self,
        request: &GatewayRequest,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        if host.proxy_unix_socket.is_empty() {
            return Err(GatewayError::Upstream("proxy not configured".into()));
        }
        if host.proxy_type.eq_ignore_ascii_case("fcgi") {
            self.handle_fcgi(request, host).await
        } else {
            self.handle_http(request, host).await
        }
    }
}

impl ProxyHandler {
    async fn handle_fcgi(
        &self,
        request: &GatewayRequest,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        let script_path = strip_proxy_path(request.path(), &host.proxy_path);
        let script_path = if script_path == "/" || script_path.is_empty() {
            match utils::find_index_file(
                std::path::Path::new(&host.document_root),
                &host.directory_index,
            ) {
                Some(index) => format!("/{index}"),
                None => script_path,
            }
        } else {
            script_path
        };

        let mut file_name = utils::url_basename(&script_path);
        if file_name.is_empty() {
            file_name = "index.php".to_string();
        }
        let script_name = format!("/{file_name}");
        let script_filename = format!("{}/{file_name}", host.document_root);

        tracing::debug!(
            target: "gatehouse::proxy",
            socket = %host.proxy_unix_socket,
            script = %script_name,
            "proxying fastcgi over unix socket"
        );

        let mut stream = UnixStream::connect(&host.proxy_unix_socket)
            .await
            .map_err(|err| {
                GatewayError::Upstream(format!(
                    "cannot reach {}: {err}",
                    host.proxy_unix_socket
                ))
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
        .map_err(|_| GatewayError::UpstreamTimeout(host.proxy_unix_socket.clone()))??;

        if !output.stderr.is_empty() {
            tracing::error!(
                target: "gatehouse::proxy",
                socket = %host.proxy_unix_socket,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "fastcgi upstream reported errors"
            );
        }
        Ok(response_from_cgi_output(&output.stdout))
    }

    async fn handle_http(
        &self,
        request: &GatewayRequest,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        let stripped = strip_proxy_path(request.path(), &host.proxy_path);
        let target = match request.target().find('?') {
            Some(idx) => format!("{stripped}{}", &request.target()[idx..]),
            None => stripped.clone(),
        };

        tracing::debug!(
            target: "gatehouse::proxy",
            socket = %host.proxy_unix_socket,
            upstream_target = %target,
            "proxying http over unix socket"
        );

        let mut head = format!("{} {} HTTP/1.1\r\n", request.method(), target);
        let original_host = request.host_header().unwrap_or(&host.server_name).to_string();
        head.push_str(&format!("Host: {original_host}\r\n"));
        for (name, value) in request.headers() {
            if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH {
                continue;
            }
            if let Ok(value) = value.to_str() {
                head.push_str(&format!("{}: {value}\r\n", name.as_str()));
            }
        }
        head.push_str(&format!("X-Forwarded-Host: {original_host}\r\n"));
        head.push_str("X-Forwarded-Proto: http\r\n");
        head.push_str(&format!("X-Forwarded-For: {}\r\n", request.client_ip()));
        if !request.body().is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", request.body().len()));
        }
        head.push_str("Connection: close\r\n\r\n");

        let exchange = async {
            let mut stream = UnixStream::connect(&host.proxy_unix_socket)
                .await
                .map_err(|err| {
                    GatewayError::Upstream(format!(
                        "cannot reach {}: {err}",
                        host.proxy_unix_socket
                    ))
                })?;
            stream
                .write_all(head.as_bytes())
                .await
                .map_err(|err| GatewayError::Upstream(format!("upstream write failed: {err}")))?;
            if !request.body().is_empty() {
                stream
                    .write_all(request.body())
                    .await
                    .map_err(|err| GatewayError::Upstream(format!("upstream write failed: {err}")))?;
            }
            let mut raw = Vec::new();
            stream
                .read_to_end(&mut raw)
                .await
                .map_err(|err| GatewayError::Upstream(format!("upstream read failed: {err}")))?;
            Ok::<Vec<u8>, GatewayError>(raw)
        };

        let raw = timeout(UPSTREAM_TIMEOUT, exchange)
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(host.proxy_unix_socket.clone()))??;

        parse_upstream_response(&raw)
    }
}

/// Strip the proxy path prefix, always preserving a leading `/`.
fn strip_proxy_path(path: &str, proxy_path: &str) -> String {
    if proxy_path.is_empty() || !path.starts_with(proxy_path) {
        return path.to_string();
    }
    let remainder = &path[proxy_path.len()..];
    if remainder.is_empty() {
        "/".to_string()
    } else if remainder.starts_with('/') {
        remainder.to_string()
    } else {
        format!("/{remainder}")
    }
}

fn parse_upstream_response(raw: &[u8]) -> GatewayResult<GatewayResponse> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    let header_len = match parsed.parse(raw) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => {
            return Err(GatewayError::Upstream(
                "incomplete response from upstream".into(),
            ))
        }
        Err(err) => {
            return Err(GatewayError::Upstream(format!(
                "invalid response from upstream: {err}"
            )))
        }
    };

    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| GatewayError::Upstream("missing status code from upstream".into()))?;

    let mut response = GatewayResponse::new(status);
    for header in parsed.headers.iter() {
        let Ok(name) = HeaderName::from_bytes(header.name.as_bytes()) else {
            continue;
        };
        if is_hop_by_hop(&name) || name == CONNECTION {
            continue;
        }
        let Ok(value) = HeaderValue::from_bytes(header.value) else {
            continue;
        };
        response.append_header(name, value);
    }

    let body = &raw[header_len..];
    Ok(response.with_body(Bytes::copy_from_slice(body)))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::UnixListener;

    fn host_with(socket: &str, proxy_path: &str, proxy_type: &str) -> EffectiveHost {
        EffectiveHost {
            server_name: "proxied.test".into(),
            document_root: "/srv/proxied".into(),
            proxy_unix_socket: socket.into(),
            proxy_path: proxy_path.into(),
            proxy_type: proxy_type.into(),
            server_port: "80".into(),
            mime_types: Arc::new(Vec::new()),
            ..EffectiveHost::default()
        }
    }

    fn request(target: &str) -> GatewayRequest {
        let peer: SocketAddr = "127.0.0.1:6200".parse().unwrap();
        GatewayRequest::testing(Method::GET, target, peer)
    }

    #[test]
    fn claim_respects_proxy_path_and_directory_urls() {
        let with_path = host_with("/tmp/app.sock", "/api", "http");
        assert!(ProxyHandler.claims(&request("/api/users"), &with_path));
        assert!(!ProxyHandler.claims(&request("/static/app.js"), &with_path));

        let no_path = host_with("/tmp/app.sock", "", "http");
        assert!(ProxyHandler.claims(&request("/app.js"), &no_path));
        assert!(!ProxyHandler.claims(&request("/"), &no_path));
        assert!(!ProxyHandler.claims(&request("/docs/"), &no_path));

        let fcgi = host_with("/tmp/php.sock", "", "fcgi");
        assert!(ProxyHandler.claims(&request("/index.php"), &fcgi));
        assert!(!ProxyHandler.claims(&request("/app.js"), &fcgi));

        let unconfigured = host_with("", "", "http");
        assert!(!ProxyHandler.claims(&request("/anything"), &unconfigured));
    }

    #[test]
    fn proxy_path_stripping_preserves_leading_slash() {
        assert_eq!(strip_proxy_path("/api/users", "/api"), "/users");
        assert_eq!(strip_proxy_path("/api", "/api"), "/");
        assert_eq!(strip_proxy_path("/apiv2", "/api"), "/v2");
        assert_eq!(strip_proxy_path("/other", "/api"), "/other");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let response = parse_upstream_response(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: identity\r\nConnection: close\r\n\r\nok",
        )
        .unwrap();
        assert!(response.headers().get("content-type").is_some());
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.body(), b"ok");
    }

    #[tokio::test]
    async fn http_mode_round_trip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("upstream.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let head = String::from_utf8_lossy(&seen).into_owned();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 7\r\n\r\nbackend",
                )
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
            head
        });

        let host = host_with(socket_path.to_str().unwrap(), "/api", "http");
        let response = ProxyHandler
            .handle(&request("/api/users?page=2"), &host)
            .await
            .unwrap();
        let head = server.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"backend");
        assert!(head.starts_with("GET /users?page=2 HTTP/1.1\r\n"));
        assert!(head.contains("X-Forwarded-Proto: http"));
        assert!(head.contains("X-Forwarded-For: 127.0.0.1"));
    }

    #[tokio::test]
    async fn missing_socket_is_bad_gateway() {
        let host = host_with("/nonexistent/upstream.sock", "", "http");
        let err = ProxyHandler
            .handle(&request("/app.js"), &host)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
