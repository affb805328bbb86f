//! Static file serving with Apache-style index resolution and directory
//! listings.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use html_escape::{encode_double_quoted_attribute, encode_text};
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, StatusCode};
use percent_encoding::percent_decode_str;
use tokio::fs;

use crate::error::{GatewayError, GatewayResult};
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::router::{EffectiveHost, RequestHandler};
use crate::utils;

/// On-disk listing template, looked up in the working directory. The
/// built-in markup is used when it is absent or fails to render.
const LISTING_TEMPLATE: &str = "directory-index.html";

pub struct StaticSiteHandler;

#[async_trait]
impl RequestHandler for StaticSiteHandler {
    fn claims(&self, _request: &GatewayRequest, _host: &EffectiveHost) -> bool {
        // Terminal fallback of the chain.
        true
    }

    async fn handle(
        &self,
        request: &GatewayRequest,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        let method = request.method().clone();
        if method != Method::GET && method != Method::HEAD {
            let response = GatewayResponse::text(format!("Method {method} is not supported"))
                .with_status(StatusCode::METHOD_NOT_ALLOWED);
            return Ok(response);
        }

        let decoded = percent_decode_str(request.path())
            .decode_utf8()
            .map_err(|_| GatewayError::BadRequest("invalid percent-encoding in path".into()))?;
        let url_path = utils::normalize_path(&decoded);

        let root = match fs::canonicalize(&host.document_root).await {
            Ok(path) => path,
            Err(_) => return Err(GatewayError::NotFound(url_path)),
        };

        let mut full = root.clone();
        full.push(url_path.trim_start_matches('/'));

        let canonical = match fs::canonicalize(&full).await {
            Ok(path) => path,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(url_path))
            }
            Err(err) => return Err(GatewayError::Io(err)),
        };
        if !canonical.starts_with(&root) {
            return Err(GatewayError::Forbidden(url_path));
        }

        let metadata = fs::metadata(&canonical).await?;
        if metadata.is_dir() {
            return self
                .handle_directory(&method, &canonical, &url_path, host)
                .await;
        }
        self.serve_file(&method, &canonical, metadata.len(), host)
            .await
    }
}

impl StaticSiteHandler {
    async fn serve_file(
        &self,
        method: &Method,
        path: &Path,
        size: u64,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        let mut response = GatewayResponse::new(StatusCode::OK);
        response.set_header(CONTENT_TYPE, content_type_for(path, host));
        let content_length = HeaderValue::from_str(&size.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0"));
        response.set_header(CONTENT_LENGTH, content_length);

        if method == Method::HEAD {
            return Ok(response);
        }

        let bytes = fs::read(path).await?;
        Ok(response.with_body(Bytes::from(bytes)))
    }

    async fn handle_directory(
        &self,
        method: &Method,
        dir: &Path,
        url_path: &str,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        if let Some(index) = utils::find_index_file(dir, &host.directory_index) {
            let index_path = dir.join(&index);
            let size = fs::metadata(&index_path).await.map(|meta| meta.len())?;
            return self.serve_file(method, &index_path, size, host).await;
        }

        let listing = self.render_listing(dir, url_path).await?;
        let mut response = GatewayResponse::html(listing);
        if method == Method::HEAD {
            response.set_header(CONTENT_LENGTH, HeaderValue::from_static("0"));
            response = response.with_body(Bytes::new());
        }
        Ok(response)
    }

    async fn render_listing(&self, dir: &Path, url_path: &str) -> GatewayResult<String> {
        let entries = collect_entries(dir, url_path).await?;
        let breadcrumb = breadcrumb_html(url_path);

        if let Ok(template) = std::fs::read_to_string(LISTING_TEMPLATE) {
            let mut context = tera::Context::new();
            context.insert("path", url_path);
            context.insert("breadcrumb", &breadcrumb);
            context.insert("entries", &entries);
            match tera::Tera::one_off(&template, &context, false) {
                Ok(rendered) => return Ok(rendered),
                Err(err) => {
                    tracing::warn!(target: "gatehouse::static", error = %err, "listing template failed, using built-in markup");
                }
            }
        }

        Ok(builtin_listing(url_path, &breadcrumb, &entries))
    }
}

#[derive(Debug, serde::Serialize)]
struct ListingEntry {
    name: String,
    url: String,
    size: String,
    mod_time: String,
    icon: String,
}

async fn collect_entries(dir: &Path, url_path: &str) -> GatewayResult<Vec<ListingEntry>> {
    let mut read_dir = fs::read_dir(dir).await?;
    let mut children: Vec<(String, bool, u64, String)> = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let modified = metadata
            .modified()
            .map(|time| {
                DateTime::<Local>::from(time)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|_| "-".to_string());
        children.push((name, metadata.is_dir(), metadata.len(), modified));
    }
    children.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));

    let base = if url_path.ends_with('/') {
        url_path.to_string()
    } else {
        format!("{url_path}/")
    };

    let mut entries = Vec::with_capacity(children.len() + 1);
    if url_path != "/" {
        let parent = parent_url(url_path);
        entries.push(ListingEntry {
            name: "..".to_string(),
            url: parent,
            size: "-".to_string(),
            mod_time: "-".to_string(),
            icon: "\u{1F4C1}".to_string(),
        });
    }
    for (name, is_dir, size, modified) in children {
        let mut url = format!(
            "{base}{}",
            encode_double_quoted_attribute(&name)
        );
        if is_dir {
            url.push('/');
        }
        entries.push(ListingEntry {
            name: encode_text(&name).into_owned(),
            url,
            size: if is_dir {
                "-".to_string()
            } else {
                utils::format_size(size)
            },
            mod_time: modified,
            icon: if is_dir { "\u{1F4C1}" } else { "\u{1F4C4}" }.to_string(),
        });
    }
    Ok(entries)
}

fn parent_url(url_path: &str) -> String {
    let trimmed = url_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => format!("{}/", &trimmed[..idx]),
    }
}

fn breadcrumb_html(url_path: &str) -> String {
    let mut parts = vec!["<a href=\"/\">Home</a>".to_string()];
    let mut current = String::new();
    for segment in url_path.trim_matches('/').split('/') {
        if segment.is_empty() {
            continue;
        }
        current.push('/');
        current.push_str(segment);
        parts.push(format!(
            "<a href=\"{current}/\">{}</a>",
            encode_text(segment)
        ));
    }
    parts.join(" / ")
}

fn builtin_listing(url_path: &str, breadcrumb: &str, entries: &[ListingEntry]) -> String {
    let mut body = String::from(
        "<!DOCTYPE html><html><head><title>Index of ",
    );
    body.push_str(&encode_text(url_path));
    body.push_str(
        "</title><style>body{font-family:system-ui;margin:2rem;}\
         table{width:100%;border-collapse:collapse;}\
         th,td{padding:0.4rem 0.6rem;text-align:left;border-bottom:1px solid #ddd;}\
         th{background:#f5f5f5;}</style></head><body>",
    );
    body.push_str("<p>");
    body.push_str(breadcrumb);
    body.push_str("</p><h1>Index of ");
    body.push_str(&encode_text(url_path));
    body.push_str("</h1><table><tr><th></th><th>Name</th><th>Size</th><th>Modified</th></tr>");
    for entry in entries {
        body.push_str(&format!(
            "<tr><td>{}</td><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>",
            entry.icon, entry.url, entry.name, entry.size, entry.mod_time
        ));
    }
    body.push_str("</table></body></html>");
    body
}

fn content_type_for(path: &Path, host: &EffectiveHost) -> HeaderValue {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    if let Some(configured) = host.mime_lookup(ext) {
        if let Ok(value) = HeaderValue::from_str(configured) {
            return value;
        }
    }
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    HeaderValue::from_str(mime.essence_str())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn host_for(root: &Path) -> EffectiveHost {
        EffectiveHost {
            server_name: "static.test".into(),
            document_root: root.display().to_string(),
            mime_types: Arc::new(Vec::new()),
            ..EffectiveHost::default()
        }
    }

    fn request(target: &str) -> GatewayRequest {
        let peer: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        GatewayRequest::testing(Method::GET, target, peer)
    }

    #[tokio::test]
    async fn serves_regular_file_with_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.html"), "<p>hi</p>").unwrap();

        let response = StaticSiteHandler
            .handle(&request("/hello.html"), &host_for(dir.path()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html"
        );
        assert_eq!(response.body(), b"<p>hi</p>");
    }

    #[tokio::test]
    async fn configured_mime_table_wins_over_guess() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), [0u8; 4]).unwrap();
        let mut host = host_for(dir.path());
        host.mime_types = Arc::new(vec![crate::config::MimeType {
            ext: "bin".into(),
            mime: "application/x-custom".into(),
        }]);

        let response = StaticSiteHandler
            .handle(&request("/data.bin"), &host)
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-custom"
        );
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = StaticSiteHandler
            .handle(&request("/nope.txt"), &host_for(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn directory_serves_index_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "front page").unwrap();

        let response = StaticSiteHandler
            .handle(&request("/"), &host_for(dir.path()))
            .await
            .unwrap();
        assert_eq!(response.body(), b"front page");
    }

    #[tokio::test]
    async fn directory_index_order_respects_configuration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "default").unwrap();
        std::fs::write(dir.path().join("start.html"), "configured").unwrap();
        let mut host = host_for(dir.path());
        host.directory_index = "start.html".into();

        let response = StaticSiteHandler
            .handle(&request("/"), &host)
            .await
            .unwrap();
        assert_eq!(response.body(), b"configured");
    }

    #[tokio::test]
    async fn listing_renders_when_no_index_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let response = StaticSiteHandler
            .handle(&request("/"), &host_for(dir.path()))
            .await
            .unwrap();
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("notes.txt"));
        assert!(body.contains("sub/"));
        assert!(body.contains("Home"));
    }

    #[tokio::test]
    async fn traversal_stays_inside_document_root() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "s").unwrap();
        let root = outer.path().join("public");
        std::fs::create_dir(&root).unwrap();

        let err = StaticSiteHandler
            .handle(&request("/../secret.txt"), &host_for(&root))
            .await
            .unwrap_err();
        // Dot segments are normalized away, so the traversal resolves inside
        // the root and simply does not exist there.
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn parent_links() {
        assert_eq!(parent_url("/a/b"), "/a/");
        assert_eq!(parent_url("/a/"), "/");
        assert_eq!(parent_url("/a"), "/");
    }
}
