//! CGI subprocess execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{GatewayError, GatewayResult};
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::router::{EffectiveHost, RequestHandler};

const CGI_EXTENSIONS: [&str; 4] = [".cgi", ".pl", ".py", ".sh"];

pub struct CgiHandler;

#[async_trait]
impl RequestHandler for CgiHandler {
    fn claims(&self, request: &GatewayRequest, host: &EffectiveHost) -> bool {
        let full_path = script_path(request, host);
        let Ok(metadata) = std::fs::metadata(&full_path) else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }

        if !host.cgi_path.is_empty() && request.path().starts_with(&host.cgi_path) {
            return true;
        }
        let name = full_path.to_string_lossy();
        if CGI_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            return true;
        }
        has_execute_bit(&metadata)
    }

    async fn handle(
        &self,
        request: &GatewayRequest,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        let full_path = script_path(request, host);
        if !full_path.is_file() {
            return Err(GatewayError::NotFound(request.path().to_string()));
        }

        tracing::debug!(target: "gatehouse::cgi", script = %full_path.display(), "executing cgi program");

        let work_dir = full_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut command = Command::new(&full_path);
        command
            .env_clear()
            .envs(cgi_environment(request, host, &full_path))
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let mut child = command
            .spawn()
            .map_err(|err| GatewayError::CgiFailed(format!("spawn failed: {err}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = request.body_bytes();
            if !body.is_empty() {
                stdin
                    .write_all(&body)
                    .await
                    .map_err(|err| GatewayError::CgiFailed(format!("stdin write failed: {err}")))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| GatewayError::CgiFailed(format!("wait failed: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                target: "gatehouse::cgi",
                script = %full_path.display(),
                status = %output.status,
                stderr = %stderr,
                "cgi program failed"
            );
            return Err(GatewayError::CgiFailed(format!(
                "{} exited with {}",
                full_path.display(),
                output.status
            )));
        }
        if !output.stderr.is_empty() {
            tracing::warn!(
                target: "gatehouse::cgi",
                script = %full_path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "cgi program wrote to stderr"
            );
        }

        Ok(response_from_cgi_output(&output.stdout))
    }
}

fn script_path(request: &GatewayRequest, host: &EffectiveHost) -> PathBuf {
    PathBuf::from(&host.document_root).join(request.path().trim_start_matches('/'))
}

fn has_execute_bit(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

/// CGI/1.1 environment for the child process.
pub(crate) fn cgi_environment(
    request: &GatewayRequest,
    host: &EffectiveHost,
    script: &Path,
) -> Vec<(String, String)> {
    let server_name = request
        .host_header()
        .map(str::to_string)
        .unwrap_or_else(|| host.server_name.clone());

    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), "gatehouse".to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("REQUEST_METHOD".to_string(), request.method().to_string()),
        ("REQUEST_URI".to_string(), request.target().to_string()),
        ("QUERY_STRING".to_string(), request.query_string().to_string()),
        ("SCRIPT_NAME".to_string(), request.path().to_string()),
        (
            "SCRIPT_FILENAME".to_string(),
            script.display().to_string(),
        ),
        ("DOCUMENT_ROOT".to_string(), host.document_root.clone()),
        ("SERVER_NAME".to_string(), server_name.clone()),
        ("SERVER_PORT".to_string(), host.server_port.clone()),
        ("HTTP_HOST".to_string(), server_name),
        ("REMOTE_ADDR".to_string(), request.peer().ip().to_string()),
        (
            "CONTENT_LENGTH".to_string(),
            request.body().len().to_string(),
        ),
    ];
    if let Some(content_type) = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }
    for (name, value) in request.headers() {
        let Ok(value) = value.to_str() else { continue };
        env.push((
            format!(
                "HTTP_{}",
                name.as_str().to_ascii_uppercase().replace('-', "_")
            ),
            value.to_string(),
        ));
    }
    env
}

/// Split CGI-style output into headers and body and build the response.
/// A `Status:` pseudo-header overrides the 200 default.
pub(crate) fn response_from_cgi_output(raw: &[u8]) -> GatewayResponse {
    let (header_block, body) = split_cgi_output(raw);

    let mut response = GatewayResponse::new(StatusCode::OK);
    for line in header_block.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            if let Some(code) = value
                .split_whitespace()
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .and_then(|c| StatusCode::from_u16(c).ok())
            {
                response = response.with_status(code);
            }
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        response.append_header(name, value);
    }
    if !response.headers().contains_key(CONTENT_TYPE) {
        response.set_header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
    }
    response.with_body(Bytes::copy_from_slice(body))
}

fn split_cgi_output(raw: &[u8]) -> (String, &[u8]) {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        (
            String::from_utf8_lossy(&raw[..pos]).into_owned(),
            &raw[pos + 4..],
        )
    } else if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        (
            String::from_utf8_lossy(&raw[..pos]).into_owned(),
            &raw[pos + 2..],
        )
    } else {
        (String::new(), raw)
    }
}
