//! Minimal FastCGI client: the responder-role subset needed to talk to
//! php-fpm and friends over TCP or a Unix stream socket.
//!
//! Records carried: BEGIN_REQUEST, PARAMS, STDIN, STDOUT, STDERR,
//! END_REQUEST. One request per connection; keep-alive is not requested.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, GatewayResult};
use crate::request::GatewayRequest;

const FCGI_VERSION_1: u8 = 1;

pub(crate) const FCGI_BEGIN_REQUEST: u8 = 1;
pub(crate) const FCGI_END_REQUEST: u8 = 3;
pub(crate) const FCGI_PARAMS: u8 = 4;
pub(crate) const FCGI_STDIN: u8 = 5;
pub(crate) const FCGI_STDOUT: u8 = 6;
pub(crate) const FCGI_STDERR: u8 = 7;

const FCGI_ROLE_RESPONDER: u16 = 1;

/// Largest payload we put in one record; the field is u16 on the wire.
const MAX_RECORD_CONTENT: usize = 0xFFF8;

const REQUEST_ID: u16 = 1;

/// Collected output of one responder session.
#[derive(Debug, Default)]
pub struct FcgiOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub app_status: u32,
}

/// Run a complete responder session on an established stream: send the
/// request, then collect STDOUT/STDERR until END_REQUEST.
pub async fn exchange<S>(
    stream: &mut S,
    params: &[(String, String)],
    body: &[u8],
) -> GatewayResult<FcgiOutput>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(256 + body.len());

    let mut begin_body = [0u8; 8];
    begin_body[0..2].copy_from_slice(&FCGI_ROLE_RESPONDER.to_be_bytes());
    encode_record(&mut request, FCGI_BEGIN_REQUEST, &begin_body);

    let mut encoded_params = Vec::new();
    for (name, value) in params {
        encode_pair(&mut encoded_params, name.as_bytes(), value.as_bytes());
    }
    for chunk in encoded_params.chunks(MAX_RECORD_CONTENT) {
        encode_record(&mut request, FCGI_PARAMS, chunk);
    }
    encode_record(&mut request, FCGI_PARAMS, &[]);

    for chunk in body.chunks(MAX_RECORD_CONTENT) {
        encode_record(&mut request, FCGI_STDIN, chunk);
    }
    encode_record(&mut request, FCGI_STDIN, &[]);

    stream
        .write_all(&request)
        .await
        .map_err(|err| GatewayError::Upstream(format!("fastcgi write failed: {err}")))?;
    stream
        .flush()
        .await
        .map_err(|err| GatewayError::Upstream(format!("fastcgi flush failed: {err}")))?;

    let mut output = FcgiOutput::default();
    loop {
        let (record_type, request_id, content) = read_record(stream).await?;
        if request_id != REQUEST_ID {
            continue;
        }
        match record_type {
            FCGI_STDOUT => output.stdout.extend_from_slice(&content),
            FCGI_STDERR => output.stderr.extend_from_slice(&content),
            FCGI_END_REQUEST => {
                if content.len() >= 4 {
                    output.app_status =
                        u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
                }
                return Ok(output);
            }
            other => {
                return Err(GatewayError::Upstream(format!(
                    "unexpected fastcgi record type {other}"
                )))
            }
        }
    }
}

/// Standard parameter set for a responder request.
pub fn request_params(
    request: &GatewayRequest,
    document_root: &str,
    script_name: &str,
    script_filename: &str,
    server_name: &str,
    server_port: &str,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), "gatehouse".to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("REQUEST_METHOD".to_string(), request.method().to_string()),
        ("REQUEST_URI".to_string(), request.target().to_string()),
        ("QUERY_STRING".to_string(), request.query_string().to_string()),
        ("SCRIPT_NAME".to_string(), script_name.to_string()),
        ("SCRIPT_FILENAME".to_string(), script_filename.to_string()),
        ("DOCUMENT_ROOT".to_string(), document_root.to_string()),
        ("SERVER_NAME".to_string(), server_name.to_string()),
        ("SERVER_PORT".to_string(), server_port.to_string()),
        ("REMOTE_ADDR".to_string(), request.peer().ip().to_string()),
        (
            "CONTENT_LENGTH".to_string(),
            request.body().len().to_string(),
        ),
    ];
    if let Some(content_type) = request
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        params.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }
    for (name, value) in request.headers() {
        let Ok(value) = value.to_str() else { continue };
        let env_name = format!(
            "HTTP_{}",
            name.as_str().to_ascii_uppercase().replace('-', "_")
        );
        params.push((env_name, value.to_string()));
    }
    params
}

pub(crate) fn encode_record(buf: &mut Vec<u8>, record_type: u8, content: &[u8]) {
    debug_assert!(content.len() <= u16::MAX as usize);
    let padding = (8 - content.len() % 8) % 8;
    buf.push(FCGI_VERSION_1);
    buf.push(record_type);
    buf.extend_from_slice(&REQUEST_ID.to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.push(padding as u8);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.extend(std::iter::repeat(0).take(padding));
}

/// Name-value pair with the 1-or-4-byte length encoding.
fn encode_pair(buf: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_length(buf, name.len());
    encode_length(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

fn encode_length(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else {
        buf.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

pub(crate) async fn read_record<S>(stream: &mut S) -> GatewayResult<(u8, u16, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|err| GatewayError::Upstream(format!("fastcgi read failed: {err}")))?;
    if header[0] != FCGI_VERSION_1 {
        return Err(GatewayError::Upstream(format!(
            "unsupported fastcgi protocol version {}",
            header[0]
        )));
    }
    let record_type = header[1];
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_length = header[6] as usize;

    let mut content = vec![0u8; content_length];
    stream
        .read_exact(&mut content)
        .await
        .map_err(|err| GatewayError::Upstream(format!("fastcgi read failed: {err}")))?;
    if padding_length > 0 {
        let mut padding = vec![0u8; padding_length];
        stream
            .read_exact(&mut padding)
            .await
            .map_err(|err| GatewayError::Upstream(format!("fastcgi read failed: {err}")))?;
    }
    Ok((record_type, request_id, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::net::SocketAddr;

    #[test]
    fn short_and_long_pair_lengths() {
        let mut buf = Vec::new();
        encode_pair(&mut buf, b"A", b"b");
        assert_eq!(&buf[..2], &[1, 1]);

        let long_value = vec![b'x'; 300];
        let mut buf = Vec::new();
        encode_pair(&mut buf, b"NAME", &long_value);
        assert_eq!(buf[0], 4);
        assert_eq!(&buf[1..5], &[0x80, 0x00, 0x01, 0x2c]);
    }

    #[test]
    fn records_are_padded_to_eight_bytes() {
        let mut buf = Vec::new();
        encode_record(&mut buf, FCGI_STDIN, b"hello");
        // 8-byte header + 5 content + 3 padding
        assert_eq!(buf.len(), 16);
        assert_eq!(buf[6], 3);
    }

    #[tokio::test]
    async fn record_round_trip() {
        let mut buf = Vec::new();
        encode_record(&mut buf, FCGI_STDOUT, b"payload");
        let mut reader = buf.as_slice();
        let (record_type, request_id, content) = read_record(&mut reader).await.unwrap();
        assert_eq!(record_type, FCGI_STDOUT);
        assert_eq!(request_id, REQUEST_ID);
        assert_eq!(content, b"payload");
    }

    #[tokio::test]
    async fn exchange_collects_stdout_until_end_request() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let server_task = tokio::spawn(async move {
            // Drain the request: BEGIN_REQUEST, params until the empty
            // record, stdin until the empty record.
            let (begin_type, _, _) = read_record(&mut server).await.unwrap();
            assert_eq!(begin_type, FCGI_BEGIN_REQUEST);
            loop {
                let (record_type, _, content) = read_record(&mut server).await.unwrap();
                assert_eq!(record_type, FCGI_PARAMS);
                if content.is_empty() {
                    break;
                }
            }
            let mut body = Vec::new();
            loop {
                let (record_type, _, content) = read_record(&mut server).await.unwrap();
                assert_eq!(record_type, FCGI_STDIN);
                if content.is_empty() {
                    break;
                }
                body.extend_from_slice(&content);
            }
            assert_eq!(body, b"name=value");

            let mut reply = Vec::new();
            encode_record(
                &mut reply,
                FCGI_STDOUT,
                b"Content-Type: text/html\r\n\r\n<b>ok</b>",
            );
            let end_body = [0u8, 0, 0, 0, 0, 0, 0, 0];
            encode_record(&mut reply, FCGI_END_REQUEST, &end_body);
            server.write_all(&reply).await.unwrap();
        });

        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let request = GatewayRequest::testing(Method::POST, "/index.php", peer);
        let params = request_params(
            &request,
            "/var/www",
            "/index.php",
            "/var/www/index.php",
            "php.test",
            "80",
        );
        let output = exchange(&mut client, &params, b"name=value").await.unwrap();
        server_task.await.unwrap();

        assert!(output.stdout.starts_with(b"Content-Type: text/html"));
        assert!(output.stderr.is_empty());
        assert_eq!(output.app_status, 0);
    }

    #[test]
    fn params_include_http_headers() {
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let request = GatewayRequest::testing(Method::GET, "/app.php?x=1", peer);
        let params = request_params(
            &request,
            "/srv/app",
            "/app.php",
            "/srv/app/app.php",
            "app.test",
            "8080",
        );
        let get = |key: &str| {
            params
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(get("REQUEST_METHOD"), Some("GET"));
        assert_eq!(get("QUERY_STRING"), Some("x=1"));
        assert_eq!(get("SCRIPT_FILENAME"), Some("/srv/app/app.php"));
        assert_eq!(get("SERVER_PORT"), Some("8080"));
    }
}
