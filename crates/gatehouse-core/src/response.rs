use bytes::Bytes;
use http::{
    header::{HeaderName, HeaderValue, CONTENT_LENGTH},
    HeaderMap, StatusCode,
};
use http_body_util::Full;
use serde::Serialize;
use serde_json::json;

use crate::error::{GatewayError, GatewayResult};

/// Response produced by a handler, converted to the wire by the listener.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn json<T: Serialize>(value: &T) -> GatewayResult<Self> {
        let payload = serde_json::to_vec(value)?;
        let mut response = Self::new(StatusCode::OK);
        response.set_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );
        response.body = Bytes::from(payload);
        Ok(response)
    }

    pub fn text(body: impl Into<String>) -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.set_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.body = Bytes::from(body.into());
        response
    }

    pub fn html(body: impl Into<String>) -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.set_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response.body = Bytes::from(body.into());
        response
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }

    /// Convert into a hyper response for the http1 connection driver.
    pub fn into_hyper(mut self) -> hyper::Response<Full<Bytes>> {
        self.ensure_content_length();
        let mut response = hyper::Response::builder()
            .status(self.status)
            .body(Full::new(self.body))
            .unwrap_or_else(|_| hyper::Response::new(Full::new(Bytes::new())));
        *response.headers_mut() = self.headers;
        response
    }

    fn ensure_content_length(&mut self) {
        if !self.headers.contains_key(CONTENT_LENGTH) {
            if let Ok(len) = HeaderValue::from_str(&self.body.len().to_string()) {
                self.headers.insert(CONTENT_LENGTH, len);
            }
        }
    }
}

impl From<GatewayError> for GatewayResponse {
    fn from(err: GatewayError) -> Self {
        let mut response = GatewayResponse::new(err.status_code());
        response.set_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );
        let payload = json!({ "error": err.to_string() });
        response.body = Bytes::from(serde_json::to_vec(&payload).unwrap_or_default());
        response
    }
}
