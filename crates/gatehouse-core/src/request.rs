use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{header::HeaderName, header::HOST, HeaderMap, HeaderValue, Method};
use url::form_urlencoded::parse as parse_query;

use crate::error::GatewayResult;
use crate::utils::normalize_path;

/// An inbound request as seen by the router and handlers: parsed target,
/// collected body, and the peer address of the originating connection.
#[derive(Clone, Debug)]
pub struct GatewayRequest {
    method: Method,
    path: String,
    target: String,
    query: HashMap<String, Vec<String>>,
    headers: HeaderMap,
    body: Bytes,
    peer: SocketAddr,
    local_port: String,
}

impl GatewayRequest {
    pub fn from_http_parts(
        method: Method,
        target: String,
        headers: HeaderMap,
        body: Bytes,
        peer: SocketAddr,
        local_port: String,
    ) -> GatewayResult<Self> {
        let (path, query) = split_target(&target);
        Ok(Self {
            method,
            path,
            target,
            query,
            headers,
            body,
            peer,
            local_port,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The original request target, including any query string.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn query_string(&self) -> &str {
        match self.target.find('?') {
            Some(idx) => &self.target[idx + 1..],
            None => "",
        }
    }

    pub fn host_header(&self) -> Option<&str> {
        self.headers
            .get(HOST)
            .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
    }

    /// Host header split into (host, port). The port defaults to the local
    /// listener port when the header does not carry one.
    pub fn host_and_port(&self) -> (String, String) {
        let raw = self.host_header().unwrap_or("");
        match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                (host.to_string(), port.to_string())
            }
            _ => (raw.to_string(), self.local_port.clone()),
        }
    }

    pub fn local_port(&self) -> &str {
        &self.local_port
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn query(&self) -> &HashMap<String, Vec<String>> {
        &self.query
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> GatewayResult<T> {
        let value = serde_json::from_slice(&self.body)?;
        Ok(value)
    }

    /// Client address for rate limiting: the first X-Forwarded-For entry,
    /// then X-Real-IP, then the connection peer without its port.
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        if let Some(real_ip) = self.headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
        self.peer.ip().to_string()
    }

    /// Rebase the request under `prefix`, preserving a leading `/` and the
    /// query string. Returns `None` when the path is not under the prefix.
    pub fn strip_prefix(&self, prefix: &str) -> Option<Self> {
        if prefix.is_empty() || prefix == "/" {
            return Some(self.clone());
        }
        if !self.path.starts_with(prefix) {
            return None;
        }
        let remainder = &self.path[prefix.len()..];
        let new_path = if remainder.is_empty() {
            "/".to_string()
        } else if remainder.starts_with('/') {
            remainder.to_string()
        } else {
            format!("/{remainder}")
        };
        let mut clone = self.clone();
        clone.target = match self.target.find('?') {
            Some(idx) => format!("{}{}", new_path, &self.target[idx..]),
            None => new_path.clone(),
        };
        clone.path = new_path;
        Some(clone)
    }

    #[cfg(test)]
    pub fn testing(method: Method, target: &str, peer: SocketAddr) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            target: target.to_string(),
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer,
            local_port: "80".to_string(),
        }
    }

    #[cfg(test)]
    pub fn testing_with(
        method: Method,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
        local_port: &str,
    ) -> Self {
        let peer: SocketAddr = "127.0.0.1:45000".parse().unwrap();
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            target: target.to_string(),
            query,
            headers,
            body,
            peer,
            local_port: local_port.to_string(),
        }
    }
}

fn split_target(target: &str) -> (String, HashMap<String, Vec<String>>) {
    let mut parts = target.splitn(2, '?');
    let path = normalize_path(parts.next().unwrap_or("/"));
    let query = parts.next();
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(q) = query {
        for (key, value) in parse_query(q.as_bytes()) {
            map.entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }
    (path, map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method};

    #[test]
    fn strip_prefix_adjusts_path_and_target() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let request = GatewayRequest::testing(Method::GET, "/api/users?id=10", peer);
        let rebased = request.strip_prefix("/api").expect("prefix matches");
        assert_eq!(rebased.path(), "/users");
        assert_eq!(rebased.target(), "/users?id=10");
    }

    #[test]
    fn host_and_port_prefers_header_port() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("a.test:8443"));
        let request =
            GatewayRequest::testing_with(Method::GET, "/", headers, Bytes::new(), "80");
        assert_eq!(request.host_and_port(), ("a.test".into(), "8443".into()));
    }

    #[test]
    fn host_and_port_falls_back_to_listener_port() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("a.test"));
        let request =
            GatewayRequest::testing_with(Method::GET, "/", headers, Bytes::new(), "443");
        assert_eq!(request.host_and_port(), ("a.test".into(), "443".into()));
    }

    #[test]
    fn client_ip_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        let request =
            GatewayRequest::testing_with(Method::GET, "/", headers, Bytes::new(), "80");
        assert_eq!(request.client_ip(), "1.2.3.4");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        let request =
            GatewayRequest::testing_with(Method::GET, "/", headers, Bytes::new(), "80");
        assert_eq!(request.client_ip(), "5.6.7.8");

        let request = GatewayRequest::testing_with(
            Method::GET,
            "/",
            HeaderMap::new(),
            Bytes::new(),
            "80",
        );
        assert_eq!(request.client_ip(), "127.0.0.1");
    }
}
