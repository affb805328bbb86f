//! Administrative REST surface: CRUD over the configuration snapshot.
//!
//! Mutations validate by recompiling location patterns, persist the
//! pretty-printed JSON to the config path, and swap the in-memory snapshot
//! through the copy-on-write channel. The serving path picks the new
//! snapshot up on its next request; a restart is still required for
//! listener-level changes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use http::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use http::StatusCode;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::{Config, Location, VirtualHost};
use crate::error::{GatewayError, GatewayResult};
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;

#[derive(Clone)]
pub struct AdminApi {
    config_tx: Arc<watch::Sender<Arc<Config>>>,
    config_path: PathBuf,
}

impl AdminApi {
    pub fn new(config_tx: watch::Sender<Arc<Config>>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_tx: Arc::new(config_tx),
            config_path: config_path.into(),
        }
    }

    fn current(&self) -> Arc<Config> {
        self.config_tx.borrow().clone()
    }

    /// Serve the admin API until shutdown. Binds the configured admin port.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
        let addr = format!("0.0.0.0:{}", self.current().admin_port());
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        tracing::info!(target: "gatehouse::admin", %addr, "admin api listening");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(target: "gatehouse::admin", "admin api stopping");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let api = self.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let api = api.clone();
                                    async move {
                                        let response = match convert(req, peer).await {
                                            Ok(request) => api.handle(&request).await,
                                            Err(err) => GatewayResponse::from(err),
                                        };
                                        Ok::<_, std::convert::Infallible>(response.into_hyper())
                                    }
                                });
                                let _ = hyper::server::conn::http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await;
                            });
                        }
                        Err(err) => {
                            tracing::warn!(target: "gatehouse::admin", error = %err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
    }

    /// Route one admin request. Split out from the connection loop so the
    /// surface is testable without sockets.
    pub async fn handle(&self, request: &GatewayRequest) -> GatewayResponse {
        let config = self.current();

        if let Err(response) = authorize(request, &config) {
            return response;
        }

        let path = request.path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let method = request.method().as_str();

        let result = match (method, segments.as_slice()) {
            ("GET", ["api", "v1", "health"]) => GatewayResponse::json(&json!({"status": "ok"})),
            ("GET", ["api", "v1", "config"]) => GatewayResponse::json(config.as_ref()),
            ("PUT", ["api", "v1", "config"]) => self.put_config(request),
            ("POST", ["api", "v1", "config", "reload"]) => self.reload_config(),
            ("GET", ["api", "v1", "stats"]) => GatewayResponse::json(&json!({
                "virtualHosts": config.virtual_hosts.len(),
                "ports": config.all_listen_ports(),
                "mimeTypes": config.mime_types.len(),
            })),
            ("GET", ["api", "v1", "virtualhosts"]) => {
                GatewayResponse::json(&config.virtual_hosts)
            }
            ("POST", ["api", "v1", "virtualhosts"]) => self.create_virtual_host(request),
            ("GET", ["api", "v1", "virtualhosts", name]) => match config.virtual_host(name, "") {
                Some(vhost) => GatewayResponse::json(vhost),
                None => Err(GatewayError::NotFound(format!("virtual host {name}"))),
            },
            ("PUT", ["api", "v1", "virtualhosts", name]) => {
                self.update_virtual_host(name, request)
            }
            ("DELETE", ["api", "v1", "virtualhosts", name]) => self.delete_virtual_host(name),
            ("GET", ["api", "v1", "virtualhosts", name, "locations"]) => {
                match config.virtual_host(name, "") {
                    Some(vhost) => GatewayResponse::json(&vhost.locations),
                    None => Err(GatewayError::NotFound(format!("virtual host {name}"))),
                }
            }
            ("POST", ["api", "v1", "virtualhosts", name, "locations"]) => {
                self.create_location(name, request)
            }
            ("PUT", ["api", "v1", "virtualhosts", name, "locations", index]) => {
                self.update_location(name, index, request)
            }
            ("DELETE", ["api", "v1", "virtualhosts", name, "locations", index]) => {
                self.delete_location(name, index)
            }
            _ => Err(GatewayError::NotFound(path.clone())),
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(target: "gatehouse::admin", %path, error = %err, "admin request failed");
                GatewayResponse::from(err)
            }
        }
    }

    fn put_config(&self, request: &GatewayRequest) -> GatewayResult<GatewayResponse> {
        let mut incoming: Config = request.json()?;
        incoming.compile_all_patterns()?;
        self.persist_and_swap(incoming.clone())?;
        GatewayResponse::json(&json!({
            "message": "configuration updated",
            "config": incoming,
        }))
    }

    fn reload_config(&self) -> GatewayResult<GatewayResponse> {
        let reloaded = Config::load(&self.config_path)?;
        self.config_tx.send_replace(Arc::new(reloaded));
        GatewayResponse::json(&json!({"message": "configuration reloaded"}))
    }

    fn create_virtual_host(&self, request: &GatewayRequest) -> GatewayResult<GatewayResponse> {
        let mut vhost: VirtualHost = request.json()?;
        if vhost.server_name.is_empty() {
            return Err(GatewayError::BadRequest("serverName is required".into()));
        }
        vhost.compile_patterns()?;

        let mut config = (*self.current()).clone();
        if config.virtual_host(&vhost.server_name, "").is_some() {
            let response = GatewayResponse::json(&json!({"error": "virtual host already exists"}))?
                .with_status(StatusCode::CONFLICT);
            return Ok(response);
        }
        config.virtual_hosts.push(vhost.clone());
        self.persist_and_swap(config)?;
        Ok(GatewayResponse::json(&vhost)?.with_status(StatusCode::CREATED))
    }

    fn update_virtual_host(
        &self,
        name: &str,
        request: &GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        let mut vhost: VirtualHost = request.json()?;
        vhost.compile_patterns()?;

        let mut config = (*self.current()).clone();
        let slot = config
            .virtual_hosts
            .iter_mut()
            .find(|v| v.server_name == name)
            .ok_or_else(|| GatewayError::NotFound(format!("virtual host {name}")))?;
        *slot = vhost.clone();
        self.persist_and_swap(config)?;
        GatewayResponse::json(&vhost)
    }

    fn delete_virtual_host(&self, name: &str) -> GatewayResult<GatewayResponse> {
        let mut config = (*self.current()).clone();
        let before = config.virtual_hosts.len();
        config.virtual_hosts.retain(|v| v.server_name != name);
        if config.virtual_hosts.len() == before {
            return Err(GatewayError::NotFound(format!("virtual host {name}")));
        }
        self.persist_and_swap(config)?;
        GatewayResponse::json(&json!({"message": "virtual host deleted"}))
    }

    fn create_location(
        &self,
        name: &str,
        request: &GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        let location: Location = request.json()?;
        let mut config = (*self.current()).clone();
        let vhost = config
            .virtual_hosts
            .iter_mut()
            .find(|v| v.server_name == name)
            .ok_or_else(|| GatewayError::NotFound(format!("virtual host {name}")))?;
        vhost.locations.push(location.clone());
        vhost.compile_patterns()?;
        self.persist_and_swap(config)?;
        Ok(GatewayResponse::json(&location)?.with_status(StatusCode::CREATED))
    }

    fn update_location(
        &self,
        name: &str,
        index: &str,
        request: &GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        let index: usize = index
            .parse()
            .map_err(|_| GatewayError::BadRequest("invalid location index".into()))?;
        let location: Location = request.json()?;

        let mut config = (*self.current()).clone();
        let vhost = config
            .virtual_hosts
            .iter_mut()
            .find(|v| v.server_name == name)
            .ok_or_else(|| GatewayError::NotFound(format!("virtual host {name}")))?;
        if index >= vhost.locations.len() {
            return Err(GatewayError::NotFound(format!("location {index}")));
        }
        vhost.locations[index] = location.clone();
        vhost.compile_patterns()?;
        self.persist_and_swap(config)?;
        GatewayResponse::json(&location)
    }

    fn delete_location(&self, name: &str, index: &str) -> GatewayResult<GatewayResponse> {
        let index: usize = index
            .parse()
            .map_err(|_| GatewayError::BadRequest("invalid location index".into()))?;

        let mut config = (*self.current()).clone();
        let vhost = config
            .virtual_hosts
            .iter_mut()
            .find(|v| v.server_name == name)
            .ok_or_else(|| GatewayError::NotFound(format!("virtual host {name}")))?;
        if index >= vhost.locations.len() {
            return Err(GatewayError::NotFound(format!("location {index}")));
        }
        vhost.locations.remove(index);
        self.persist_and_swap(config)?;
        GatewayResponse::json(&json!({"message": "location deleted"}))
    }

    fn persist_and_swap(&self, config: Config) -> GatewayResult<()> {
        let serialized = serde_json::to_string_pretty(&config)?;
        std::fs::write(&self.config_path, serialized)?;
        self.config_tx.send_replace(Arc::new(config));
        Ok(())
    }
}

/// IP whitelist, then bearer token, then Basic credentials. Credential
/// comparisons are constant time.
fn authorize(request: &GatewayRequest, config: &Config) -> Result<(), GatewayResponse> {
    if !config.admin_ip_whitelist.is_empty() {
        let client = request.peer().ip().to_string();
        if !config.admin_ip_whitelist.iter().any(|ip| *ip == client) {
            return Err(GatewayResponse::from(GatewayError::Forbidden(
                "ip not whitelisted".into(),
            )));
        }
    }

    if !config.admin_auth_enabled {
        return Ok(());
    }

    let header = request
        .header(&AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if !config.admin_token.is_empty() {
        if let Some(token) = header.strip_prefix("Bearer ") {
            if constant_time_eq(token, &config.admin_token) {
                return Ok(());
            }
        }
    }

    if let Some(encoded) = header.strip_prefix("Basic ") {
        if let Ok(decoded) = BASE64_STANDARD.decode(encoded.trim()) {
            if let Ok(credentials) = String::from_utf8(decoded) {
                if let Some((username, password)) = credentials.split_once(':') {
                    let user_ok = constant_time_eq(username, &config.admin_username);
                    let pass_ok = constant_time_eq(password, &config.admin_password);
                    if user_ok && pass_ok {
                        return Ok(());
                    }
                }
            }
        }
    }

    let mut response = GatewayResponse::from(GatewayError::Unauthorized);
    response.set_header(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Gatehouse Admin\""),
    );
    Err(response)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

async fn convert(
    req: hyper::Request<hyper::body::Incoming>,
    peer: SocketAddr,
) -> GatewayResult<GatewayRequest> {
    use http_body_util::BodyExt;
    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|err| GatewayError::BadRequest(format!("failed to read request body: {err}")))?
        .to_bytes();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    GatewayRequest::from_http_parts(parts.method, target, parts.headers, bytes, peer, String::new())
}
