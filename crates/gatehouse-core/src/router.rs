//! Request routing: virtual-host resolution, location and match-rule
//! selection, and dispatch through the handler chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cgi::CgiHandler;
use crate::config::{Config, Location, MatchRule, MimeType, VirtualHost};
use crate::error::GatewayResult;
use crate::php::PhpHandler;
use crate::proxy::ProxyHandler;
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::static_site::StaticSiteHandler;
use crate::utils;

/// Where requests land when no virtual host matches the Host header.
const DEFAULT_DOCUMENT_ROOT: &str = "/var/www/html";

/// A handler is a claim probe plus an executor. Handlers never write to
/// shared state; everything they need arrives in the effective host view.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn claims(&self, request: &GatewayRequest, host: &EffectiveHost) -> bool;

    async fn handle(
        &self,
        request: &GatewayRequest,
        host: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse>;
}

/// By-value view of a virtual host with location and match-rule overrides
/// applied. Built per request so concurrent config swaps can never tear a
/// handler's view.
#[derive(Debug, Clone, Default)]
pub struct EffectiveHost {
    pub server_name: String,
    pub document_root: String,
    pub directory_index: String,
    pub php_proxy_fcgi: String,
    pub cgi_path: String,
    pub proxy_unix_socket: String,
    pub proxy_path: String,
    pub proxy_type: String,
    pub server_port: String,
    pub mime_types: Arc<Vec<MimeType>>,
}

impl EffectiveHost {
    pub fn mime_lookup(&self, ext: &str) -> Option<&str> {
        self.mime_types
            .iter()
            .find(|mt| mt.ext.eq_ignore_ascii_case(ext))
            .map(|mt| mt.mime.as_str())
    }
}

pub struct Router {
    config: Arc<Config>,
    mime_types: Arc<Vec<MimeType>>,
    chain: Vec<Box<dyn RequestHandler>>,
}

impl Router {
    pub fn new(config: Arc<Config>) -> Self {
        let mime_types = Arc::new(config.mime_types.clone());
        Self {
            config,
            mime_types,
            // Probe order is fixed; the static handler always claims.
            chain: vec![
                Box::new(PhpHandler),
                Box::new(CgiHandler),
                Box::new(ProxyHandler),
                Box::new(StaticSiteHandler),
            ],
        }
    }

    /// Route a request and produce the response, translating errors into
    /// their status-coded bodies.
    pub async fn dispatch(&self, request: &GatewayRequest) -> GatewayResponse {
        match self.route(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(target: "gatehouse::serve", error = %err, path = %request.path(), "request failed");
                GatewayResponse::from(err)
            }
        }
    }

    async fn route(&self, request: &GatewayRequest) -> GatewayResult<GatewayResponse> {
        let (host, port) = request.host_and_port();

        let vhost = self
            .config
            .virtual_host(&host, &port)
            .or_else(|| {
                request
                    .host_header()
                    .and_then(|raw| self.config.virtual_host(raw, &port))
            })
            .or_else(|| self.config.virtual_host(&host, ""));

        let Some(vhost) = vhost else {
            tracing::debug!(target: "gatehouse::serve", %host, %port, "no virtual host matched, serving default root");
            let fallback = EffectiveHost {
                server_name: host,
                document_root: DEFAULT_DOCUMENT_ROOT.to_string(),
                directory_index: self.config.directory_index.clone(),
                server_port: port,
                mime_types: Arc::clone(&self.mime_types),
                ..EffectiveHost::default()
            };
            return StaticSiteHandler.handle(request, &fallback).await;
        };

        let fs_candidate = PathBuf::from(&vhost.document_root)
            .join(request.path().trim_start_matches('/'));
        let location = vhost.location_for(request.path(), Some(&fs_candidate));

        let rule = match location {
            Some(loc) if !loc.match_rules.is_empty() => {
                let file_name = candidate_file_name(
                    request,
                    &fs_candidate,
                    effective_directory_index(None, Some(loc), vhost, &self.config),
                );
                loc.match_rule_for(&file_name)
            }
            _ => None,
        };

        let directory_index =
            effective_directory_index(rule, location, vhost, &self.config).to_string();
        let view = self.effective_host(vhost, location, rule, &port, directory_index);

        if let Some(loc) = location {
            tracing::debug!(
                target: "gatehouse::serve",
                location = %loc.path,
                handler = %loc.handler,
                rule = rule.map(|r| r.pattern.as_str()).unwrap_or(""),
                "location selected"
            );
        }

        let declared = rule
            .map(|r| r.handler.as_str())
            .filter(|h| !h.is_empty())
            .or_else(|| location.map(|l| l.handler.as_str()).filter(|h| !h.is_empty()));

        if let Some(kind) = declared {
            return self.run_declared(kind, request, &view).await;
        }

        for handler in &self.chain {
            if handler.claims(request, &view) {
                return handler.handle(request, &view).await;
            }
        }
        // The static handler claims everything; this is unreachable in
        // practice but keeps the chain honest.
        StaticSiteHandler.handle(request, &view).await
    }

    async fn run_declared(
        &self,
        kind: &str,
        request: &GatewayRequest,
        view: &EffectiveHost,
    ) -> GatewayResult<GatewayResponse> {
        match kind {
            "proxy" => ProxyHandler.handle(request, view).await,
            "cgi" => CgiHandler.handle(request, view).await,
            "php" => PhpHandler.handle(request, view).await,
            "static" => StaticSiteHandler.handle(request, view).await,
            other => {
                tracing::warn!(target: "gatehouse::serve", handler = %other, "unknown handler kind in location");
                Err(crate::error::GatewayError::Internal(format!(
                    "unknown handler kind: {other}"
                )))
            }
        }
    }

    fn effective_host(
        &self,
        vhost: &VirtualHost,
        location: Option<&Location>,
        rule: Option<&MatchRule>,
        port: &str,
        directory_index: String,
    ) -> EffectiveHost {
        let mut view = EffectiveHost {
            server_name: vhost.server_name.clone(),
            document_root: vhost.document_root.clone(),
            directory_index,
            php_proxy_fcgi: vhost.php_proxy_fcgi.clone(),
            cgi_path: vhost.cgi_path.clone(),
            proxy_unix_socket: vhost.proxy_unix_socket.clone(),
            proxy_path: vhost.proxy_path.clone(),
            proxy_type: vhost.proxy_type.clone(),
            server_port: port.to_string(),
            mime_types: Arc::clone(&self.mime_types),
        };

        if let Some(loc) = location {
            apply_override(&mut view.proxy_unix_socket, &loc.proxy_unix_socket);
            apply_override(&mut view.proxy_type, &loc.proxy_type);
            apply_override(&mut view.php_proxy_fcgi, &loc.php_proxy_fcgi);
            if loc.handler == "cgi" {
                view.cgi_path = if loc.cgi_path.is_empty() {
                    loc.path.clone()
                } else {
                    loc.cgi_path.clone()
                };
            } else {
                apply_override(&mut view.cgi_path, &loc.cgi_path);
            }
            if loc.handler == "proxy" {
                view.proxy_path = loc.path.clone();
            }
        }
        if let Some(rule) = rule {
            apply_override(&mut view.proxy_unix_socket, &rule.proxy_unix_socket);
            apply_override(&mut view.proxy_type, &rule.proxy_type);
            apply_override(&mut view.php_proxy_fcgi, &rule.php_proxy_fcgi);
            apply_override(&mut view.cgi_path, &rule.cgi_path);
        }
        view
    }
}

fn apply_override(base: &mut String, value: &str) {
    if !value.is_empty() {
        *base = value.to_string();
    }
}

/// Directory index resolution: match rule > location > virtual host > global.
fn effective_directory_index<'a>(
    rule: Option<&'a MatchRule>,
    location: Option<&'a Location>,
    vhost: &'a VirtualHost,
    config: &'a Config,
) -> &'a str {
    if let Some(rule) = rule {
        if !rule.directory_index.is_empty() {
            return &rule.directory_index;
        }
    }
    if let Some(location) = location {
        if !location.directory_index.is_empty() {
            return &location.directory_index;
        }
    }
    config.directory_index_for(Some(vhost))
}

/// The file name tested against match rules: the URL basename, or the chosen
/// index file when the URL resolves to a directory.
fn candidate_file_name(
    request: &GatewayRequest,
    fs_candidate: &Path,
    directory_index: &str,
) -> String {
    let name = utils::url_basename(request.path());
    let is_dir = std::fs::metadata(fs_candidate)
        .map(|meta| meta.is_dir())
        .unwrap_or_else(|_| name.is_empty());
    if !is_dir {
        return name;
    }
    utils::find_index_file(fs_candidate, directory_index)
        .unwrap_or_else(|| "index.html".to_string())
}
