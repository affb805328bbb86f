//! Listener lifecycle: multi-port binding, privilege drop, per-connection
//! HTTP/1.1 serving, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::rate_limit::RateLimiter;
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::router::Router;

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const PRIVILEGED_PORT_LIMIT: u16 = 1024;

pub struct GatewayServer {
    config_rx: watch::Receiver<Arc<Config>>,
    limiter: Arc<RateLimiter>,
}

struct ServeState {
    config_rx: watch::Receiver<Arc<Config>>,
    limiter: Arc<RateLimiter>,
    in_flight: AtomicUsize,
}

impl GatewayServer {
    pub fn new(config_rx: watch::Receiver<Arc<Config>>) -> Self {
        let (max_requests, window) = config_rx.borrow().rate_limit();
        Self {
            config_rx,
            limiter: Arc::new(RateLimiter::new(max_requests, window)),
        }
    }

    /// Bind every configured port. A failure closes the listeners bound so
    /// far and is fatal.
    pub async fn bind(&self) -> GatewayResult<Vec<(String, TcpListener)>> {
        let config = self.config_rx.borrow().clone();
        let mut ports = config.all_listen_ports();
        if ports.is_empty() {
            tracing::warn!(target: "gatehouse::serve", "no listen ports configured, defaulting to 80");
            ports.push("80".to_string());
        }

        let needs_bind_first = requires_bind_before_drop(&config, &ports);
        if !needs_bind_first {
            apply_identity(&config, false)?;
        }

        let mut listeners = Vec::with_capacity(ports.len());
        for port in ports {
            let addr = format!("0.0.0.0:{port}");
            let listener = TcpListener::bind(&addr).await.map_err(|source| {
                GatewayError::Bind {
                    addr: addr.clone(),
                    source,
                }
            })?;
            tracing::info!(target: "gatehouse::serve", %addr, "listening");
            listeners.push((port, listener));
        }

        if needs_bind_first {
            apply_identity(&config, true)?;
        }

        Ok(listeners)
    }

    /// Serve until SIGINT or SIGTERM arrives.
    pub async fn run(self) -> GatewayResult<()> {
        let listeners = self.bind().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = shutdown_tx.send(true);
        });

        self.run_with_listeners(listeners, shutdown_rx).await
    }

    /// Accept connections on the given listeners until the shutdown signal
    /// flips, then drain in-flight requests for the grace period.
    pub async fn run_with_listeners(
        self,
        listeners: Vec<(String, TcpListener)>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> GatewayResult<()> {
        let state = Arc::new(ServeState {
            config_rx: self.config_rx,
            limiter: Arc::clone(&self.limiter),
            in_flight: AtomicUsize::new(0),
        });

        {
            let limiter = Arc::clone(&self.limiter);
            let reclaim_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                limiter.run_reclaimer(reclaim_shutdown).await;
            });
        }

        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for (port, listener) in listeners {
            let state = Arc::clone(&state);
            let shutdown = shutdown_rx.clone();
            accept_tasks.push(tokio::spawn(accept_loop(listener, port, state, shutdown)));
        }

        for task in accept_tasks {
            let _ = task.await;
        }

        drain_in_flight(&state).await;
        tracing::info!(target: "gatehouse::serve", "shutdown complete");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: String,
    state: Arc<ServeState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!(target: "gatehouse::serve", %port, "listener stopping");
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        let port = port.clone();
                        state.in_flight.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(stream, peer, port, &state).await {
                                tracing::debug!(target: "gatehouse::serve", %peer, error = %err, "connection ended with error");
                            }
                            state.in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(err) => {
                        tracing::warn!(target: "gatehouse::serve", %port, error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    port: String,
    state: &ServeState,
) -> Result<(), hyper::Error> {
    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let state_config = state.config_rx.clone();
        let limiter = Arc::clone(&state.limiter);
        let port = port.clone();
        async move {
            let response = handle_request(req, peer, &port, state_config, limiter).await;
            Ok::<_, std::convert::Infallible>(response.into_hyper())
        }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
}

async fn handle_request(
    req: hyper::Request<hyper::body::Incoming>,
    peer: SocketAddr,
    port: &str,
    config_rx: watch::Receiver<Arc<Config>>,
    limiter: Arc<RateLimiter>,
) -> GatewayResponse {
    let request = match convert_request(req, peer, port).await {
        Ok(request) => request,
        Err(err) => return GatewayResponse::from(err),
    };

    let client_ip = request.client_ip();
    if !limiter.allow(&client_ip) {
        tracing::warn!(target: "gatehouse::serve", client = %client_ip, "rate limit exceeded");
        return GatewayResponse::from(GatewayError::TooManyRequests(client_ip));
    }

    tracing::debug!(
        target: "gatehouse::serve",
        client = %client_ip,
        method = %request.method(),
        path = %request.path(),
        host = request.host_header().unwrap_or(""),
        "request"
    );

    // One snapshot per request; the admin surface swaps the pointer.
    let config = config_rx.borrow().clone();
    Router::new(config).dispatch(&request).await
}

async fn convert_request(
    req: hyper::Request<hyper::body::Incoming>,
    peer: SocketAddr,
    port: &str,
) -> GatewayResult<GatewayRequest> {
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
    GatewayRequest::from_http_parts(parts.method, target, parts.headers, bytes, peer, port.to_string())
}

async fn drain_in_flight(state: &ServeState) {
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while state.in_flight.load(Ordering::SeqCst) > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                target: "gatehouse::serve",
                remaining = state.in_flight.load(Ordering::SeqCst),
                "grace period expired with requests in flight"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(target: "gatehouse::serve", error = %err, "cannot install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(target: "gatehouse::serve", error = %err, "cannot install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = interrupt.recv() => tracing::info!(target: "gatehouse::serve", "SIGINT received"),
        _ = terminate.recv() => tracing::info!(target: "gatehouse::serve", "SIGTERM received"),
    }
}

/// Privileged ports with a configured identity and root privileges must be
/// bound before the identity switch.
fn requires_bind_before_drop(config: &Config, ports: &[String]) -> bool {
    let has_identity = !config.user.is_empty() || !config.group.is_empty();
    let has_privileged_port = ports
        .iter()
        .filter_map(|p| p.parse::<u16>().ok())
        .any(|p| p < PRIVILEGED_PORT_LIMIT);
    has_identity && has_privileged_port && nix::unistd::geteuid().is_root()
}

/// Switch to the configured identity. When `required` the failure is fatal
/// (privileged ports were bound as root); otherwise it downgrades to a
/// warning so unprivileged development runs keep working.
fn apply_identity(config: &Config, required: bool) -> GatewayResult<()> {
    if config.user.is_empty() && config.group.is_empty() {
        return Ok(());
    }
    match switch_identity(&config.user, &config.group) {
        Ok(()) => {
            tracing::info!(
                target: "gatehouse::serve",
                user = %config.user,
                group = %config.group,
                "switched process identity"
            );
            Ok(())
        }
        Err(err) if required => Err(err),
        Err(err) => {
            tracing::warn!(target: "gatehouse::serve", error = %err, "continuing without privilege drop");
            Ok(())
        }
    }
}

fn switch_identity(user: &str, group: &str) -> GatewayResult<()> {
    use nix::unistd::{setgid, setgroups, setuid, Group, User};

    let mut target_gid = None;
    if !group.is_empty() {
        let grp = Group::from_name(group)
            .map_err(|err| GatewayError::Privilege(format!("group lookup failed: {err}")))?
            .ok_or_else(|| GatewayError::Privilege(format!("no such group: {group}")))?;
        target_gid = Some(grp.gid);
    }

    let target_user = if user.is_empty() {
        None
    } else {
        let usr = User::from_name(user)
            .map_err(|err| GatewayError::Privilege(format!("user lookup failed: {err}")))?
            .ok_or_else(|| GatewayError::Privilege(format!("no such user: {user}")))?;
        if target_gid.is_none() {
            target_gid = Some(usr.gid);
        }
        Some(usr)
    };

    if let Some(gid) = target_gid {
        setgroups(&[gid])
            .map_err(|err| GatewayError::Privilege(format!("setgroups failed: {err}")))?;
        setgid(gid).map_err(|err| GatewayError::Privilege(format!("setgid failed: {err}")))?;
    }
    if let Some(usr) = target_user {
        setuid(usr.uid).map_err(|err| GatewayError::Privilege(format!("setuid failed: {err}")))?;
    }
    Ok(())
}
