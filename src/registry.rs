//! The registry: an HTTP index of live servers with TTL expiry.
//!
//! Servers announce themselves with a `POST` carrying their address in
//! the `X-Tinyrpc-Server` header, and keep themselves alive by
//! heartbeating the same request. Clients `GET` the path and read the
//! sorted, comma-joined live list from `X-Tinyrpc-Servers`. Expired
//! entries are evicted lazily when the list is built.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::error::RpcError;

/// Registry HTTP path.
pub const DEFAULT_REGISTRY_PATH: &str = "/_tinyrpc_/registry";

/// Servers not heard from for this long are considered dead.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header listing live servers.
pub const SERVERS_HEADER: &str = "X-Tinyrpc-Servers";

/// Request header carrying one server's address.
pub const SERVER_HEADER: &str = "X-Tinyrpc-Server";

pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// A zero `timeout` means entries never expire.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, servers: Mutex::new(HashMap::new()) }
    }

    /// Insert `addr` or refresh its start timestamp.
    pub fn put_server(&self, addr: &str) {
        self.servers.lock().insert(addr.to_string(), Instant::now());
    }

    /// Live addresses, sorted ascending. Expired entries are evicted.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock();
        let now = Instant::now();
        servers.retain(|_, start| self.timeout.is_zero() || *start + self.timeout > now);
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// The axum router serving this registry at the default path.
    /// `GET` lists, `POST` announces, anything else is 405.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(DEFAULT_REGISTRY_PATH, get(list_servers).post(announce_server))
            .with_state(self)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(path = DEFAULT_REGISTRY_PATH, "registry serving");
        axum::serve(listener, self.router()).await
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    ([(SERVERS_HEADER, registry.alive_servers().join(","))], ())
}

async fn announce_server(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    match headers
        .get(SERVER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|addr| !addr.is_empty())
    {
        Some(addr) => {
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

static DEFAULT_REGISTRY: LazyLock<Arc<Registry>> =
    LazyLock::new(|| Arc::new(Registry::new(DEFAULT_REGISTRY_TIMEOUT)));

/// The process-wide default registry.
pub fn default_registry() -> Arc<Registry> {
    DEFAULT_REGISTRY.clone()
}

/// Announce `addr` to the registry at `registry_url` now and then on a
/// period, stopping at the first failed POST.
///
/// The first heartbeat runs before this returns so a dead registry
/// fails fast; the periodic loop runs on its own task. The default
/// period keeps one heartbeat inside every TTL window with a minute to
/// spare.
pub async fn heartbeat(
    registry_url: &str,
    addr: &str,
    period: Option<Duration>,
) -> Result<(), RpcError> {
    let period =
        period.unwrap_or(DEFAULT_REGISTRY_TIMEOUT - Duration::from_secs(60));
    let http = reqwest::Client::new();
    send_heartbeat(&http, registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await; // the immediate first tick
        loop {
            tick.tick().await;
            if send_heartbeat(&http, &registry_url, &addr).await.is_err() {
                return;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(
    http: &reqwest::Client,
    registry_url: &str,
    addr: &str,
) -> Result<(), RpcError> {
    tracing::debug!(addr, registry = registry_url, "send heartbeat");
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "heartbeat failed");
            RpcError::Registry(e.to_string())
        })?;
    Ok(())
}
