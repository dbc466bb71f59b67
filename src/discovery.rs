//! Service discovery: where do the servers live?
//!
//! [`Discovery`] is the uniform seam the load-balanced client talks to.
//! [`MultiServers`] is the static, hand-maintained list;
//! [`RegistryDiscovery`] layers registry refresh on top of it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::error::RpcError;
use crate::registry::SERVERS_HEADER;

/// Load-balancing strategy for picking one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Bring the server list up to date from whatever backs it.
    async fn refresh(&self) -> Result<(), RpcError>;
    /// Replace the server list by hand.
    fn update(&self, servers: Vec<String>);
    /// Pick one server under the given strategy.
    async fn get(&self, mode: SelectMode) -> Result<String, RpcError>;
    /// All known servers.
    async fn get_all(&self) -> Result<Vec<String>, RpcError>;
}

struct ServerList {
    servers: Vec<String>,
    /// Round-robin cursor. Starts at 0.
    index: usize,
}

/// A static multi-server discovery with no registry behind it.
pub struct MultiServers {
    inner: RwLock<ServerList>,
}

impl MultiServers {
    pub fn new(servers: Vec<String>) -> Self {
        Self { inner: RwLock::new(ServerList { servers, index: 0 }) }
    }
}

#[async_trait]
impl Discovery for MultiServers {
    async fn refresh(&self) -> Result<(), RpcError> {
        // Nothing behind a static list.
        Ok(())
    }

    fn update(&self, servers: Vec<String>) {
        self.inner.write().servers = servers;
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        let mut inner = self.inner.write();
        let n = inner.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                Ok(inner.servers[rand::thread_rng().gen_range(0..n)].clone())
            }
            SelectMode::RoundRobin => {
                let picked = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(picked)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        Ok(self.inner.read().servers.clone())
    }
}

/// How long a fetched server list stays fresh.
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by the HTTP registry.
///
/// `get`/`get_all` refresh first; a refresh inside the freshness window
/// is a no-op, so registry traffic is bounded regardless of call rate.
pub struct RegistryDiscovery {
    servers: MultiServers,
    registry: String,
    refresh_timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `registry` is the full registry URL, e.g.
    /// `http://localhost:9999/_tinyrpc_/registry`. A zero `timeout`
    /// falls back to the 10 s default.
    pub fn new(registry: impl Into<String>, timeout: Duration) -> Self {
        let refresh_timeout =
            if timeout.is_zero() { DEFAULT_REFRESH_TIMEOUT } else { timeout };
        Self {
            servers: MultiServers::new(Vec::new()),
            registry: registry.into(),
            refresh_timeout,
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        {
            let last = self.last_update.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.refresh_timeout {
                    return Ok(());
                }
            }
        }
        tracing::debug!(registry = %self.registry, "refresh servers from registry");
        let resp = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))?;
        let listed = resp
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let servers: Vec<String> = listed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self.servers.update(servers);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }

    fn update(&self, servers: Vec<String>) {
        self.servers.update(servers);
        *self.last_update.lock() = Some(Instant::now());
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}
