//! Load-balanced multi-server client.
//!
//! `XClient` caches one [`Client`] per address and leans on a
//! [`Discovery`] to decide where calls go. `call` picks one server
//! under the configured strategy; `broadcast` fans a call out to every
//! server, cancelling the stragglers as soon as one of them fails.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};
use crate::error::RpcError;
use crate::options::Options;

pub struct XClient<D: Discovery> {
    inner: Arc<XClientInner<D>>,
}

struct XClientInner<D> {
    discovery: D,
    mode: SelectMode,
    opt: Options,
    clients: AsyncMutex<HashMap<String, Arc<Client>>>,
}

impl<D: Discovery + 'static> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, opt: Options) -> Self {
        Self {
            inner: Arc::new(XClientInner {
                discovery,
                mode,
                opt: opt.normalized(),
                clients: AsyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Call a named method on one server picked by the strategy.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.inner.discovery.get(self.inner.mode).await?;
        let client = self.inner.dial(&addr).await?;
        client.call(service_method, args).await
    }

    /// Fan the call out to every known server.
    ///
    /// The first failure wins: it is recorded, the remaining in-flight
    /// calls are cancelled, and later errors are dropped. On success
    /// the first reply to arrive is the one returned.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.inner.discovery.get_all().await?;
        let body = self.inner.opt.codec_type.encode(args)?;
        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<Result<Vec<u8>, RpcError>> = JoinSet::new();
        for addr in servers {
            let inner = self.inner.clone();
            let service_method = service_method.to_string();
            let body = body.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                tokio::select! {
                    result = inner.call_raw(&addr, &service_method, &body) => result,
                    _ = cancel.cancelled() => Err(RpcError::CallFailed("broadcast cancelled".to_string())),
                }
            });
        }

        let mut first_error: Option<RpcError> = None;
        let mut reply: Option<Vec<u8>> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(RpcError::Handler(e.to_string())));
            match result {
                Ok(body) => {
                    if reply.is_none() {
                        reply = Some(body);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        tracing::debug!(error = %e, "broadcast error, cancelling siblings");
                        first_error = Some(e);
                        cancel.cancel();
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                let body = reply.ok_or(RpcError::NoAvailableServers)?;
                self.inner.opt.codec_type.decode(&body)
            }
        }
    }

    /// Close every cached client and drop the cache.
    pub async fn close(&self) -> Result<(), RpcError> {
        let mut clients = self.inner.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
        Ok(())
    }
}

impl<D: Discovery> XClientInner<D> {
    /// Return the cached client for `addr`, replacing it if it has gone
    /// unavailable, or dial a fresh one.
    async fn dial(&self, addr: &str) -> Result<Arc<Client>, RpcError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            if let Some(stale) = clients.remove(addr) {
                let _ = stale.close().await;
            }
        }
        let client = Arc::new(Client::x_dial(addr, self.opt.clone()).await?);
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_raw(
        &self,
        addr: &str,
        service_method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let client = self.dial(addr).await?;
        client.call_raw(service_method, body).await
    }
}
