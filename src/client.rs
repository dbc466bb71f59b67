//! RPC client: many outstanding calls multiplexed on one connection.
//!
//! Every call is tagged with a sequence number (strictly increasing
//! from 1) and parked in a pending map as a oneshot sender. One receive
//! task owns the read half: it routes each incoming frame to its waiter
//! by seq, drops frames nobody is waiting for, and on a transport error
//! fails every pending call at once.
//!
//! Lock discipline: `sending` (async) wraps a whole send, register
//! included, and is always acquired before the state mutex. The state
//! mutex guards the pending map, the seq counter, and the two
//! monotonic flags `closing` (user called `close`) and `shutdown`
//! (transport error).
//!
//! Abandoning a call ([`Call`] dropped, or a timeout wrapper dropping
//! the future) removes the pending entry locally; the server is not
//! informed, and its eventual response is discarded by the receive
//! loop.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::codec::{CodecType, Header};
use crate::conn::Conn;
use crate::error::RpcError;
use crate::options::Options;
use crate::server::{read_http_head, CONNECTED, DEFAULT_RPC_PATH};

struct ClientState {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Vec<u8>, RpcError>>>,
    closing: bool,
    shutdown: bool,
}

struct ClientCore {
    conn: Conn,
    sending: AsyncMutex<()>,
    state: Mutex<ClientState>,
}

impl ClientCore {
    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<Result<Vec<u8>, RpcError>>> {
        self.state.lock().pending.remove(&seq)
    }

    async fn receive_loop(self: Arc<Self>) {
        let err = loop {
            let (header, body) = match self.conn.recv_frame().await {
                Err(e) => break e,
                Ok(frame) => frame,
            };
            match self.remove_call(header.seq) {
                // Nobody is waiting: the call was abandoned. Drop the frame.
                None => {
                    tracing::trace!(seq = header.seq, "response without a pending call, dropped")
                }
                Some(tx) => {
                    let result = if header.error.is_empty() {
                        Ok(body)
                    } else {
                        Err(RpcError::Remote(header.error))
                    };
                    let _ = tx.send(result);
                }
            }
        };
        tracing::debug!(error = %err, "receive loop ends");
        self.terminate_calls(err).await;
    }

    /// Fail every pending call with `err` and mark the client shut down.
    async fn terminate_calls(&self, err: RpcError) {
        let _sending = self.sending.lock().await;
        let mut state = self.state.lock();
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// An in-flight call. Resolve it with [`Call::done`]; dropping it
/// abandons the call and frees its pending slot.
pub struct Call<R> {
    raw: RawCall,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Call<R> {
    /// The sequence number this call was registered under.
    pub fn seq(&self) -> u64 {
        self.raw.seq
    }

    /// Wait for the response and decode the reply.
    pub async fn done(self) -> Result<R, RpcError> {
        let codec = self.raw.codec;
        let body = self.raw.done().await?;
        codec.decode(&body)
    }
}

struct RawCall {
    core: Arc<ClientCore>,
    codec: CodecType,
    seq: u64,
    rx: oneshot::Receiver<Result<Vec<u8>, RpcError>>,
}

impl RawCall {
    async fn done(mut self) -> Result<Vec<u8>, RpcError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            // Sender gone without a result: the client shut down under us.
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

impl Drop for RawCall {
    fn drop(&mut self) {
        // No-op once the receive loop has delivered; seqs are never reused.
        self.core.remove_call(self.seq);
    }
}

/// A client over one connection.
pub struct Client {
    core: Arc<ClientCore>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    fn new(conn: Conn) -> Self {
        let core = Arc::new(ClientCore {
            conn,
            sending: AsyncMutex::new(()),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        tokio::spawn(core.clone().receive_loop());
        Self { core }
    }

    /// Dial a TCP server, racing connect plus handshake against the
    /// connect timeout (zero disables the race).
    pub async fn dial(addr: &str, opt: Options) -> Result<Self, RpcError> {
        let opt = opt.normalized();
        let connect = async {
            let stream = TcpStream::connect(addr).await?;
            let conn = Conn::connect(stream, &opt).await?;
            Ok(Self::new(conn))
        };
        if opt.connect_timeout.is_zero() {
            return connect.await;
        }
        match tokio::time::timeout(opt.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectTimeout(opt.connect_timeout)),
        }
    }

    /// Dial an HTTP server and upgrade the connection with `CONNECT`
    /// before the normal handshake.
    pub async fn dial_http(addr: &str, opt: Options) -> Result<Self, RpcError> {
        let opt = opt.normalized();
        let connect = async {
            let mut stream = TcpStream::connect(addr).await?;
            http_connect(&mut stream).await?;
            let conn = Conn::connect(stream, &opt).await?;
            Ok(Self::new(conn))
        };
        if opt.connect_timeout.is_zero() {
            return connect.await;
        }
        match tokio::time::timeout(opt.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectTimeout(opt.connect_timeout)),
        }
    }

    /// Dial an `protocol@host:port` address: `http@` goes through the
    /// CONNECT tunnel, anything else is a direct TCP dial.
    pub async fn x_dial(rpc_addr: &str, opt: Options) -> Result<Self, RpcError> {
        let (protocol, addr) = rpc_addr
            .split_once('@')
            .ok_or_else(|| RpcError::BadAddress(rpc_addr.to_string()))?;
        match protocol {
            "http" => Self::dial_http(addr, opt).await,
            _ => Self::dial(addr, opt).await,
        }
    }

    /// Fire a call and return a handle resolving to its reply.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Result<Call<R>, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let codec = self.core.conn.codec();
        let body = codec.encode(args)?;
        let (seq, rx) = self.send(service_method, &body).await?;
        Ok(Call {
            raw: RawCall { core: self.core.clone(), codec, seq, rx },
            _reply: PhantomData,
        })
    }

    /// Call a named method and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.done().await
    }

    /// Like [`Client::call`] with a deadline. On expiry the call is
    /// abandoned locally and a "call failed" error is returned; the
    /// server's eventual response is discarded by the receive loop.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: std::time::Duration,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        match tokio::time::timeout(timeout, self.call(service_method, args)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::CallFailed("deadline exceeded".to_string())),
        }
    }

    pub(crate) async fn call_raw(
        &self,
        service_method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let (seq, rx) = self.send(service_method, body).await?;
        RawCall { core: self.core.clone(), codec: self.core.conn.codec(), seq, rx }
            .done()
            .await
    }

    /// Register the call and write its frame, all under the sending
    /// lock so frames leave in registration order.
    async fn send(
        &self,
        service_method: &str,
        body: &[u8],
    ) -> Result<(u64, oneshot::Receiver<Result<Vec<u8>, RpcError>>), RpcError> {
        let core = &self.core;
        let _sending = core.sending.lock().await;
        let (seq, rx) = {
            let mut state = core.state.lock();
            if state.closing || state.shutdown {
                return Err(RpcError::Shutdown);
            }
            let seq = state.seq;
            state.seq += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(seq, tx);
            (seq, rx)
        };
        let header = Header::request(service_method, seq);
        if let Err(e) = core.conn.send_frame(&header, body).await {
            core.remove_call(seq);
            return Err(e);
        }
        Ok((seq, rx))
    }

    /// True until `close()` is called or the transport fails.
    pub fn is_available(&self) -> bool {
        let state = self.core.state.lock();
        !state.shutdown && !state.closing
    }

    /// Close the connection. Repeat calls return the shutdown sentinel.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut state = self.core.state.lock();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.core.conn.close().await;
        Ok(())
    }
}

/// Send the CONNECT preamble and check the server's status line.
async fn http_connect(stream: &mut TcpStream) -> Result<(), RpcError> {
    stream
        .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n").as_bytes())
        .await?;
    let head = read_http_head(stream).await?;
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.contains(CONNECTED) {
        return Err(RpcError::Handshake(format!(
            "unexpected HTTP response: {status_line}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Ping {
        value: u64,
    }

    /// A client wired to a bare peer connection over an in-memory pipe.
    async fn pair() -> (Client, Conn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let opt = Options::default();
        let (client_conn, peer) = tokio::join!(Conn::connect(a, &opt), Conn::accept(b));
        (Client::new(client_conn.unwrap()), peer.unwrap().0)
    }

    #[tokio::test]
    async fn seq_starts_at_one_and_increases() {
        let (client, peer) = pair().await;
        let first: Call<u64> = client.go("Echo.Ping", &Ping { value: 1 }).await.unwrap();
        let second: Call<u64> = client.go("Echo.Ping", &Ping { value: 2 }).await.unwrap();
        assert_eq!(first.seq(), 1);
        assert_eq!(second.seq(), 2);
        drop(peer);
    }

    #[tokio::test]
    async fn responses_route_by_seq_in_any_order() {
        let (client, peer) = pair().await;
        let first: Call<u64> = client.go("Echo.Ping", &Ping { value: 10 }).await.unwrap();
        let second: Call<u64> = client.go("Echo.Ping", &Ping { value: 20 }).await.unwrap();

        // Drain both requests, then respond to the second one first.
        let mut seqs = Vec::new();
        for _ in 0..2 {
            let (header, _) = peer.recv_frame().await.unwrap();
            seqs.push(header.seq);
        }
        assert_eq!(seqs, vec![1, 2]);
        let reply = |seq: u64, value: u64| {
            let body = peer.codec().encode(&value).unwrap();
            (Header::request("Echo.Ping", seq), body)
        };
        let (h2, b2) = reply(2, 40);
        peer.send_frame(&h2, &b2).await.unwrap();
        let (h1, b1) = reply(1, 20);
        peer.send_frame(&h1, &b1).await.unwrap();

        assert_eq!(second.done().await.unwrap(), 40);
        assert_eq!(first.done().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn remote_error_surfaces_on_the_call() {
        let (client, peer) = pair().await;
        let call: Call<u64> = client.go("Echo.Ping", &Ping { value: 1 }).await.unwrap();
        let (mut header, _) = peer.recv_frame().await.unwrap();
        header.error = "boom".to_string();
        let body = peer.codec().encode(&()).unwrap();
        peer.send_frame(&header, &body).await.unwrap();
        assert_eq!(call.done().await.unwrap_err(), RpcError::Remote("boom".to_string()));
    }

    #[tokio::test]
    async fn transport_error_terminates_pending_calls() {
        let (client, peer) = pair().await;
        let call: Call<u64> = client.go("Echo.Ping", &Ping { value: 1 }).await.unwrap();
        let _ = peer.recv_frame().await.unwrap();
        peer.close().await;
        assert!(call.done().await.is_err());
        // The client is shut down for good.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!client.is_available());
        let again = client.go::<_, u64>("Echo.Ping", &Ping { value: 2 }).await;
        assert!(matches!(again, Err(RpcError::Shutdown)));
    }

    #[tokio::test]
    async fn close_is_idempotent_with_sentinel() {
        let (client, peer) = pair().await;
        assert!(client.close().await.is_ok());
        assert!(matches!(client.close().await, Err(RpcError::Shutdown)));
        assert!(!client.is_available());
        let call = client.go::<_, u64>("Echo.Ping", &Ping { value: 1 }).await;
        assert!(matches!(call, Err(RpcError::Shutdown)));
        drop(peer);
    }

    #[tokio::test]
    async fn abandoned_calls_free_their_pending_slot() {
        let (client, peer) = pair().await;
        let call: Call<u64> = client.go("Echo.Ping", &Ping { value: 1 }).await.unwrap();
        let seq = call.seq();
        drop(call);
        assert!(client.core.remove_call(seq).is_none());
        drop(peer);
    }
}
