//! RPC server: accept loop, handshake validation, per-connection frame
//! loop, and per-request dispatch with an optional handling timeout.
//!
//! Concurrency shape, per connection:
//!
//! - one task reads frames in a loop;
//! - every well-formed request is dispatched on its own task (tracked
//!   by a `JoinSet`, which plays the wait-group role: a read error ends
//!   the loop but in-flight handlers finish before the codec closes);
//! - the handler body runs under `spawn_blocking` and reports through a
//!   oneshot; the supervising request task is the only writer for its
//!   request. If the handle timeout fires first, the supervisor sends
//!   the timeout response and drops the receiver, so a late handler
//!   completion lands in a dead channel and can never produce a second
//!   frame for the same seq.
//!
//! Response headers echo the request `seq` unchanged; the server never
//! allocates sequence numbers.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::codec::Header;
use crate::conn::Conn;
use crate::error::RpcError;
use crate::options::{Options, MAGIC_NUMBER};
use crate::service::{Method, Service};

/// Path an HTTP CONNECT must name to reach the RPC stream.
pub const DEFAULT_RPC_PATH: &str = "/_tinyrpc_";

/// Status text both sides of the CONNECT upgrade agree on.
pub(crate) const CONNECTED: &str = "200 Connected to tinyrpc";

/// Upper bound on an HTTP request or response head during the upgrade.
const MAX_HTTP_HEAD: usize = 8 * 1024;

pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self { services: RwLock::new(HashMap::new()) }
    }

    /// Publish a service. Registration is rejected for duplicate names.
    pub fn register(&self, service: Service) -> Result<(), RpcError> {
        let mut services = self.services.write();
        if services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }
        tracing::info!(service = %service.name(), "register service");
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Resolve `Service.Method`, splitting at the last `.`.
    fn find_method(&self, service_method: &str) -> Result<Arc<Method>, RpcError> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| RpcError::IllFormedServiceMethod(service_method.to_string()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))
    }

    /// Accept connections until the listener fails, serving each on its
    /// own task.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    return;
                }
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_conn(stream).await });
                }
            }
        }
    }

    /// Serve one raw connection: handshake, then the frame loop.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (conn, opt) = match Conn::accept(stream).await {
            Err(e) => {
                tracing::warn!(error = %e, "options error");
                return;
            }
            Ok(accepted) => accepted,
        };
        if opt.magic_number != MAGIC_NUMBER {
            tracing::warn!(error = %RpcError::InvalidMagic(opt.magic_number), "handshake rejected");
            return;
        }
        self.serve_codec(Arc::new(conn), opt).await;
    }

    async fn serve_codec(self: Arc<Self>, conn: Arc<Conn>, opt: Options) {
        let mut in_flight = JoinSet::new();
        loop {
            let (mut header, body) = match conn.recv_frame().await {
                Err(e) => {
                    tracing::debug!(error = %e, "serve loop ends");
                    break;
                }
                Ok(frame) => frame,
            };
            match self.find_method(&header.service_method) {
                Err(e) => {
                    header.error = e.to_string();
                    send_response(&conn, &header, &placeholder(&conn)).await;
                }
                Ok(method) => {
                    in_flight.spawn(handle_request(
                        conn.clone(),
                        header,
                        method,
                        body,
                        opt.handle_timeout,
                    ));
                }
            }
        }
        // Wait-group: let in-flight handlers respond before closing.
        while in_flight.join_next().await.is_some() {}
        conn.close().await;
    }

    /// Accept HTTP connections, upgrading `CONNECT` requests into the
    /// raw RPC stream.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    return;
                }
                Ok((stream, _)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_connect(stream).await });
                }
            }
        }
    }

    /// Handle one would-be CONNECT upgrade.
    pub async fn serve_connect(self: Arc<Self>, mut stream: TcpStream) {
        let head = match read_http_head(&mut stream).await {
            Err(e) => {
                tracing::debug!(error = %e, "bad CONNECT preamble");
                return;
            }
            Ok(head) => head,
        };
        let request_line = head.lines().next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let (method, path) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
        if method != "CONNECT" {
            let _ = stream
                .write_all(
                    b"HTTP/1.0 405 Method Not Allowed\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\r\n\
                      405 must CONNECT\n",
                )
                .await;
            return;
        }
        if path != DEFAULT_RPC_PATH {
            let _ = stream.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
            return;
        }
        if stream
            .write_all(format!("HTTP/1.0 {CONNECTED}\r\n\r\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
        self.serve_conn(stream).await;
    }
}

async fn handle_request(
    conn: Arc<Conn>,
    mut header: Header,
    method: Arc<Method>,
    body: Vec<u8>,
    timeout: Duration,
) {
    let codec = conn.codec();
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = tx.send(method.invoke(codec, &body));
    });

    let outcome = if timeout.is_zero() {
        rx.await
    } else {
        tokio::select! {
            outcome = rx => outcome,
            _ = tokio::time::sleep(timeout) => {
                header.error = RpcError::HandleTimeout(timeout).to_string();
                send_response(&conn, &header, &placeholder(&conn)).await;
                return;
            }
        }
    };

    match outcome {
        Ok(Ok(reply)) => send_response(&conn, &header, &reply).await,
        Ok(Err(e)) => {
            header.error = e.to_string();
            send_response(&conn, &header, &placeholder(&conn)).await;
        }
        // The sender was dropped without a result: the handler panicked.
        Err(_) => {
            header.error = RpcError::Handler("handler panicked".to_string()).to_string();
            send_response(&conn, &header, &placeholder(&conn)).await;
        }
    }
}

/// Body placeholder for error responses.
fn placeholder(conn: &Conn) -> Vec<u8> {
    conn.codec().encode(&()).unwrap_or_default()
}

async fn send_response(conn: &Conn, header: &Header, body: &[u8]) {
    if let Err(e) = conn.send_frame(header, body).await {
        tracing::warn!(error = %e, seq = header.seq, "write response error");
    }
}

/// Read one HTTP head (request or response) byte by byte, stopping at
/// the blank line. Byte-at-a-time keeps the stream position exact: the
/// bytes after the head belong to the RPC handshake.
pub(crate) async fn read_http_head<S>(stream: &mut S) -> Result<String, RpcError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    loop {
        let byte = stream.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > MAX_HTTP_HEAD {
            return Err(RpcError::Handshake("HTTP head too large".to_string()));
        }
    }
    String::from_utf8(head).map_err(|e| RpcError::Handshake(e.to_string()))
}

static DEFAULT_SERVER: LazyLock<Arc<Server>> = LazyLock::new(|| Arc::new(Server::new()));

/// The process-wide default server.
pub fn default_server() -> Arc<Server> {
    DEFAULT_SERVER.clone()
}

/// Publish a service on the default server.
pub fn register(service: Service) -> Result<(), RpcError> {
    default_server().register(service)
}

/// Run the default server's accept loop on `listener`.
pub async fn accept(listener: TcpListener) {
    default_server().accept(listener).await
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct SumArgs {
        num1: i32,
        num2: i32,
    }

    fn test_server() -> Server {
        let server = Server::new();
        server
            .register(
                Service::build("Foo")
                    .method("Sum", |args: SumArgs, reply: &mut i32| {
                        *reply = args.num1 + args.num2;
                        Ok(())
                    })
                    .finish()
                    .unwrap(),
            )
            .unwrap();
        server
    }

    #[test]
    fn find_method_resolves_at_the_last_dot() {
        let server = test_server();
        assert!(server.find_method("Foo.Sum").is_ok());
        assert!(matches!(
            server.find_method("FooSum"),
            Err(RpcError::IllFormedServiceMethod(_))
        ));
        assert!(matches!(server.find_method("Bar.Sum"), Err(RpcError::ServiceNotFound(_))));
        assert!(matches!(server.find_method("Foo.Nope"), Err(RpcError::MethodNotFound(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let server = test_server();
        let dup = Service::build("Foo").finish().unwrap();
        assert!(matches!(server.register(dup), Err(RpcError::DuplicateService(_))));
    }
}
