//! Error types.
//!
//! A single [`RpcError`] enum covers every failure class in the crate:
//! protocol and handshake problems, framing, dispatch misses, handler
//! failures, timeouts, shutdown, and registry traffic. The enum is
//! `Clone` because a transport-fatal error fans out to every pending
//! call on a client; I/O errors are therefore carried as text rather
//! than as `std::io::Error` values.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// I/O failure on the underlying stream.
    Io(String),
    /// The connection is closed (EOF or poisoned by a write error).
    Closed,
    /// The client was used after `close()`.
    Shutdown,
    /// Handshake carried the wrong magic number.
    InvalidMagic(u32),
    /// Handshake options could not be decoded (bad JSON, unknown codec).
    Handshake(String),
    /// Value serialization failed.
    Encode(String),
    /// Value deserialization failed.
    Decode(String),
    /// A frame exceeded the size sanity limit.
    FrameTooLarge(u32),
    /// `ServiceMethod` has no `.` separator.
    IllFormedServiceMethod(String),
    ServiceNotFound(String),
    MethodNotFound(String),
    /// A service with this name is already registered.
    DuplicateService(String),
    /// Service names must start with an uppercase letter.
    InvalidServiceName(String),
    /// The remote side reported an error for this call.
    Remote(String),
    /// The handler failed (or panicked) on the server side.
    Handler(String),
    /// Request handling exceeded the negotiated timeout.
    HandleTimeout(Duration),
    /// Dial plus handshake exceeded the connect timeout.
    ConnectTimeout(Duration),
    /// The call was abandoned before a response arrived.
    CallFailed(String),
    /// The discovery has no servers to offer.
    NoAvailableServers,
    /// Registry HTTP traffic failed.
    Registry(String),
    /// An RPC address did not match `protocol@host:port`.
    BadAddress(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Closed => write!(f, "connection closed"),
            Self::Shutdown => write!(f, "connection is shut down"),
            Self::InvalidMagic(got) => write!(f, "invalid magic number {got:#x}"),
            Self::Handshake(msg) => write!(f, "invalid options: {msg}"),
            Self::Encode(msg) => write!(f, "encode error: {msg}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::FrameTooLarge(len) => write!(f, "frame of {len} bytes exceeds limit"),
            Self::IllFormedServiceMethod(sm) => {
                write!(f, "service/method request ill-formed: {sm}")
            }
            Self::ServiceNotFound(name) => write!(f, "can't find service {name}"),
            Self::MethodNotFound(name) => write!(f, "can't find method {name}"),
            Self::DuplicateService(name) => write!(f, "service already defined: {name}"),
            Self::InvalidServiceName(name) => write!(f, "{name} is not a valid service name"),
            Self::Remote(msg) => write!(f, "{msg}"),
            Self::Handler(msg) => write!(f, "handler error: {msg}"),
            Self::HandleTimeout(t) => {
                write!(f, "request handle timeout: expect within {t:?}")
            }
            Self::ConnectTimeout(t) => write!(f, "connect timeout: expect within {t:?}"),
            Self::CallFailed(cause) => write!(f, "call failed: {cause}"),
            Self::NoAvailableServers => write!(f, "no available servers"),
            Self::Registry(msg) => write!(f, "registry error: {msg}"),
            Self::BadAddress(addr) => {
                write!(f, "wrong address format '{addr}', expect protocol@addr")
            }
        }
    }
}

impl std::error::Error for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Io(e.to_string())
        }
    }
}

impl RpcError {
    /// Shorthand for a handler-side application error.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_messages_mention_timeout() {
        let e = RpcError::HandleTimeout(Duration::from_millis(500));
        assert!(e.to_string().contains("timeout"));
        let e = RpcError::ConnectTimeout(Duration::from_secs(10));
        assert!(e.to_string().contains("timeout"));
    }

    #[test]
    fn eof_maps_to_closed() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(RpcError::from(io), RpcError::Closed);
    }
}
