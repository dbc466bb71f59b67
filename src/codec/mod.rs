//! Wire codecs: value serialization for `(Header, Body)` frames.
//!
//! A connection negotiates one [`CodecType`] during the handshake and
//! uses it for every frame until the connection closes. The codec only
//! concerns itself with turning values into bytes and back; framing
//! (length prefixes) lives in [`crate::conn`].
//!
//! `CodecType` doubles as the codec factory table: its serde renames
//! bind the wire strings, so an unknown codec name fails the handshake
//! decode and the server aborts the connection.

mod json;
mod msgpack;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Per-frame header, encoded by the negotiated codec.
///
/// `seq` is assigned by the client (starting at 1; 0 is reserved as
/// invalid) and echoed unchanged by the server. `error` is empty on
/// success and carries the server-side error text otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    #[serde(default)]
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self { service_method: service_method.into(), seq, error: String::new() }
    }
}

/// The available wire codecs.
///
/// MessagePack (self-describing binary) is the default; JSON is the
/// text alternative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecType {
    #[default]
    #[serde(rename = "application/msgpack")]
    Msgpack,
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, RpcError> {
        match self {
            Self::Msgpack => msgpack::encode(value),
            Self::Json => json::encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, RpcError> {
        match self {
            Self::Msgpack => msgpack::decode(buf),
            Self::Json => json::decode(buf),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Msgpack => write!(f, "application/msgpack"),
            Self::Json => write!(f, "application/json"),
        }
    }
}
