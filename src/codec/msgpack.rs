//! MessagePack codec, the default.
//!
//! Structs are encoded as named maps so the format stays
//! self-describing across peers compiled from different sources.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RpcError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    rmp_serde::encode::to_vec_named(value).map_err(|e| RpcError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, RpcError> {
    rmp_serde::decode::from_slice(buf).map_err(|e| RpcError::Decode(e.to_string()))
}
