//! JSON codec.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RpcError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(value).map_err(|e| RpcError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, RpcError> {
    serde_json::from_slice(buf).map_err(|e| RpcError::Decode(e.to_string()))
}
