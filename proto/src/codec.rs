//! JSON payload convention layered on top of raw wire frames.
//!
//! A compact (no whitespace) JSON encoding used for every `method_call`/
//! `describe` argument and result frame.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// Serialize `value` as compact JSON, UTF-8 bytes.
pub fn serialize<T: Serialize>(value: &T) -> Result<Bytes, Error> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserialize a single frame produced by `serialize`.
pub fn deserialize<T: DeserializeOwned>(frame: &[u8]) -> Result<T, Error> {
    Ok(serde_json::from_slice(frame)?)
}
