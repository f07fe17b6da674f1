//! MessagePack payload helpers for hubs and callers.
//!
//! The transport never looks inside a payload; these helpers exist so hubs can turn
//! their typed parameters into the opaque bytes the envelope carries and back.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("payload decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("payload offset {offset} is past the end of a {len}-byte frame")]
    Offset { offset: usize, len: usize },
}

/// Serialize `value` into the bytes stored in an envelope's payload slot.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PayloadError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Deserialize the payload that starts at `offset` in `frame`.
///
/// A nil payload decodes into `()`, `Option::None`, or any other type that accepts nil.
pub fn decode<T: DeserializeOwned>(frame: &[u8], offset: usize) -> Result<T, PayloadError> {
    let bytes = frame.get(offset..).ok_or(PayloadError::Offset {
        offset,
        len: frame.len(),
    })?;
    Ok(rmp_serde::from_slice(bytes)?)
}
