// Single-datagram JSON codec for coordinator traffic.
//
// Every coordinator request and response is one UDP datagram holding one
// UTF-8 JSON document, with no length prefix or delimiter. The only framing
// concern is size: `MAX_DATAGRAM_SIZE` bounds both the coordinator's receive
// buffer and what `encode` will produce, so a response can never be silently
// truncated by a peer reading into a buffer of the same size.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Maximum payload of a coordinator datagram, in bytes.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("datagram too large: {len} bytes (max {MAX_DATAGRAM_SIZE})")]
    TooLarge { len: usize },

    #[error("empty datagram")]
    Empty,

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a message into a datagram payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, DatagramError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DatagramError::TooLarge { len: bytes.len() });
    }
    Ok(bytes)
}

/// Deserialize a datagram payload.
///
/// Returns `TooLarge` for payloads over `MAX_DATAGRAM_SIZE` and `Empty` for
/// zero-length datagrams before attempting to parse.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DatagramError> {
    if bytes.is_empty() {
        return Err(DatagramError::Empty);
    }
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DatagramError::TooLarge { len: bytes.len() });
    }
    Ok(serde_json::from_slice(bytes)?)
}
