//! JSON encoding of stored values.
//!
//! Decoding is lenient: a value that cannot be decoded is reported and
//! treated as absent instead of failing the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Serializes a value for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

/// Deserializes a stored value, yielding `None` when it is malformed.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, raw = %raw, "Discarding undecodable store value");
            None
        }
    }
}
