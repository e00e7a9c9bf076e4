pub mod dispatch;
pub mod membership;
pub mod session;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

/// Body payloads are opaque strings on the wire; these helpers do the per-verb JSON
///  encoding and log instead of propagating - a malformed payload abandons the one
///  operation it belongs to, nothing more.
pub(crate) fn encode<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(encoded) => Some(encoded),
        Err(e) => {
            error!("error encoding payload: {}", e);
            None
        }
    }
}

pub(crate) fn decode<T: DeserializeOwned>(body: &str) -> Option<T> {
    match serde_json::from_str(body) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            error!("error decoding payload: {}", e);
            None
        }
    }
}
