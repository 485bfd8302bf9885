//! Status-code-aware response decoding and shape casts.
//!
//! The success/failure boundary is status-code-driven: any non-2xx is
//! an error regardless of how well-formed the body is. A 2xx body is
//! decoded as JSON (empty bodies decode to `null`), then cast to the
//! shape the caller asked for.
//!
//! Two distinct failures at the cast step:
//! - [`SendError::UnexpectedType`]: the JSON has the wrong shape
//!   outright (a list where an object was expected)
//! - [`SendError::UnmappableValue`]: the shape is right but the value
//!   does not fit the target model (missing fields, wrong field types)

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SendError;

/// Decode a terminal response per the status contract.
///
/// Non-2xx fails with [`SendError::Status`] without looking at the
/// body. An empty 2xx body decodes to [`Value::Null`].
pub fn decode_response(status: u16, body: &[u8]) -> Result<Value, SendError> {
    if !(200..300).contains(&status) {
        return Err(SendError::Status { status });
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| SendError::MalformedResponse {
        message: e.to_string(),
    })
}

/// Cast a decoded value to a single object of type `T`.
pub fn expect_object<T: DeserializeOwned>(value: Value) -> Result<T, SendError> {
    if !value.is_object() {
        return Err(SendError::UnexpectedType { expected: "object" });
    }
    serde_json::from_value(value).map_err(|e| SendError::UnmappableValue {
        message: e.to_string(),
    })
}

/// Cast a decoded value to a list of objects of type `T`.
pub fn expect_list<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, SendError> {
    if !value.is_array() {
        return Err(SendError::UnexpectedType { expected: "list" });
    }
    serde_json::from_value(value).map_err(|e| SendError::UnmappableValue {
        message: e.to_string(),
    })
}
