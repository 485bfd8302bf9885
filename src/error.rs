//! Structured error types for dispatch operations.
//!
//! `SendError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the waiter boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers)
//! - `SendError` is the only error callers observe, on both the
//!   ephemeral and durable paths
//!
//! Handler failures are sanitized into [`SendError::Handler`] by the
//! response dispatcher; the raw error is logged separately for
//! debugging.
//!
//! # Cloning
//!
//! `SendError` is `Clone` because a single terminal outcome may fan
//! out to several waiters: when a stale task is superseded, its
//! waiters are chained onto the superseding task and all of them
//! resolve with the same result.
//!
//! # Example
//!
//! ```ignore
//! match handle.send_ephemeral_value::<Profile>(&request).await {
//!     Ok(profile) => println!("got {}", profile.name),
//!     Err(SendError::NoActiveSession) => prompt_login(),
//!     Err(SendError::Status { status }) => eprintln!("rejected: {status}"),
//!     Err(e) => eprintln!("send failed: {e}"),
//! }
//! ```

use thiserror::Error;

use crate::request::HandlerKind;

/// Structured error type for dispatch operations.
///
/// Each variant includes context about what went wrong. Cancellation
/// is deliberately absent: a superseded task is not an error, its
/// waiters resolve with the superseding task's outcome instead.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// No connection context is available to address the request.
    #[error("no active connection session")]
    NoActiveSession,

    /// The durable path was asked to dispatch to a kind nobody
    /// registered. Surfaced before any network activity.
    #[error("no handler registered for kind {kind}")]
    UnregisteredKind {
        /// The kind that has no handler.
        kind: HandlerKind,
    },

    /// A handler is already registered for this kind.
    #[error("handler already registered for kind {kind}")]
    AlreadyRegistered {
        /// The kind that was registered twice.
        kind: HandlerKind,
    },

    /// The response decoded to JSON but not to the shape the caller
    /// asked for (object where a list was expected, and so on).
    #[error("response decoded to an unexpected shape: expected {expected}")]
    UnexpectedType {
        /// The shape the caller expected.
        expected: &'static str,
    },

    /// The response had the right JSON shape but does not fit the
    /// target model.
    #[error("decoded response does not fit the target model: {message}")]
    UnmappableValue {
        /// The underlying mapping failure.
        message: String,
    },

    /// The transport layer failed (connect, TLS, timeout, stream).
    #[error("transport failure: {message}")]
    Transport {
        /// The underlying transport failure.
        message: String,
    },

    /// The remote answered outside the 2xx contract. The body is
    /// irrelevant; status alone decides.
    #[error("request rejected with status {status}")]
    Status {
        /// The HTTP-like status code.
        status: u16,
    },

    /// A 2xx response body that is not valid JSON.
    #[error("malformed response body: {message}")]
    MalformedResponse {
        /// The underlying parse failure.
        message: String,
    },

    /// The request payload could not be serialized for the wire.
    #[error("request payload could not be serialized: {message}")]
    MalformedPayload {
        /// The underlying serialization failure.
        message: String,
    },

    /// The handler itself failed. Sanitized from the handler's
    /// internal `anyhow::Error`.
    #[error("handler failed: {message}")]
    Handler {
        /// The sanitized handler failure.
        message: String,
    },

    /// The completion channel was dropped before a result arrived.
    /// Terminal backstop so no caller ever hangs; seeing this outside
    /// deliberate cancellation indicates a coordinator bug.
    #[error("completion abandoned before resolution")]
    Abandoned,
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        SendError::Transport {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = SendError::UnregisteredKind {
            kind: HandlerKind::new("location"),
        };
        assert!(err.to_string().contains("no handler registered"));
        assert!(err.to_string().contains("location"));

        let err = SendError::Status { status: 404 };
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = SendError::UnexpectedType { expected: "list" };
        match &err {
            SendError::UnexpectedType { expected } => assert_eq!(*expected, "list"),
            _ => panic!("expected UnexpectedType"),
        }
    }

    #[test]
    fn test_error_is_cloneable_for_waiter_fanout() {
        let err = SendError::Transport {
            message: "connection reset".into(),
        };
        let copies = vec![err.clone(), err.clone(), err];
        for c in copies {
            assert!(c.to_string().contains("connection reset"));
        }
    }
}
