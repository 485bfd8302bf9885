//! Requests, handler kinds, persisted task tags, and wire building.
//!
//! # Overview
//!
//! The coordinator separates **what to send** from **who reacts**:
//! - [`OutboundRequest`] = the immutable payload a caller wants delivered
//! - [`HandlerKind`] = the discriminator selecting which handler
//!   processes the eventual response
//!
//! A durable transfer outlives the coordinator that started it, so
//! everything needed to dispatch its completion travels with the task
//! itself as a [`TaskTag`] — opaque to the transport, serde
//! round-trippable, retrievable for the lifetime of the task.

use std::borrow::Cow;
use std::fmt;
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SendError;

/// Discriminator selecting which handler processes a response.
///
/// Kinds are registered at runtime by distinct subsystems; the
/// registry enforces one handler per kind. Use
/// [`HandlerKind::UNHANDLED`] for requests whose responses nobody
/// needs to observe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerKind(Cow<'static, str>);

impl HandlerKind {
    /// Sentinel kind for responses nobody observes.
    ///
    /// A no-op handler is seeded for this kind at construction time,
    /// so requests submitted without an explicit kind still resolve
    /// successfully.
    pub const UNHANDLED: HandlerKind = HandlerKind(Cow::Borrowed("unhandled"));

    /// Create a handler kind.
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self(kind.into())
    }

    /// The kind as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&'static str> for HandlerKind {
    fn from(kind: &'static str) -> Self {
        Self(Cow::Borrowed(kind))
    }
}

/// An immutable outbound request: a discriminated `kind` tag plus a
/// serializable payload.
///
/// Produced by callers; consumed read-only by the coordinator. The
/// `kind` here names the wire route (what the remote sees), which is
/// independent of the [`HandlerKind`] chosen at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Wire discriminator, appended to the connection endpoint.
    pub kind: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
}

impl OutboundRequest {
    /// Create a new outbound request.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Metadata attached to a durable transport task at submission time.
///
/// The tag is owned by the task itself so it survives process
/// restarts between submission and completion; the response
/// dispatcher retrieves it to recover the original request and the
/// handler kind. Exactly one tag exists per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTag {
    /// The original request, replayed to the handler on completion.
    pub request: OutboundRequest,
    /// Which handler processes the response.
    pub handler_kind: HandlerKind,
    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl TaskTag {
    /// Tag a request for a durable task.
    pub fn new(request: OutboundRequest, handler_kind: HandlerKind) -> Self {
        Self {
            request,
            handler_kind,
            submitted_at: Utc::now(),
        }
    }
}

/// Destination endpoint and auth context for outbound requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Base endpoint requests are addressed to.
    pub endpoint: String,
    /// Bearer token attached to uploads, if any.
    pub bearer_token: Option<String>,
}

impl Connection {
    /// Create a connection to `endpoint` with no auth.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: None,
        }
    }

    /// Attach a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Supplies the current connection context, if any.
///
/// Absence yields [`SendError::NoActiveSession`] from the send paths.
pub trait ConnectionProvider: Send + Sync {
    /// The currently active connection, or `None` when logged out /
    /// disconnected.
    fn current_connection(&self) -> Option<Connection>;
}

/// A [`ConnectionProvider`] backed by a swappable in-memory slot.
///
/// Convenient for applications with a single long-lived session and
/// for tests that flip between connected and disconnected states.
pub struct StaticConnectionProvider {
    current: Mutex<Option<Connection>>,
}

impl StaticConnectionProvider {
    /// Provider that always returns `connection`.
    pub fn new(connection: Connection) -> Self {
        Self {
            current: Mutex::new(Some(connection)),
        }
    }

    /// Provider with no session.
    pub fn disconnected() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Replace the current connection (or clear it with `None`).
    pub fn set(&self, connection: Option<Connection>) {
        *self.current.lock().expect("connection slot poisoned") = connection;
    }
}

impl ConnectionProvider for StaticConnectionProvider {
    fn current_connection(&self) -> Option<Connection> {
        self.current.lock().expect("connection slot poisoned").clone()
    }
}

/// A fully addressed upload, ready for a transport.
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// Absolute destination URL.
    pub url: String,
    /// Bearer token for the upload, if the connection carries one.
    pub bearer_token: Option<String>,
    /// Serialized request body (JSON).
    pub body: Bytes,
}

/// Build the wire request for `request` against the provider's
/// current connection.
///
/// Pure aside from the provider read: the body is the JSON encoding
/// of the whole request, so decoding it yields the identical request
/// back (nothing is mutated in transit through the registry).
///
/// # Errors
///
/// - [`SendError::NoActiveSession`] when no connection exists
/// - [`SendError::MalformedPayload`] when the payload cannot be
///   serialized
pub fn build_wire_request(
    provider: &dyn ConnectionProvider,
    request: &OutboundRequest,
) -> Result<WireRequest, SendError> {
    let connection = provider
        .current_connection()
        .ok_or(SendError::NoActiveSession)?;

    let body = serde_json::to_vec(request).map_err(|e| SendError::MalformedPayload {
        message: e.to_string(),
    })?;

    let url = format!(
        "{}/{}",
        connection.endpoint.trim_end_matches('/'),
        request.kind
    );

    Ok(WireRequest {
        url,
        bearer_token: connection.bearer_token,
        body: Bytes::from(body),
    })
}
