//! Response handlers and the per-kind handler registry.
//!
//! Handlers are the open set of reactions to completed responses.
//! They are **stateless** registered instances: the current
//! connection arrives via [`HandlerContext`], and the original
//! request travels with the task, so a handler needs no state of its
//! own.
//!
//! A handler also owns its kind's **replacement policy**:
//! [`Handler::should_replace`] decides whether a newer in-flight
//! request of the same kind supersedes an older one. The policy is a
//! pure decision; it is never consulted across kinds.
//!
//! # Example
//!
//! ```ignore
//! struct LocationHandler;
//!
//! #[async_trait]
//! impl Handler for LocationHandler {
//!     async fn handle(
//!         &self,
//!         request: &OutboundRequest,
//!         response: Result<Value, SendError>,
//!         _ctx: &HandlerContext,
//!     ) -> anyhow::Result<HandlerOutcome> {
//!         let ack = expect_object::<LocationAck>(response?)?;
//!         Ok(HandlerOutcome::with_notification(Notification::new(
//!             "Location shared",
//!             format!("acknowledged at {}", ack.received_at),
//!         )))
//!     }
//!
//!     fn should_replace(&self, _new: &OutboundRequest, _old: &OutboundRequest) -> bool {
//!         // A newer location update always supersedes an older one.
//!         true
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::SendError;
use crate::notify::Notification;
use crate::request::{Connection, HandlerKind, OutboundRequest};

/// Context passed to handler invocations.
///
/// Intentionally narrow: the connection snapshot taken at dispatch
/// time, nothing else. Handlers do not get access to the registry,
/// the transports, or other handlers.
pub struct HandlerContext {
    connection: Option<Connection>,
}

impl HandlerContext {
    pub(crate) fn new(connection: Option<Connection>) -> Self {
        Self { connection }
    }

    /// The connection active when the response was dispatched, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }
}

/// What a handler produced, beyond success/failure.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    /// Notification to post after the handler returns, if any.
    pub notification: Option<Notification>,
}

impl HandlerOutcome {
    /// An outcome with no side effects.
    pub fn none() -> Self {
        Self::default()
    }

    /// An outcome that posts a notification.
    pub fn with_notification(notification: Notification) -> Self {
        Self {
            notification: Some(notification),
        }
    }
}

/// A response handler for one registered kind.
#[async_trait]
pub trait Handler: Send + Sync {
    /// React to the terminal outcome of a request of this kind.
    ///
    /// `response` is the normalized network result: decoded JSON on
    /// success, the typed failure otherwise. Returning `Err` resolves
    /// the caller's waiter with [`SendError::Handler`]; the raw error
    /// is logged before sanitization.
    async fn handle(
        &self,
        request: &OutboundRequest,
        response: Result<Value, SendError>,
        ctx: &HandlerContext,
    ) -> anyhow::Result<HandlerOutcome>;

    /// Whether `new` supersedes an in-flight `old` of the same kind.
    ///
    /// Defaults to never replacing.
    fn should_replace(&self, _new: &OutboundRequest, _old: &OutboundRequest) -> bool {
        false
    }
}

/// No-op handler seeded for [`HandlerKind::UNHANDLED`].
struct UnhandledHandler;

#[async_trait]
impl Handler for UnhandledHandler {
    async fn handle(
        &self,
        request: &OutboundRequest,
        response: Result<Value, SendError>,
        _ctx: &HandlerContext,
    ) -> anyhow::Result<HandlerOutcome> {
        debug!(kind = %request.kind, ok = response.is_ok(), "unhandled response dropped");
        Ok(HandlerOutcome::none())
    }
}

/// Maps a handler kind to its handler, one registration per kind.
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a registry with the default unhandled-kind handler
    /// already seeded.
    pub fn new() -> Self {
        let mut handlers: HashMap<HandlerKind, Arc<dyn Handler>> = HashMap::new();
        handlers.insert(HandlerKind::UNHANDLED, Arc::new(UnhandledHandler));
        Self { handlers }
    }

    /// Register a handler for a kind.
    ///
    /// # Panics
    ///
    /// Panics if the kind is already registered — duplicate
    /// registration is a programmer error, not a runtime condition.
    /// Use [`HandlerRegistry::try_register`] for a non-panicking
    /// variant.
    pub fn register(&mut self, kind: HandlerKind, handler: Arc<dyn Handler>) {
        self.try_register(kind, handler).unwrap_or_else(|e| {
            panic!("{}", e);
        })
    }

    /// Register a handler for a kind, returning an error if one is
    /// already registered.
    pub fn try_register(
        &mut self,
        kind: HandlerKind,
        handler: Arc<dyn Handler>,
    ) -> Result<(), SendError> {
        if self.handlers.contains_key(&kind) {
            return Err(SendError::AlreadyRegistered { kind });
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Look up the handler for a kind. Absence is a normal, handled
    /// condition for the dispatcher (logged, response dropped).
    pub fn lookup(&self, kind: &HandlerKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }

    /// Whether a handler is registered for `kind`.
    pub fn has_handler(&self, kind: &HandlerKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Number of registered handlers (including the seeded default).
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Always false: the unhandled-kind handler is seeded at
    /// construction.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_count", &self.handlers.len())
            .finish_non_exhaustive()
    }
}
