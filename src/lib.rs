//! # Courier
//!
//! A webhook dispatch and completion coordinator where requests ride
//! ephemeral or durable transports, handlers react to completed
//! responses, and wake windows close exactly once.
//!
//! ## Core Concepts
//!
//! Courier separates **sending** from **reacting**:
//! - [`OutboundRequest`] = What to deliver (immutable, serializable)
//! - [`Handler`] = Who reacts to the eventual response, selected by
//!   [`HandlerKind`]
//!
//! Two transport modes with different guarantees:
//! - **Ephemeral**: request/response in place, lost if the process
//!   dies mid-flight. Independent sends never interact.
//! - **Durable**: background transfers that outlive the coordinator,
//!   tracked in a task registry and completed via asynchronous
//!   transport events, possibly at a much later wake-up.
//!
//! ## Architecture
//!
//! ```text
//! caller ──send()──► replacement pass ──► DurableTransport ──► TaskRegistry
//!                                                                  │
//!    caller ──send_ephemeral()──► EphemeralTransport               │
//!                                                                  │
//!                       [async transport events]                   │
//!                               │                                  │
//!                               ▼                                  │
//!                       completion loop ──► ResponseDispatcher ◄───┘
//!                                                  │
//!                                     HandlerRegistry lookup
//!                                                  │
//!                                    handler invocation + sink
//!                                                  │
//!                                  waiter resolution, WakeGate
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Waiters resolve exactly once** - success, failure, or chained
//!    forward onto a superseding task; never zero times, never twice
//! 2. **Buffers are freed exactly once** - the registry entry is
//!    popped atomically on the terminal event, whatever the outcome
//! 3. **Registry mutation is serialized** - a single completion loop
//!    plus one submission at a time; no racing replacement decisions
//! 4. **Cancellation is not an error** - a superseded caller observes
//!    the superseding request's outcome, silently
//! 5. **The wake callback fires exactly once** - after the
//!    outstanding-work counter hits zero and the transport drains,
//!    whichever happens last
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier::{
//!     Connection, Courier, HandlerKind, HttpBackgroundTransport,
//!     HttpEphemeralTransport, OutboundRequest, StaticConnectionProvider,
//! };
//!
//! let connections = Arc::new(StaticConnectionProvider::new(
//!     Connection::new("https://hooks.example.com").with_bearer_token(token),
//! ));
//! let (durable, events) = HttpBackgroundTransport::new();
//!
//! let handle = Courier::builder(
//!     connections,
//!     Arc::new(HttpEphemeralTransport::new()),
//!     durable,
//!     events,
//! )
//! .with_handler(HandlerKind::new("location"), Arc::new(LocationHandler))
//! .build()
//! .start();
//!
//! // Fire-and-forget exchange, typed result in place.
//! let profile: Profile = handle
//!     .send_ephemeral_value(&OutboundRequest::new("profile", payload))
//!     .await?;
//!
//! // Durable send: resolves later, possibly superseded by a newer
//! // location update before it ever hits the wire.
//! handle
//!     .send(OutboundRequest::new("location", coords), HandlerKind::new("location"))
//!     .await
//!     .await?;
//!
//! // Host wake window: fires exactly once when all work drains.
//! handle.on_wake(|| wake_budget.finish());
//! ```
//!
//! ## What This Is Not
//!
//! Courier is **not**:
//! - A retry/backoff engine (failures propagate once)
//! - A payload mapper or notification formatter (collaborators own
//!   those)
//! - A persistence layer beyond the in-flight task registry
//!
//! Courier **is**:
//! > A dispatch coordinator where requests ride ephemeral or durable
//! > transports, handlers react, and wake windows close exactly once.

// Core modules
mod courier;
mod decode;
mod dispatch;
mod error;
mod handler;
mod http;
mod notify;
mod registry;
mod request;
mod transport;
mod wake;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export coordinator types (primary entry point)
pub use crate::courier::{Completion, Courier, CourierBuilder, CourierHandle};

// Re-export request types
pub use crate::request::{
    build_wire_request, Connection, ConnectionProvider, HandlerKind, OutboundRequest,
    StaticConnectionProvider, TaskTag, WireRequest,
};

// Re-export error types
pub use crate::error::SendError;

// Re-export decode helpers (status contract + shape casts)
pub use crate::decode::{decode_response, expect_list, expect_object};

// Re-export handler types
pub use crate::handler::{Handler, HandlerContext, HandlerOutcome, HandlerRegistry};

// Re-export notification types
pub use crate::notify::{Notification, NotificationSink, TracingSink};

// Re-export transport seams and adapters
pub use crate::http::{HttpBackgroundTransport, HttpEphemeralTransport};
pub use crate::transport::{
    DurableTransport, EphemeralTransport, InflightTask, TaskId, TaskOutcome, TransportEvent,
    WireResponse, EVENT_CHANNEL_CAPACITY,
};

// Re-export wake-window types
pub use crate::wake::{WakeGate, WorkGuard};

// Re-export commonly used external types
pub use async_trait::async_trait;
