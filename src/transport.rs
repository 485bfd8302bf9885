//! Transport seams: ephemeral uploads and durable background tasks.
//!
//! Two transport modes with very different guarantees:
//! - [`EphemeralTransport`]: one request/response exchange, lost if
//!   the process dies mid-flight. No identity, no events.
//! - [`DurableTransport`]: OS-or-service-managed transfers that
//!   outlive the coordinator, identified by [`TaskId`], tagged with
//!   [`TaskTag`] metadata at submission, and reporting progress and
//!   completion as [`TransportEvent`]s over an `mpsc` channel created
//!   together with the transport.
//!
//! The event channel is the only path completions take; the
//! coordinator's completion loop is its single consumer, which is
//! what serializes all registry mutation.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::SendError;
use crate::request::{TaskTag, WireRequest};

/// Default capacity for transport event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identifier of a durable transport task.
///
/// Unique per transport session; reused across process restarts only
/// if the underlying transport guarantees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a fresh random task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response to an ephemeral upload: status plus raw body.
#[derive(Debug, Clone)]
pub struct WireResponse {
    /// HTTP-like status code.
    pub status: u16,
    /// Raw response body.
    pub body: Bytes,
}

/// Terminal state of a durable task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// All bytes delivered; the remote answered with `status`.
    Delivered {
        /// HTTP-like status code.
        status: u16,
    },
    /// The transfer failed at the transport layer.
    Failed {
        /// The underlying transport failure.
        message: String,
    },
    /// The task was cancelled before completion. Not an error: the
    /// dispatcher performs no handler dispatch and no waiter
    /// resolution for cancelled tasks.
    Cancelled,
}

/// Asynchronous delivery from a durable transport to the coordinator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A chunk of response bytes arrived for a running task.
    Data {
        /// The task the bytes belong to.
        task: TaskId,
        /// The received chunk, appended to the task's buffer.
        chunk: Bytes,
    },
    /// A task reached a terminal state.
    Finished {
        /// The task that finished.
        task: TaskId,
        /// How it finished.
        outcome: TaskOutcome,
    },
    /// The transport has delivered every pending event for the
    /// current wake window. Gates the host completion callback.
    Drained,
}

/// An entry in the durable transport's task inventory.
#[derive(Debug, Clone)]
pub struct InflightTask {
    /// The task identifier.
    pub id: TaskId,
    /// The tag attached at submission, if it could be retrieved.
    /// Tasks with no retrievable tag are orphans and get cancelled.
    pub tag: Option<TaskTag>,
}

/// Fire-and-forget request/response transport.
#[async_trait]
pub trait EphemeralTransport: Send + Sync {
    /// Upload `wire` and return the remote's response.
    ///
    /// Transport-layer failures (network, TLS, timeout) surface as
    /// [`SendError::Transport`]; status-contract enforcement is the
    /// decoder's job, not the transport's.
    async fn upload(&self, wire: WireRequest) -> Result<WireResponse, SendError>;
}

/// Durable background-transfer transport.
///
/// Implementations own task identity, metadata storage, and event
/// delivery. The coordinator never observes a task except through
/// this trait and the event channel.
#[async_trait]
pub trait DurableTransport: Send + Sync {
    /// Create a task for `wire`, attach `tag`, and return its
    /// identifier. The task does not run until [`start`] is called,
    /// giving the replacement pass a window to cancel stale peers.
    ///
    /// [`start`]: DurableTransport::start
    async fn submit(&self, wire: WireRequest, tag: TaskTag) -> Result<TaskId, SendError>;

    /// Start a previously submitted task. Unknown or already-started
    /// tasks are ignored.
    async fn start(&self, task: TaskId);

    /// Request cooperative cancellation of a task. The task may still
    /// deliver buffered `Data` events before its `Cancelled` terminal
    /// event arrives.
    async fn cancel(&self, task: TaskId);

    /// List currently known in-flight tasks. The inventory is
    /// asynchronous and may lag tasks started concurrently; the
    /// replacement coordinator accepts that window.
    async fn inventory(&self) -> Vec<InflightTask>;

    /// Retrieve the tag attached to `task`, if the transport still
    /// holds it.
    async fn metadata(&self, task: TaskId) -> Option<TaskTag>;

    /// Deliver every pending terminal event, then emit
    /// [`TransportEvent::Drained`]. Called once per wake window.
    async fn flush(&self);
}
