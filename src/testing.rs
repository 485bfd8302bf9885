//! In-memory transports and sinks for tests.
//!
//! [`MemoryTransport`] is a scriptable durable transport: tests (or
//! downstream crates, via the `testing` feature) drive terminal
//! outcomes by hand with [`complete`], [`fail`] and [`feed`], and
//! observe what the coordinator asked for through the recorded
//! submit/start/cancel logs.
//!
//! [`complete`]: MemoryTransport::complete
//! [`fail`]: MemoryTransport::fail
//! [`feed`]: MemoryTransport::feed

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SendError;
use crate::notify::{Notification, NotificationSink};
use crate::request::{TaskTag, WireRequest};
use crate::transport::{
    DurableTransport, EphemeralTransport, InflightTask, TaskId, TaskOutcome, TransportEvent,
    WireResponse, EVENT_CHANNEL_CAPACITY,
};

struct MemoryTask {
    tag: Option<TaskTag>,
    finished: bool,
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<TaskId, MemoryTask>,
    submitted: Vec<TaskId>,
    started: Vec<TaskId>,
    cancelled: Vec<TaskId>,
}

/// Scriptable in-memory durable transport.
pub struct MemoryTransport {
    events: mpsc::Sender<TransportEvent>,
    inner: Mutex<MemoryInner>,
}

impl MemoryTransport {
    /// Create the transport together with its event channel.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                events: tx,
                inner: Mutex::new(MemoryInner::default()),
            }),
            rx,
        )
    }

    /// Deliver a successful terminal outcome for `task`.
    pub async fn complete(&self, task: TaskId, status: u16, body: &[u8]) {
        if !self.mark_finished(task) {
            return;
        }
        if !body.is_empty() {
            let _ = self
                .events
                .send(TransportEvent::Data {
                    task,
                    chunk: Bytes::copy_from_slice(body),
                })
                .await;
        }
        let _ = self
            .events
            .send(TransportEvent::Finished {
                task,
                outcome: TaskOutcome::Delivered { status },
            })
            .await;
    }

    /// Deliver a transport-layer failure for `task`.
    pub async fn fail(&self, task: TaskId, message: &str) {
        if !self.mark_finished(task) {
            return;
        }
        let _ = self
            .events
            .send(TransportEvent::Finished {
                task,
                outcome: TaskOutcome::Failed {
                    message: message.to_string(),
                },
            })
            .await;
    }

    /// Deliver a chunk of response bytes without finishing the task.
    pub async fn feed(&self, task: TaskId, chunk: &[u8]) {
        let _ = self
            .events
            .send(TransportEvent::Data {
                task,
                chunk: Bytes::copy_from_slice(chunk),
            })
            .await;
    }

    /// Plant a task with no retrievable metadata, as a transport
    /// might report after losing its tag store.
    pub fn seed_orphan(&self) -> TaskId {
        let task = TaskId::new();
        self.inner.lock().unwrap().tasks.insert(
            task,
            MemoryTask {
                tag: None,
                finished: false,
            },
        );
        task
    }

    /// Tasks submitted, in order.
    pub fn submitted(&self) -> Vec<TaskId> {
        self.inner.lock().unwrap().submitted.clone()
    }

    /// Number of tasks ever submitted.
    pub fn submit_count(&self) -> usize {
        self.inner.lock().unwrap().submitted.len()
    }

    /// The most recently submitted task.
    pub fn last_submitted(&self) -> Option<TaskId> {
        self.inner.lock().unwrap().submitted.last().copied()
    }

    /// Tasks started, in order.
    pub fn started(&self) -> Vec<TaskId> {
        self.inner.lock().unwrap().started.clone()
    }

    /// Tasks cancelled, in order.
    pub fn cancelled(&self) -> Vec<TaskId> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    fn mark_finished(&self, task: TaskId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(&task) {
            Some(entry) if !entry.finished => {
                entry.finished = true;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl DurableTransport for MemoryTransport {
    async fn submit(&self, _wire: WireRequest, tag: TaskTag) -> Result<TaskId, SendError> {
        let task = TaskId::new();
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(
            task,
            MemoryTask {
                tag: Some(tag),
                finished: false,
            },
        );
        inner.submitted.push(task);
        Ok(task)
    }

    async fn start(&self, task: TaskId) {
        self.inner.lock().unwrap().started.push(task);
    }

    async fn cancel(&self, task: TaskId) {
        let newly_finished = {
            let mut inner = self.inner.lock().unwrap();
            match inner.tasks.get_mut(&task) {
                Some(entry) if !entry.finished => {
                    entry.finished = true;
                    inner.cancelled.push(task);
                    true
                }
                _ => false,
            }
        };
        if newly_finished {
            let _ = self
                .events
                .send(TransportEvent::Finished {
                    task,
                    outcome: TaskOutcome::Cancelled,
                })
                .await;
        }
    }

    async fn inventory(&self) -> Vec<InflightTask> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|(_, t)| !t.finished)
            .map(|(id, t)| InflightTask {
                id: *id,
                tag: t.tag.clone(),
            })
            .collect()
    }

    async fn metadata(&self, task: TaskId) -> Option<TaskTag> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .get(&task)
            .and_then(|t| t.tag.clone())
    }

    async fn flush(&self) {
        let _ = self.events.send(TransportEvent::Drained).await;
    }
}

/// Ephemeral transport answering from a scripted response queue.
///
/// An empty queue answers `200` with an empty body, so tests that do
/// not care about the response need no setup.
pub struct ScriptedEphemeral {
    responses: Mutex<VecDeque<Result<WireResponse, SendError>>>,
    uploads: Mutex<Vec<WireRequest>>,
}

impl ScriptedEphemeral {
    /// Create an empty script.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response.
    pub fn push_response(&self, status: u16, body: &[u8]) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(WireResponse {
                status,
                body: Bytes::copy_from_slice(body),
            }));
    }

    /// Queue a transport failure.
    pub fn push_error(&self, error: SendError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Number of uploads performed.
    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    /// The recorded uploads, in order.
    pub fn uploads(&self) -> Vec<WireRequest> {
        self.uploads.lock().unwrap().clone()
    }
}

impl Default for ScriptedEphemeral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralTransport for ScriptedEphemeral {
    async fn upload(&self, wire: WireRequest) -> Result<WireResponse, SendError> {
        self.uploads.lock().unwrap().push(wire);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(WireResponse {
                status: 200,
                body: Bytes::new(),
            }))
    }
}

/// Notification sink that records every post.
pub struct CollectingSink {
    posted: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self {
            posted: Mutex::new(Vec::new()),
        }
    }

    /// Notifications posted so far, in order.
    pub fn posted(&self) -> Vec<Notification> {
        self.posted.lock().unwrap().clone()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    async fn post(&self, notification: Notification) -> anyhow::Result<()> {
        self.posted.lock().unwrap().push(notification);
        Ok(())
    }
}
