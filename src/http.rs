//! HTTP transport adapters backed by reqwest.
//!
//! [`HttpEphemeralTransport`] is the fire-and-forget upload path.
//! [`HttpBackgroundTransport`] runs durable-style transfers on
//! spawned tasks: submissions are tagged and inventoried, transfers
//! stream response bytes as [`TransportEvent::Data`] chunks, and
//! cancellation is cooperative via a per-task token. Transfers here
//! survive coordinator churn within the process; surviving process
//! suspension is the concern of an OS-managed backend implementing
//! [`DurableTransport`] over its own task store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SendError;
use crate::request::{TaskTag, WireRequest};
use crate::transport::{
    DurableTransport, EphemeralTransport, InflightTask, TaskId, TaskOutcome, TransportEvent,
    WireResponse, EVENT_CHANNEL_CAPACITY,
};

/// Fire-and-forget HTTP upload transport.
pub struct HttpEphemeralTransport {
    client: Client,
}

impl HttpEphemeralTransport {
    /// Create a transport with a default client.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Create a transport over an existing client (shared pools,
    /// custom timeouts).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpEphemeralTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralTransport for HttpEphemeralTransport {
    async fn upload(&self, wire: WireRequest) -> Result<WireResponse, SendError> {
        let mut request = self
            .client
            .post(&wire.url)
            .header(CONTENT_TYPE, "application/json")
            .body(wire.body);
        if let Some(token) = &wire.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(WireResponse { status, body })
    }
}

enum TransferState {
    /// Submitted, wire request parked until `start`.
    Pending(WireRequest),
    Running,
    Finished,
}

struct BackgroundTask {
    tag: TaskTag,
    state: TransferState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ActiveTransfers {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveTransfers {
    fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn dec(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            // Register before checking: Notify is edge-triggered.
            let notified = self.idle.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// In-process durable transport over spawned reqwest transfers.
pub struct HttpBackgroundTransport {
    client: Client,
    events: mpsc::Sender<TransportEvent>,
    tasks: Arc<Mutex<HashMap<TaskId, BackgroundTask>>>,
    active: Arc<ActiveTransfers>,
}

impl HttpBackgroundTransport {
    /// Create the transport together with its event channel.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        Self::with_client(Client::new())
    }

    /// Create the transport over an existing client.
    pub fn with_client(client: Client) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                client,
                events: tx,
                tasks: Arc::new(Mutex::new(HashMap::new())),
                active: Arc::new(ActiveTransfers::default()),
            }),
            rx,
        )
    }

    fn settle(tasks: &Mutex<HashMap<TaskId, BackgroundTask>>, task: TaskId, outcome: &TaskOutcome) {
        let mut tasks = tasks.lock().expect("task store poisoned");
        match outcome {
            // Nobody retrieves a cancelled task's tag; discard now.
            TaskOutcome::Cancelled => {
                tasks.remove(&task);
            }
            // Delivered/Failed tags live until the dispatcher's
            // terminal metadata retrieval.
            _ => {
                if let Some(entry) = tasks.get_mut(&task) {
                    entry.state = TransferState::Finished;
                }
            }
        }
    }
}

#[async_trait]
impl DurableTransport for HttpBackgroundTransport {
    async fn submit(&self, wire: WireRequest, tag: TaskTag) -> Result<TaskId, SendError> {
        let task = TaskId::new();
        self.tasks.lock().expect("task store poisoned").insert(
            task,
            BackgroundTask {
                tag,
                state: TransferState::Pending(wire),
                cancel: CancellationToken::new(),
            },
        );
        Ok(task)
    }

    async fn start(&self, task: TaskId) {
        let (wire, cancel) = {
            let mut tasks = self.tasks.lock().expect("task store poisoned");
            let Some(entry) = tasks.get_mut(&task) else {
                debug!(%task, "start for unknown task ignored");
                return;
            };
            match std::mem::replace(&mut entry.state, TransferState::Running) {
                TransferState::Pending(wire) => (wire, entry.cancel.clone()),
                other => {
                    // Already running or finished; put the state back.
                    entry.state = other;
                    return;
                }
            }
        };

        self.active.inc();
        let client = self.client.clone();
        let events = self.events.clone();
        let tasks = self.tasks.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => TaskOutcome::Cancelled,
                outcome = transfer(&client, &events, task, wire) => outcome,
            };
            Self::settle(&tasks, task, &outcome);
            let _ = events.send(TransportEvent::Finished { task, outcome }).await;
            active.dec();
        });
    }

    async fn cancel(&self, task: TaskId) {
        let cancelled_before_start = {
            let mut tasks = self.tasks.lock().expect("task store poisoned");
            let pending = matches!(
                tasks.get(&task).map(|entry| &entry.state),
                Some(TransferState::Pending(_))
            );
            if pending {
                tasks.remove(&task);
                true
            } else {
                if let Some(entry) = tasks.get(&task) {
                    if matches!(entry.state, TransferState::Running) {
                        entry.cancel.cancel();
                    }
                }
                false
            }
        };
        if cancelled_before_start {
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
        self.tasks
            .lock()
            .expect("task store poisoned")
            .iter()
            .filter(|(_, entry)| !matches!(entry.state, TransferState::Finished))
            .map(|(id, entry)| InflightTask {
                id: *id,
                tag: Some(entry.tag.clone()),
            })
            .collect()
    }

    async fn metadata(&self, task: TaskId) -> Option<TaskTag> {
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        let finished = matches!(
            tasks.get(&task).map(|e| &e.state),
            Some(TransferState::Finished)
        );
        if finished {
            // Terminal retrieval: the tag's lifetime ends with the task.
            tasks.remove(&task).map(|entry| entry.tag)
        } else {
            tasks.get(&task).map(|entry| entry.tag.clone())
        }
    }

    async fn flush(&self) {
        self.active.wait_idle().await;
        let _ = self.events.send(TransportEvent::Drained).await;
    }
}

async fn transfer(
    client: &Client,
    events: &mpsc::Sender<TransportEvent>,
    task: TaskId,
    wire: WireRequest,
) -> TaskOutcome {
    let mut request = client
        .post(&wire.url)
        .header(CONTENT_TYPE, "application/json")
        .body(wire.body);
    if let Some(token) = &wire.bearer_token {
        request = request.bearer_auth(token);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return TaskOutcome::Failed {
                message: e.to_string(),
            }
        }
    };

    let status = response.status().as_u16();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => {
                let _ = events.send(TransportEvent::Data { task, chunk }).await;
            }
            Err(e) => {
                return TaskOutcome::Failed {
                    message: e.to_string(),
                }
            }
        }
    }

    TaskOutcome::Delivered { status }
}
