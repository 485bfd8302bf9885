//! The courier: dispatch coordination for ephemeral and durable sends.
//!
//! ```text
//! caller ──send()──► replacement pass ──► durable transport ──► registry
//!                                                                  │
//!                   [async completion events]                      │
//!                          │                                       │
//!                          ▼                                       │
//!                   completion loop ──► response dispatcher ◄──────┘
//!                                             │
//!                                   handler lookup + invoke
//!                                             │
//!                                  waiter resolution, wake gate
//! ```
//!
//! # Lifecycle
//!
//! Build a [`Courier`] with [`CourierBuilder`], registering every
//! handler kind up front, then call [`Courier::start`] to spawn the
//! completion loop and obtain a [`CourierHandle`]. The handle is
//! intended to live for the whole process: the durable transport can
//! deliver completions at arbitrary future wake-ups, so the
//! coordinator is created once at process start and torn down never.
//!
//! # Fire-and-Forget vs Await
//!
//! - Ephemeral sends resolve in place and never touch the registry.
//! - Durable sends return a [`Completion`] immediately; resolution
//!   happens later on the serialized completion path, possibly after
//!   the request was superseded by a newer one of the same kind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;
use smallvec::smallvec;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::decode::{decode_response, expect_list, expect_object};
use crate::dispatch::ResponseDispatcher;
use crate::error::SendError;
use crate::handler::{Handler, HandlerRegistry};
use crate::notify::{NotificationSink, TracingSink};
use crate::registry::TaskRegistry;
use crate::request::{build_wire_request, ConnectionProvider, HandlerKind, OutboundRequest, TaskTag};
use crate::transport::{DurableTransport, EphemeralTransport, TaskId, TransportEvent};
use crate::wake::WakeGate;

/// Deferred terminal result of a durable send.
///
/// Resolves exactly once: with the task's outcome, with the
/// superseding task's outcome if the request was replaced, or with
/// [`SendError::Abandoned`] if the coordinator dropped the waiter
/// (deliberate cancellation outside the replacement protocol).
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SendError>>,
}

impl Completion {
    fn new(rx: oneshot::Receiver<Result<(), SendError>>) -> Self {
        Self { rx }
    }
}

impl Future for Completion {
    type Output = Result<(), SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(SendError::Abandoned),
        })
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

struct Shared {
    connections: Arc<dyn ConnectionProvider>,
    ephemeral: Arc<dyn EphemeralTransport>,
    durable: Arc<dyn DurableTransport>,
    handlers: Arc<HandlerRegistry>,
    registry: Arc<TaskRegistry>,
    gate: Arc<WakeGate>,
    dispatcher: ResponseDispatcher,
    /// Serializes submissions so two replacement passes can never
    /// interleave their inventory/cancel decisions.
    submission: Mutex<()>,
}

/// Builder for a [`Courier`].
///
/// # Example
///
/// ```ignore
/// let (transport, events) = HttpBackgroundTransport::new();
/// let courier = Courier::builder(connections, ephemeral, transport, events)
///     .with_handler(HandlerKind::new("location"), Arc::new(LocationHandler))
///     .with_handler(HandlerKind::new("checkin"), Arc::new(CheckinHandler))
///     .with_notification_sink(Arc::new(PlatformSink::new()))
///     .build();
/// let handle = courier.start();
/// ```
pub struct CourierBuilder {
    connections: Arc<dyn ConnectionProvider>,
    ephemeral: Arc<dyn EphemeralTransport>,
    durable: Arc<dyn DurableTransport>,
    events: mpsc::Receiver<TransportEvent>,
    handlers: HandlerRegistry,
    sink: Arc<dyn NotificationSink>,
}

impl CourierBuilder {
    /// Create a builder over the given collaborators. `events` is the
    /// receiving half of the durable transport's event channel.
    pub fn new(
        connections: Arc<dyn ConnectionProvider>,
        ephemeral: Arc<dyn EphemeralTransport>,
        durable: Arc<dyn DurableTransport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            connections,
            ephemeral,
            durable,
            events,
            handlers: HandlerRegistry::new(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Register a handler for a kind.
    ///
    /// # Panics
    ///
    /// Panics if the kind is already registered. Use
    /// [`CourierBuilder::try_with_handler`] for a non-panicking
    /// variant.
    pub fn with_handler(mut self, kind: HandlerKind, handler: Arc<dyn Handler>) -> Self {
        self.handlers.register(kind, handler);
        self
    }

    /// Register a handler for a kind, returning an error on
    /// duplicates.
    pub fn try_with_handler(
        mut self,
        kind: HandlerKind,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, SendError> {
        self.handlers.try_register(kind, handler)?;
        Ok(self)
    }

    /// Replace the default notification sink.
    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Build the courier.
    pub fn build(self) -> Courier {
        let handlers = Arc::new(self.handlers);
        let registry = Arc::new(TaskRegistry::new());
        let gate = Arc::new(WakeGate::new());

        let dispatcher = ResponseDispatcher {
            registry: registry.clone(),
            handlers: handlers.clone(),
            connections: self.connections.clone(),
            durable: self.durable.clone(),
            sink: self.sink,
            gate: gate.clone(),
        };

        Courier {
            shared: Arc::new(Shared {
                connections: self.connections,
                ephemeral: self.ephemeral,
                durable: self.durable,
                handlers,
                registry,
                gate,
                dispatcher,
                submission: Mutex::new(()),
            }),
            events: self.events,
        }
    }
}

/// A built but not yet started coordinator.
pub struct Courier {
    shared: Arc<Shared>,
    events: mpsc::Receiver<TransportEvent>,
}

impl Courier {
    /// Create a builder.
    pub fn builder(
        connections: Arc<dyn ConnectionProvider>,
        ephemeral: Arc<dyn EphemeralTransport>,
        durable: Arc<dyn DurableTransport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> CourierBuilder {
        CourierBuilder::new(connections, ephemeral, durable, events)
    }

    /// Start the completion loop and return the process-wide handle.
    pub fn start(self) -> CourierHandle {
        info!("starting courier completion loop");
        let dispatcher = self.shared.dispatcher.clone();
        let loop_handle = tokio::spawn(run_loop(dispatcher, self.events));
        CourierHandle {
            shared: self.shared,
            loop_handle,
        }
    }
}

async fn run_loop(dispatcher: ResponseDispatcher, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        dispatcher.on_event(event).await;
    }
    debug!("transport event channel closed; completion loop exiting");
}

/// Handle to a running [`Courier`].
pub struct CourierHandle {
    shared: Arc<Shared>,
    loop_handle: JoinHandle<()>,
}

impl CourierHandle {
    /// Send a request ephemerally, ignoring the response body.
    pub async fn send_ephemeral(&self, request: &OutboundRequest) -> Result<(), SendError> {
        self.send_ephemeral_raw(request).await.map(|_| ())
    }

    /// Send a request ephemerally and return the decoded body.
    pub async fn send_ephemeral_raw(&self, request: &OutboundRequest) -> Result<Value, SendError> {
        let wire = build_wire_request(self.shared.connections.as_ref(), request)?;
        let response = self.shared.ephemeral.upload(wire).await?;
        decode_response(response.status, &response.body)
    }

    /// Send a request ephemerally and map the body to one object.
    pub async fn send_ephemeral_value<T: DeserializeOwned>(
        &self,
        request: &OutboundRequest,
    ) -> Result<T, SendError> {
        expect_object(self.send_ephemeral_raw(request).await?)
    }

    /// Send a request ephemerally and map the body to a list.
    pub async fn send_ephemeral_list<T: DeserializeOwned>(
        &self,
        request: &OutboundRequest,
    ) -> Result<Vec<T>, SendError> {
        expect_list(self.send_ephemeral_raw(request).await?)
    }

    /// Send a request over the durable transport.
    ///
    /// Returns as soon as the task is created and started; the
    /// [`Completion`] resolves on the completion path. An
    /// unregistered `kind` yields an already-failed completion with
    /// zero transport calls. Building failures after kind validation
    /// are routed through the response dispatcher so the handler
    /// observes them.
    pub async fn send(&self, request: OutboundRequest, kind: HandlerKind) -> Completion {
        let (waiter, rx) = oneshot::channel();
        let completion = Completion::new(rx);

        if !self.shared.handlers.has_handler(&kind) {
            let _ = waiter.send(Err(SendError::UnregisteredKind { kind }));
            return completion;
        }

        let tag = TaskTag::new(request.clone(), kind.clone());

        let wire = match build_wire_request(self.shared.connections.as_ref(), &request) {
            Ok(wire) => wire,
            Err(e) => {
                self.shared.dispatcher.invoke(tag, smallvec![waiter], Err(e));
                return completion;
            }
        };

        // One submission at a time: the replacement pass below must
        // see a stable picture of its peers.
        let _permit = self.shared.submission.lock().await;

        let task = match self.shared.durable.submit(wire, tag.clone()).await {
            Ok(task) => task,
            Err(e) => {
                self.shared.dispatcher.invoke(tag, smallvec![waiter], Err(e));
                return completion;
            }
        };

        self.shared.registry.insert(task, waiter);
        self.replace_stale(task, &kind, &request).await;
        self.shared.durable.start(task).await;

        completion
    }

    /// Cancel or supersede stale in-flight peers of a new task.
    ///
    /// The transport inventory is listed asynchronously, so a task
    /// started between the listing and a cancellation decision stays
    /// invisible for this pass; it is reconsidered on the next
    /// submission. Tasks with no retrievable metadata can never be
    /// dispatched and are cancelled unconditionally, even if they
    /// belong to an earlier registry generation.
    async fn replace_stale(&self, new_task: TaskId, kind: &HandlerKind, request: &OutboundRequest) {
        let handler = self
            .shared
            .handlers
            .lookup(kind)
            .expect("kind validated before submission");

        for peer in self.shared.durable.inventory().await {
            if peer.id == new_task {
                continue;
            }
            match peer.tag {
                None => {
                    warn!(task = %peer.id, "cancelling orphaned task with no metadata");
                    self.shared.durable.cancel(peer.id).await;
                }
                Some(tag) if tag.handler_kind == *kind => {
                    if handler.should_replace(request, &tag.request) {
                        let moved = self.shared.registry.chain(peer.id, new_task);
                        info!(
                            superseded = %peer.id,
                            by = %new_task,
                            waiters = moved,
                            "superseding stale in-flight task"
                        );
                        self.shared.durable.cancel(peer.id).await;
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Host wake-window entry point.
    ///
    /// Arms the wake gate with `completion` and asks the durable
    /// transport to flush pending events. `completion` fires exactly
    /// once, after every in-flight handler invocation finishes **and**
    /// the transport signals it delivered everything — whichever
    /// happens last.
    pub fn on_wake(&self, completion: impl FnOnce() + Send + 'static) {
        self.shared.gate.arm(completion);
        let durable = self.shared.durable.clone();
        tokio::spawn(async move {
            durable.flush().await;
        });
    }

    /// Number of durable tasks currently tracked.
    pub fn pending_tasks(&self) -> usize {
        self.shared.registry.pending()
    }

    /// Abort the completion loop.
    ///
    /// Test teardown only: a production coordinator lives as long as
    /// the process.
    pub fn abort(&self) {
        self.loop_handle.abort();
    }
}

impl std::fmt::Debug for CourierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierHandle")
            .field("pending_tasks", &self.pending_tasks())
            .field("outstanding_work", &self.shared.gate.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerContext, HandlerOutcome};
    use crate::notify::Notification;
    use crate::request::{Connection, StaticConnectionProvider};
    use crate::testing::{CollectingSink, MemoryTransport, ScriptedEphemeral};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingHandler {
        invocations: Arc<AtomicUsize>,
        saw_error: Arc<AtomicBool>,
        replace: bool,
        notification: Option<Notification>,
        fail: bool,
        requests: Arc<StdMutex<Vec<OutboundRequest>>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                invocations: Arc::new(AtomicUsize::new(0)),
                saw_error: Arc::new(AtomicBool::new(false)),
                replace: false,
                notification: None,
                fail: false,
                requests: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn replacing() -> Self {
            Self {
                replace: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(
            &self,
            request: &OutboundRequest,
            response: Result<Value, SendError>,
            _ctx: &HandlerContext,
        ) -> anyhow::Result<HandlerOutcome> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if response.is_err() {
                self.saw_error.store(true, Ordering::SeqCst);
            }
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            Ok(match &self.notification {
                Some(n) => HandlerOutcome::with_notification(n.clone()),
                None => HandlerOutcome::none(),
            })
        }

        fn should_replace(&self, _new: &OutboundRequest, _old: &OutboundRequest) -> bool {
            self.replace
        }
    }

    struct Fixture {
        handle: CourierHandle,
        durable: Arc<MemoryTransport>,
        ephemeral: Arc<ScriptedEphemeral>,
        sink: Arc<CollectingSink>,
        connections: Arc<StaticConnectionProvider>,
    }

    fn fixture(handlers: Vec<(HandlerKind, Arc<dyn Handler>)>) -> Fixture {
        let connections = Arc::new(StaticConnectionProvider::new(
            Connection::new("https://hooks.example.com").with_bearer_token("token"),
        ));
        let ephemeral = Arc::new(ScriptedEphemeral::new());
        let (durable, events) = MemoryTransport::new();
        let sink = Arc::new(CollectingSink::new());

        let mut builder = Courier::builder(
            connections.clone(),
            ephemeral.clone(),
            durable.clone(),
            events,
        )
        .with_notification_sink(sink.clone());
        for (kind, handler) in handlers {
            builder = builder.with_handler(kind, handler);
        }

        Fixture {
            handle: builder.build().start(),
            durable,
            ephemeral,
            sink,
            connections,
        }
    }

    #[tokio::test]
    async fn test_ephemeral_send_decodes_response() {
        let fx = fixture(vec![]);
        fx.ephemeral.push_response(200, br#"{"name":"carol"}"#);

        #[derive(serde::Deserialize)]
        struct Contact {
            name: String,
        }

        let contact: Contact = fx
            .handle
            .send_ephemeral_value(&OutboundRequest::new("contact", json!({})))
            .await
            .unwrap();
        assert_eq!(contact.name, "carol");
        assert_eq!(fx.ephemeral.upload_count(), 1);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_ephemeral_send_requires_session() {
        let fx = fixture(vec![]);
        fx.connections.set(None);

        let err = fx
            .handle
            .send_ephemeral(&OutboundRequest::new("ping", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NoActiveSession));
        assert_eq!(fx.ephemeral.upload_count(), 0);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_ephemeral_status_contract() {
        let fx = fixture(vec![]);
        fx.ephemeral.push_response(404, b"{}");

        let err = fx
            .handle
            .send_ephemeral_raw(&OutboundRequest::new("x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Status { status: 404 }));
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_ephemeral_unmappable_value() {
        let fx = fixture(vec![]);
        fx.ephemeral.push_response(200, br#"{"id":"1"}"#);

        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct Named {
            name: String,
        }

        let err = fx
            .handle
            .send_ephemeral_value::<Named>(&OutboundRequest::new("x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::UnmappableValue { .. }));
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_ephemeral_sends_never_touch_the_registry() {
        let fx = fixture(vec![]);
        fx.ephemeral.push_response(200, b"");

        fx.handle
            .send_ephemeral(&OutboundRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert_eq!(fx.handle.pending_tasks(), 0);
        assert_eq!(fx.durable.submit_count(), 0);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_durable_send_resolves_with_handler_outcome() {
        let handler = RecordingHandler {
            notification: Some(Notification::new("done", "delivered")),
            ..RecordingHandler::new()
        };
        let invocations = handler.invocations.clone();
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(handler))]);

        let completion = fx
            .handle
            .send(OutboundRequest::new("location", json!({"lat": 1})), kind)
            .await;
        let task = fx.durable.last_submitted().unwrap();
        fx.durable.complete(task, 200, br#"{"ok":true}"#).await;

        completion.await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(fx.sink.posted().len(), 1);
        assert_eq!(fx.sink.posted()[0].title, "done");
        assert_eq!(fx.handle.pending_tasks(), 0);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_unregistered_kind_fails_fast_with_zero_network() {
        let fx = fixture(vec![]);

        let completion = fx
            .handle
            .send(
                OutboundRequest::new("x", json!({})),
                HandlerKind::new("nobody"),
            )
            .await;
        let err = completion.await.unwrap_err();
        assert!(matches!(err, SendError::UnregisteredKind { .. }));
        assert_eq!(fx.durable.submit_count(), 0);
        assert_eq!(fx.durable.started().len(), 0);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_building_failure_routes_through_handler() {
        let handler = RecordingHandler::new();
        let invocations = handler.invocations.clone();
        let saw_error = handler.saw_error.clone();
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(handler))]);
        fx.connections.set(None);

        let completion = fx
            .handle
            .send(OutboundRequest::new("location", json!({})), kind)
            .await;
        let err = completion.await.unwrap_err();
        assert!(matches!(err, SendError::NoActiveSession));

        // The handler still got a chance to react, with zero network.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(saw_error.load(Ordering::SeqCst));
        assert_eq!(fx.durable.submit_count(), 0);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_transport_failure_resolves_waiter_with_error() {
        let handler = RecordingHandler::new();
        let saw_error = handler.saw_error.clone();
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(handler))]);

        let completion = fx
            .handle
            .send(OutboundRequest::new("location", json!({})), kind)
            .await;
        let task = fx.durable.last_submitted().unwrap();
        fx.durable.fail(task, "connection reset").await;

        let err = completion.await.unwrap_err();
        assert!(matches!(err, SendError::Transport { .. }));
        assert!(saw_error.load(Ordering::SeqCst));
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_handler_failure_sanitized_into_waiter() {
        let handler = RecordingHandler {
            fail: true,
            ..RecordingHandler::new()
        };
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(handler))]);

        let completion = fx
            .handle
            .send(OutboundRequest::new("location", json!({})), kind)
            .await;
        let task = fx.durable.last_submitted().unwrap();
        fx.durable.complete(task, 200, b"{}").await;

        match completion.await.unwrap_err() {
            SendError::Handler { message } => assert!(message.contains("handler exploded")),
            other => panic!("unexpected error: {other:?}"),
        }
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_same_kind_supersession_chains_both_callers() {
        let handler = RecordingHandler::replacing();
        let invocations = handler.invocations.clone();
        let requests = handler.requests.clone();
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(handler))]);

        let first = fx
            .handle
            .send(OutboundRequest::new("location", json!({"seq": 1})), kind.clone())
            .await;
        let old_task = fx.durable.last_submitted().unwrap();

        let second = fx
            .handle
            .send(OutboundRequest::new("location", json!({"seq": 2})), kind)
            .await;
        let new_task = fx.durable.last_submitted().unwrap();
        assert_ne!(old_task, new_task);
        assert_eq!(fx.durable.cancelled(), vec![old_task]);

        fx.durable.complete(new_task, 200, b"{}").await;

        // Both callers observe the new task's result.
        first.await.unwrap();
        second.await.unwrap();

        // Exactly one transfer completed, so one handler invocation,
        // and it saw the superseding request.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let seen = requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, json!({"seq": 2}));
        assert_eq!(fx.handle.pending_tasks(), 0);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_different_kinds_never_interact() {
        let location = RecordingHandler::replacing();
        let checkin = RecordingHandler::replacing();
        let fx = fixture(vec![
            (HandlerKind::new("location"), Arc::new(location)),
            (HandlerKind::new("checkin"), Arc::new(checkin)),
        ]);

        let a = fx
            .handle
            .send(
                OutboundRequest::new("location", json!({})),
                HandlerKind::new("location"),
            )
            .await;
        let task_a = fx.durable.last_submitted().unwrap();

        let b = fx
            .handle
            .send(
                OutboundRequest::new("checkin", json!({})),
                HandlerKind::new("checkin"),
            )
            .await;
        let task_b = fx.durable.last_submitted().unwrap();

        // Replacement policies are per-kind: nothing was cancelled.
        assert!(fx.durable.cancelled().is_empty());

        fx.durable.complete(task_a, 200, b"{}").await;
        fx.durable.complete(task_b, 200, b"{}").await;
        a.await.unwrap();
        b.await.unwrap();
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_orphaned_tasks_cancelled_unconditionally() {
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(RecordingHandler::new()))]);

        let orphan = fx.durable.seed_orphan();

        let completion = fx
            .handle
            .send(OutboundRequest::new("location", json!({})), kind)
            .await;
        assert_eq!(fx.durable.cancelled(), vec![orphan]);

        let task = fx.durable.last_submitted().unwrap();
        fx.durable.complete(task, 200, b"{}").await;
        completion.await.unwrap();
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_cancelled_after_partial_data_is_silent() {
        let handler = RecordingHandler::replacing();
        let invocations = handler.invocations.clone();
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(handler))]);

        let first = fx
            .handle
            .send(OutboundRequest::new("location", json!({"seq": 1})), kind.clone())
            .await;
        let old_task = fx.durable.last_submitted().unwrap();

        // Partial bytes arrive before the supersession.
        fx.durable.feed(old_task, b"part").await;

        let second = fx
            .handle
            .send(OutboundRequest::new("location", json!({"seq": 2})), kind)
            .await;
        let new_task = fx.durable.last_submitted().unwrap();

        fx.durable.complete(new_task, 200, b"{}").await;
        first.await.unwrap();
        second.await.unwrap();

        // The cancelled transfer was never dispatched.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(fx.handle.pending_tasks(), 0);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_on_wake_fires_exactly_once_after_drain() {
        let kind = HandlerKind::new("location");
        let fx = fixture(vec![(kind.clone(), Arc::new(RecordingHandler::new()))]);

        let completion = fx
            .handle
            .send(OutboundRequest::new("location", json!({})), kind)
            .await;
        let task = fx.durable.last_submitted().unwrap();
        fx.durable.complete(task, 200, b"{}").await;
        completion.await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let f = fired.clone();
        fx.handle.on_wake(move || {
            f.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });

        rx.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        fx.handle.abort();
    }

    #[tokio::test]
    async fn test_unhandled_kind_resolves_with_noop() {
        let fx = fixture(vec![]);

        let completion = fx
            .handle
            .send(
                OutboundRequest::new("telemetry", json!({})),
                HandlerKind::UNHANDLED,
            )
            .await;
        let task = fx.durable.last_submitted().unwrap();
        fx.durable.complete(task, 204, b"").await;

        completion.await.unwrap();
        assert!(fx.sink.posted().is_empty());
        fx.handle.abort();
    }
}
