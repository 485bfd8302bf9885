//! Response dispatcher: terminal transport events to handler
//! invocations and waiter resolution.
//!
//! Runs as the single consumer of the transport event channel, which
//! serializes every registry mutation. Handler invocation itself is
//! spawned, so slow handlers never block the loop; each invocation
//! holds a [`WorkGuard`] so the wake gate counts it, panic or not.
//!
//! [`WorkGuard`]: crate::wake::WorkGuard

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::decode::decode_response;
use crate::error::SendError;
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::notify::NotificationSink;
use crate::registry::{resolve, TaskRegistry, Waiters};
use crate::request::{ConnectionProvider, TaskTag};
use crate::transport::{DurableTransport, TaskId, TaskOutcome, TransportEvent};
use crate::wake::WakeGate;

/// Routes completed responses to handlers and resolves waiters.
#[derive(Clone)]
pub(crate) struct ResponseDispatcher {
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) connections: Arc<dyn ConnectionProvider>,
    pub(crate) durable: Arc<dyn DurableTransport>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) gate: Arc<WakeGate>,
}

impl ResponseDispatcher {
    /// Process one transport event.
    pub(crate) async fn on_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Data { task, chunk } => {
                if !self.registry.append(task, &chunk) {
                    debug!(%task, bytes = chunk.len(), "data for untracked task dropped");
                }
            }
            TransportEvent::Finished { task, outcome } => {
                self.finish(task, outcome).await;
            }
            TransportEvent::Drained => {
                self.gate.mark_drained();
            }
        }
    }

    async fn finish(&self, task: TaskId, outcome: TaskOutcome) {
        // Pop first: the buffer is freed exactly once no matter what
        // happens below.
        let Some((body, waiters)) = self.registry.complete(task) else {
            match outcome {
                // Orphans we cancelled were never tracked here.
                TaskOutcome::Cancelled => debug!(%task, "cancellation of untracked task"),
                _ => warn!(%task, ?outcome, "terminal event for untracked task"),
            }
            return;
        };

        if matches!(outcome, TaskOutcome::Cancelled) {
            // No dispatch, no waiter resolution: chained waiters moved
            // already, and a deliberately cancelled waiter resolves
            // through its dropped sender.
            debug!(%task, buffered = body.len(), "task cancelled; dropping buffered response");
            return;
        }

        let normalized = match outcome {
            TaskOutcome::Delivered { status } => decode_response(status, &body),
            TaskOutcome::Failed { message } => Err(SendError::Transport { message }),
            TaskOutcome::Cancelled => unreachable!("handled above"),
        };

        let Some(tag) = self.durable.metadata(task).await else {
            warn!(%task, "no metadata for completed task; dropping response");
            resolve(waiters, Err(SendError::Abandoned));
            return;
        };

        self.invoke(tag, waiters, normalized);
    }

    /// Dispatch a normalized terminal result to the tag's handler.
    ///
    /// Also the entry point for request-building failures on the
    /// durable path: they arrive here as completed-with-error work so
    /// the handler still gets a chance to react and the caller's
    /// waiter still resolves.
    pub(crate) fn invoke(
        &self,
        tag: TaskTag,
        waiters: Waiters,
        normalized: Result<serde_json::Value, SendError>,
    ) {
        let Some(handler) = self.handlers.lookup(&tag.handler_kind) else {
            warn!(kind = %tag.handler_kind, "no handler registered; dropping response");
            resolve(
                waiters,
                Err(SendError::UnregisteredKind {
                    kind: tag.handler_kind,
                }),
            );
            return;
        };

        let guard = self.gate.begin();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            // Held for the whole invocation; decrements even on panic.
            let _guard = guard;

            let network = normalized.as_ref().map(|_| ()).map_err(Clone::clone);
            let ctx = HandlerContext::new(dispatcher.connections.current_connection());

            let result = match handler.handle(&tag.request, normalized, &ctx).await {
                Ok(outcome) => {
                    if let Some(notification) = outcome.notification {
                        if let Err(e) = dispatcher.sink.post(notification).await {
                            warn!(kind = %tag.handler_kind, error = ?e, "notification sink failed");
                        }
                    }
                    network
                }
                Err(e) => {
                    // Raw error for developers, sanitized for the waiter.
                    error!(kind = %tag.handler_kind, error = ?e, "handler failed");
                    network.and(Err(SendError::Handler {
                        message: e.to_string(),
                    }))
                }
            };

            resolve(waiters, result);
        });
    }
}

impl std::fmt::Debug for ResponseDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDispatcher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
