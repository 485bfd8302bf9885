//! In-flight task registry: accumulated bytes plus waiters.
//!
//! The registry is the shared mutable state of the coordinator. All
//! mutation happens either on the single-consumer completion loop or
//! under the coordinator's submission lock, and the inner map is
//! mutex-guarded besides, so entries are never raced.
//!
//! Invariants:
//! - An entry exists from submission until its terminal event.
//! - [`TaskRegistry::complete`] removes the entry atomically, so a
//!   buffer is freed exactly once regardless of outcome.
//! - Waiters leave an entry only by being resolved or chained onto
//!   another entry. Dropping a waiter's sender resolves the receiving
//!   caller with [`SendError::Abandoned`], so even a defect here
//!   cannot hang a caller forever.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::error::SendError;
use crate::transport::TaskId;

/// One caller awaiting a task's terminal result.
pub(crate) type Waiter = oneshot::Sender<Result<(), SendError>>;

/// Waiter list for one task. Usually one; more after supersession
/// chains a stale task's waiters onto its replacement.
pub(crate) type Waiters = SmallVec<[Waiter; 1]>;

struct TaskEntry {
    buffer: BytesMut,
    waiters: Waiters,
}

/// Maps task identifiers to accumulated response bytes and waiters.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
}

impl TaskRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a freshly submitted task together with its waiter.
    pub(crate) fn insert(&self, task: TaskId, waiter: Waiter) {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        let entry = tasks.entry(task).or_insert_with(|| TaskEntry {
            buffer: BytesMut::new(),
            waiters: SmallVec::new(),
        });
        entry.waiters.push(waiter);
    }

    /// Append a chunk of response bytes to a task's buffer.
    ///
    /// Returns false for unknown tasks (already completed, or never
    /// ours) so the caller can log at the right level.
    pub(crate) fn append(&self, task: TaskId, chunk: &[u8]) -> bool {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        match tasks.get_mut(&task) {
            Some(entry) => {
                entry.buffer.extend_from_slice(chunk);
                true
            }
            None => false,
        }
    }

    /// Atomically remove a task, returning its buffer and waiters.
    pub(crate) fn complete(&self, task: TaskId) -> Option<(Bytes, Waiters)> {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        tasks
            .remove(&task)
            .map(|entry| (entry.buffer.freeze(), entry.waiters))
    }

    /// Move every waiter of `from` onto `to`, so they resolve with
    /// whatever `to` eventually resolves with. Returns how many
    /// waiters moved.
    ///
    /// `to` must already be registered; chaining onto an unknown task
    /// would drop the waiters, which the debug assertion guards.
    pub(crate) fn chain(&self, from: TaskId, to: TaskId) -> usize {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        let moved = match tasks.get_mut(&from) {
            Some(entry) => std::mem::take(&mut entry.waiters),
            None => return 0,
        };
        let count = moved.len();
        match tasks.get_mut(&to) {
            Some(target) => target.waiters.extend(moved),
            None => {
                debug_assert!(false, "chained waiters onto unregistered task {to}");
            }
        }
        count
    }

    /// Number of tracked in-flight tasks.
    pub(crate) fn pending(&self) -> usize {
        self.tasks.lock().expect("task registry poisoned").len()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Resolve every waiter with (a clone of) one result.
///
/// Send failures mean the caller dropped its `Completion`; nothing is
/// owed to a caller who walked away.
pub(crate) fn resolve(waiters: Waiters, result: Result<(), SendError>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_insert_append_complete() {
        let registry = TaskRegistry::new();
        let task = TaskId::new();
        let (tx, _rx) = oneshot::channel();

        registry.insert(task, tx);
        assert!(registry.append(task, b"hel"));
        assert!(registry.append(task, b"lo"));

        let (bytes, waiters) = registry.complete(task).unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(waiters.len(), 1);

        // Second completion finds nothing: the buffer is freed once.
        assert!(registry.complete(task).is_none());
    }

    #[test]
    fn test_append_to_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(!registry.append(TaskId::new(), b"x"));
    }

    #[tokio::test]
    async fn test_chain_moves_waiters() {
        let registry = TaskRegistry::new();
        let old = TaskId::new();
        let new = TaskId::new();

        let (old_tx, old_rx) = oneshot::channel();
        let (new_tx, new_rx) = oneshot::channel();
        registry.insert(old, old_tx);
        registry.insert(new, new_tx);

        assert_eq!(registry.chain(old, new), 1);

        // The old entry stays (its cancellation event still pops the
        // buffer) but carries no waiters.
        let (_, old_waiters) = registry.complete(old).unwrap();
        assert!(old_waiters.is_empty());

        // Resolving the new task reaches both callers.
        let (_, new_waiters) = registry.complete(new).unwrap();
        assert_eq!(new_waiters.len(), 2);
        resolve(new_waiters, Ok(()));

        assert!(old_rx.await.unwrap().is_ok());
        assert!(new_rx.await.unwrap().is_ok());
    }

    #[test]
    fn test_chain_from_unknown_task_is_noop() {
        let registry = TaskRegistry::new();
        let new = TaskId::new();
        let (tx, _rx) = oneshot::channel();
        registry.insert(new, tx);

        assert_eq!(registry.chain(TaskId::new(), new), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_resolves_receiver() {
        let (tx, rx) = oneshot::channel::<Result<(), SendError>>();
        let waiters: Waiters = smallvec![tx];
        drop(waiters);

        // The receiver observes the drop instead of hanging.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_fans_out_clones() {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let waiters: Waiters = smallvec![tx1, tx2];

        resolve(waiters, Err(SendError::Status { status: 503 }));

        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                Err(SendError::Status { status }) => assert_eq!(status, 503),
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }
}
