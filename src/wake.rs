//! Wake-window gate: outstanding-work counter plus drained signal.
//!
//! A host woken with a bounded time budget hands the coordinator a
//! completion callback. The callback must fire **exactly once**, and
//! only after both:
//! - the outstanding-work counter has returned to zero, and
//! - the durable transport has signalled that every pending event for
//!   this wake window was delivered ([`WakeGate::mark_drained`]).
//!
//! Whichever condition is satisfied last triggers the callback; a
//! one-shot `Option::take` on the armed callback guards against
//! double-fire when both paths race.
//!
//! The counter is reentrant: any number of handler invocations may be
//! in flight at once, each holding a [`WorkGuard`] whose drop
//! decrements panic-safely.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

type WakeCallback = Box<dyn FnOnce() + Send>;

/// Gate closing a host wake window exactly once.
#[derive(Default)]
pub struct WakeGate {
    outstanding: AtomicUsize,
    drained: AtomicBool,
    armed: Mutex<Option<WakeCallback>>,
}

impl WakeGate {
    /// Create an idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the gate with the host's completion callback and reset the
    /// drained signal for this wake window.
    ///
    /// Arming while a previous callback is still pending replaces it
    /// (and warns): the host owns the wake window, and the newest
    /// callback is the one that must fire.
    pub fn arm(&self, completion: impl FnOnce() + Send + 'static) {
        self.drained.store(false, Ordering::Release);
        let previous = self
            .armed
            .lock()
            .expect("wake gate poisoned")
            .replace(Box::new(completion));
        if previous.is_some() {
            warn!("wake gate re-armed while a completion callback was pending");
        }
    }

    /// Begin a unit of background work. The returned guard decrements
    /// on drop, even on panic.
    pub fn begin(self: &Arc<Self>) -> WorkGuard {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        WorkGuard { gate: self.clone() }
    }

    /// Record the transport's "all events delivered" signal.
    pub fn mark_drained(&self) {
        self.drained.store(true, Ordering::Release);
        self.maybe_fire();
    }

    /// Outstanding units of background work.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn maybe_fire(&self) {
        if self.outstanding.load(Ordering::Acquire) != 0 {
            return;
        }
        if !self.drained.load(Ordering::Acquire) {
            return;
        }
        // take() makes racing callers converge on a single fire.
        let callback = self.armed.lock().expect("wake gate poisoned").take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for WakeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeGate")
            .field("outstanding", &self.outstanding())
            .field("drained", &self.drained.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// RAII receipt for one unit of background work.
pub struct WorkGuard {
    gate: Arc<WakeGate>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.gate.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.gate.maybe_fire();
    }
}
