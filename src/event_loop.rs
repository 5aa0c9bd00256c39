//! The loop driver: owns the handler table, timer heap, callback queue, backend, and
//! waker, and runs the seven-step iteration algorithm that ties them together.
//!
//! `EventLoop` is a thin `Rc`-based handle around [`LoopInner`]; the split exists so
//! callbacks can hold a [`Weak`] back-reference (for `Periodic`, `FutureBridge`, and
//! reentrant `schedule` calls) without creating a reference cycle against the loop
//! itself.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use crate::backend::{self, Backend, BackendKind, ClosedBackend};
use crate::clock::{ManualClock, MonotonicClock, TimeSource};
use crate::error::{describe_panic, LoopError, Result};
use crate::globals;
use crate::handler::{HandlerCallback, HandlerTable};
use crate::mask::EventMask;
use crate::periodic::PeriodicCallback;
use crate::queue::{CallbackQueue, LoopHandle};
use crate::timer::{TimerCallback, TimerHandle, TimerHeap};
use crate::waker::Waker;

/// Upper bound on how long a single `wait` can block when no timer is pending, so the
/// loop still periodically gets a chance to notice external state (e.g. a debugger
/// detach, or simply to avoid looking permanently hung in diagnostics).
const DEFAULT_POLL_TIMEOUT_CAP: Duration = Duration::from_secs(3600);

/// Tombstone-GC thresholds, matching the timer heap's default load factor; kept here
/// too since the absolute-count half of the rule (`cancellation_count > 512`) is a
/// loop-level policy decision, not a property of the heap itself.
const DEFAULT_GC_ABSOLUTE_THRESHOLD: usize = 512;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub backend: BackendKind,
    pub poll_timeout_cap: Duration,
    pub gc_absolute_threshold: usize,
    /// Fraction of tombstoned-to-live heap entries that triggers a compaction pass,
    /// once `gc_absolute_threshold` has also been crossed. Defaults to
    /// [`crate::timer::GC_LOAD_FACTOR`]; lowering it lets tests observe GC sooner
    /// without waiting for a large absolute cancellation count.
    pub gc_load_factor: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            poll_timeout_cap: DEFAULT_POLL_TIMEOUT_CAP,
            gc_absolute_threshold: DEFAULT_GC_ABSOLUTE_THRESHOLD,
            gc_load_factor: crate::timer::GC_LOAD_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

enum Clock {
    Monotonic(MonotonicClock),
    #[cfg_attr(not(test), allow(dead_code))]
    Manual(Rc<ManualClock>),
}

impl TimeSource for Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::Monotonic(c) => c.now(),
            Clock::Manual(c) => c.now(),
        }
    }
}

/// Private loop state. Never exposed directly — always reached through [`EventLoop`]
/// or a borrow scoped by [`EventLoop::with_inner_mut`].
pub(crate) struct LoopInner {
    config: LoopConfig,
    clock: Clock,
    backend: Box<dyn Backend>,
    waker: Arc<Waker>,
    handlers: HandlerTable,
    timers: TimerHeap,
    queue: Arc<CallbackQueue>,
    /// Owner-thread-only callbacks, scheduled via `EventLoop::schedule` rather than
    /// `LoopHandle::schedule`. Kept separate from `queue` because it stores plain
    /// `Box<dyn FnOnce()>` with no `Send` bound — the only way code on this thread can
    /// hand the loop an `Rc`-capturing closure (e.g. a callback that reschedules
    /// itself, or closes over the `EventLoop` handle itself, which is `!Send`).
    local_queue: RefCell<Vec<Box<dyn FnOnce()>>>,
    /// fd -> mask for events returned by the last `poll`, still awaiting dispatch.
    /// Tracked separately from the handler table so a `remove_handler` mid-dispatch
    /// can erase an fd's pending entry without touching the table itself.
    pending_events: HashMap<RawFd, EventMask>,
    run_state: RunState,
    stopped_before_start: bool,
    closing: bool,
    owner_thread: Option<ThreadId>,
    cancellation_count: usize,
    /// Overrides the default `tracing::warn!` reaction to a callback panic. Set via
    /// [`EventLoop::set_exception_handler`]; the argument is the stringified panic
    /// payload (see `describe_panic`).
    exception_handler: Option<Box<dyn Fn(&str)>>,
}

impl std::fmt::Debug for LoopInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopInner")
            .field("run_state", &self.run_state)
            .field("handlers", &self.handlers.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

/// The public handle to a loop. Cloning shares the same underlying state (it's a
/// cheap `Rc` clone), matching the single-owner-thread ownership model: every clone
/// must stay on the thread that created the loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventLoop").field(&self.inner.borrow()).finish()
    }
}

impl EventLoop {
    /// Constructs a loop with `LoopConfig::default()`. Use [`EventLoop::with_config`] to
    /// pick an explicit backend, poll-timeout cap, or tombstone-GC thresholds.
    pub fn new() -> Result<Self> { Self::with_config(LoopConfig::default()) }

    pub fn with_config(config: LoopConfig) -> Result<Self> {
        let backend = backend::build(config.backend)?;
        let waker = Arc::new(Waker::new()?);
        let inner = Rc::new(RefCell::new(LoopInner {
            config,
            clock: Clock::Monotonic(MonotonicClock::new()),
            backend,
            waker,
            handlers: HandlerTable::new(),
            timers: TimerHeap::new(),
            queue: Arc::new(CallbackQueue::new()),
            local_queue: RefCell::new(Vec::new()),
            pending_events: HashMap::new(),
            run_state: RunState::Idle,
            stopped_before_start: false,
            closing: false,
            owner_thread: None,
            cancellation_count: 0,
            exception_handler: None,
        }));
        Ok(Self { inner })
    }

    #[must_use]
    pub(crate) fn downgrade(&self) -> Weak<RefCell<LoopInner>> { Rc::downgrade(&self.inner) }

    pub(crate) fn from_inner(inner: Rc<RefCell<LoopInner>>) -> Self { Self { inner } }

    /// Current loop time, per the installed clock.
    #[must_use]
    pub fn time(&self) -> Duration { self.inner.borrow().clock.now() }

    pub(crate) fn clock_now(inner: &Rc<RefCell<LoopInner>>) -> Duration { inner.borrow().clock.now() }

    /// Overrides how a caught callback/timer panic is reported. By default it goes to
    /// `tracing::warn!`; this is the `handle_callback_exception` extension point.
    pub fn set_exception_handler(&self, handler: impl Fn(&str) + 'static) {
        self.inner.borrow_mut().exception_handler = Some(Box::new(handler));
    }

    fn report_exception(&self, payload: &(dyn std::any::Any + Send)) {
        self.report_exception_message(&describe_panic(payload));
    }

    /// Shared sink for both a caught panic's message and a non-broken-pipe `Err`
    /// returned from a handler — both go through `handle_callback_exception` alike.
    fn report_exception_message(&self, message: &str) {
        let inner = self.inner.borrow();
        match &inner.exception_handler {
            Some(handler) => handler(message),
            None => tracing::warn!(error = %message, "callback raised an exception"),
        }
    }

    /// A handle safe to move to another thread: exposes only `schedule` and
    /// `schedule_from_signal`, per the spec's cross-thread-safety restriction.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        let inner = self.inner.borrow();
        LoopHandle::new(Arc::clone(&inner.queue), Arc::clone(&inner.waker))
    }

    /// Exposes the loop's own waker for the optional signal bridge, which needs to
    /// wake the backend from a dedicated signal-handling thread without going through
    /// the callback queue (a signal delivery carries no callback of its own to run —
    /// only the loop's already-registered waker-read handler needs to notice it).
    #[cfg(feature = "signal-bridge")]
    pub(crate) fn waker_for_signal_bridge(&self) -> Arc<Waker> { Arc::clone(&self.inner.borrow().waker) }

    // ---- handler registration -------------------------------------------------

    pub fn add_handler(
        &self,
        fd: RawFd,
        mask: EventMask,
        callback: HandlerCallback,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.handlers.add(fd, mask, callback)?;
        let full_mask = mask | EventMask::ERROR;
        if let Err(e) = inner.backend.register(fd, full_mask) {
            inner.handlers.remove(fd).ok();
            return Err(e);
        }
        tracing::trace!(fd, mask = %full_mask, "handler registered");
        Ok(())
    }

    pub fn update_handler(&self, fd: RawFd, mask: EventMask) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let full_mask = inner.handlers.update_mask(fd, mask)?;
        inner.backend.reregister(fd, full_mask)?;
        tracing::trace!(fd, mask = %full_mask, "handler mask updated");
        Ok(())
    }

    pub fn remove_handler(&self, fd: RawFd) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.handlers.remove(fd)?;
        inner.pending_events.remove(&fd);
        if let Err(e) = inner.backend.deregister(fd) {
            tracing::debug!(fd, error = %e, "backend deregister failed, fd likely already closed");
        }
        tracing::trace!(fd, "handler removed");
        Ok(())
    }

    // ---- callback scheduling ---------------------------------------------------

    /// Schedules `callback` to run on the loop thread. Fails with `LoopClosing` once
    /// `close()` has begun.
    ///
    /// No `Send` bound: `EventLoop` itself is `!Send` (it holds an `Rc`), so the only
    /// way to reach this method at all is from the thread that owns the loop — there's
    /// no cross-thread path through it to guard against. Code on another thread must
    /// go through [`EventLoop::handle`] instead, whose `LoopHandle::schedule` does
    /// require `Send` for exactly that reason. Because both queues are drained every
    /// iteration regardless of `owner_thread`/wake bookkeeping, this never needs to
    /// touch the waker: the loop is already awake (it's the one calling in).
    pub fn schedule(&self, callback: impl FnOnce() + 'static) -> Result<()> {
        let inner = self.inner.borrow();
        if inner.closing {
            return Err(LoopError::LoopClosing);
        }
        inner.local_queue.borrow_mut().push(Box::new(callback));
        Ok(())
    }

    /// Fire-and-forget variant; identical to `schedule` but named separately per the
    /// external-interface surface (`spawn` carries no caller-context capture beyond
    /// what the closure itself closes over).
    pub fn spawn(&self, callback: impl FnOnce() + 'static) -> Result<()> { self.schedule(callback) }

    // ---- timers -----------------------------------------------------------------

    pub fn call_at(&self, deadline: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = self.inner.borrow_mut().timers.insert(deadline, callback);
        let deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        tracing::trace!(deadline_ms, seq = handle.seq(), "timer scheduled");
        handle
    }

    pub fn call_later(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let now = self.time();
        self.call_at(now + delay, callback)
    }

    pub fn add_timeout(&self, deadline: Duration, callback: TimerCallback) -> TimerHandle {
        self.call_at(deadline, callback)
    }

    pub fn remove_timeout(&self, handle: &TimerHandle) {
        handle.cancel();
        let mut inner = self.inner.borrow_mut();
        inner.timers.note_cancelled();
        inner.cancellation_count += 1;
        tracing::trace!(seq = handle.seq(), "timer cancelled");
        maybe_gc(&mut inner);
    }

    pub(crate) fn schedule_timer_at(
        inner: &Rc<RefCell<LoopInner>>,
        deadline: Duration,
        callback: TimerCallback,
    ) -> TimerHandle {
        inner.borrow_mut().timers.insert(deadline, callback)
    }

    #[must_use]
    pub fn periodic(&self, period: Duration, callback: Box<dyn FnMut()>) -> PeriodicCallback {
        PeriodicCallback::new(self, period, callback)
    }

    // ---- lifecycle ----------------------------------------------------------------

    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.run_state == RunState::Running {
                return Err(LoopError::AlreadyRunning);
            }
            if inner.stopped_before_start {
                inner.stopped_before_start = false;
                return Ok(());
            }
            inner.run_state = RunState::Running;
            inner.owner_thread = Some(std::thread::current().id());
            inner.closing = false;
        }
        globals::make_current(self);
        self.install_waker_handler();
        tracing::debug!("loop starting");

        loop {
            if self.inner.borrow().run_state != RunState::Running {
                break;
            }
            self.run_once()?;
        }

        self.inner.borrow_mut().run_state = RunState::Idle;
        globals::clear_current();
        tracing::debug!("loop stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let inner = self.inner.borrow();
        if inner.run_state == RunState::Running {
            drop(inner);
            self.inner.borrow_mut().run_state = RunState::Stopped;
        } else {
            self.inner.borrow_mut().stopped_before_start = true;
        }
        let inner = self.inner.borrow();
        inner.waker.wake();
    }

    /// Tears the loop down. Must not be called while running. Unregisters the waker,
    /// and if `all_fds`, deregisters and closes every still-registered fd (the handler
    /// table here only ever retains a raw fd, never a owning file-like object, so
    /// "closing the owning object" falls back to closing the raw fd directly). Then
    /// closes the waker and releases the backend, callback queue, and timer heap, per
    /// §4.6 — none of that is left to happen only incidentally whenever the `EventLoop`
    /// itself eventually drops.
    pub fn close(&self, all_fds: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.run_state == RunState::Running {
            return Err(LoopError::AlreadyRunning);
        }
        inner.closing = true;

        let waker_fd = inner.waker.read_fd();
        if inner.handlers.contains(waker_fd) {
            inner.handlers.remove(waker_fd).ok();
            inner.backend.deregister(waker_fd).ok();
        }

        let remaining_fds = inner.handlers.fds();
        for fd in remaining_fds {
            inner.backend.deregister(fd).ok();
            inner.handlers.remove(fd).ok();
            if all_fds {
                if let Err(e) = nix::unistd::close(fd) {
                    tracing::debug!(fd, error = %e, "close of owned fd failed during loop close");
                }
            }
        }

        inner.waker.close();
        inner.backend = Box::new(ClosedBackend);
        inner.queue.clear();
        inner.local_queue.borrow_mut().clear();
        inner.timers.clear();

        tracing::debug!(all_fds, "loop closed");
        Ok(())
    }

    fn install_waker_handler(&self) {
        let already = self.inner.borrow().handlers.contains(self.inner.borrow().waker.read_fd());
        if already {
            return;
        }
        let waker = Arc::clone(&self.inner.borrow().waker);
        let read_fd = waker.read_fd();
        let waker_for_cb = Arc::clone(&waker);
        // Errors here would only happen if the waker fd were already registered,
        // which `already` just ruled out.
        let _ = self.add_handler(
            read_fd,
            EventMask::READ,
            Box::new(move |_mask| {
                waker_for_cb.consume()?;
                Ok(())
            }),
        );
    }

    /// Runs exactly one iteration of the seven-step algorithm.
    fn run_once(&self) -> Result<()> {
        // Step 1: snapshot callbacks. Two sources feed the same logical queue: the
        // cross-thread/signal-safe `CallbackQueue` (Send-bound) and the owner-thread-only
        // `local_queue` (not Send-bound, for Rc-capturing reentrant `schedule` calls).
        // Each preserves its own push order; draining the local queue first just means
        // owner-thread-scheduled work is seen no later than same-iteration cross-thread
        // work, never a correctness requirement either way since the spec's FIFO
        // guarantee is only about callbacks scheduled from the same origin.
        let local_snapshot = std::mem::take(&mut *self.inner.borrow().local_queue.borrow_mut());
        let snapshot = self.inner.borrow().queue.drain_snapshot();

        // Step 2: collect due timers, including any tombstone-GC bookkeeping.
        let now = self.time();
        let due = {
            let mut inner = self.inner.borrow_mut();
            let due = inner.timers.pop_due(now);
            maybe_gc(&mut inner);
            due
        };

        // Step 3: run snapshotted callbacks, then due timers, each under the error guard.
        let mut enqueued_during_dispatch = false;
        for cb in local_snapshot {
            enqueued_during_dispatch |= self.run_guarded(cb);
        }
        for cb in snapshot {
            enqueued_during_dispatch |= self.run_guarded(cb);
        }
        for cb in due {
            enqueued_during_dispatch |= self.run_guarded(cb);
        }

        // Step 4: compute poll timeout.
        let timeout = if enqueued_during_dispatch {
            Some(Duration::ZERO)
        } else {
            let mut inner = self.inner.borrow_mut();
            let cap = inner.config.poll_timeout_cap;
            match inner.timers.next_deadline() {
                Some(deadline) => {
                    let now = inner.clock.now();
                    Some(deadline.saturating_sub(now).min(cap))
                }
                None => Some(cap),
            }
        };

        // Step 5: check running flag.
        if self.inner.borrow().run_state != RunState::Running {
            return Ok(());
        }

        // Step 6: wait on backend, retrying on interrupt.
        let ready = loop {
            let result = self.inner.borrow_mut().backend.poll(timeout);
            match result {
                Ok(events) => break events,
                Err(e) if e.is_interrupted() => continue,
                Err(e) => return Err(e),
            }
        };

        // Step 7: dispatch events.
        {
            let mut inner = self.inner.borrow_mut();
            for event in ready {
                inner.pending_events.insert(event.fd, event.mask);
            }
        }
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                let fd = match inner.pending_events.keys().next().copied() {
                    Some(fd) => fd,
                    None => break,
                };
                let mask = inner.pending_events.remove(&fd).unwrap();
                (fd, mask)
            };
            self.dispatch_one(next.0, next.1);
        }

        Ok(())
    }

    /// Invokes one fd's callback under the error guard, skipping silently if the fd
    /// was removed between poll and dispatch.
    fn dispatch_one(&self, fd: RawFd, mask: EventMask) {
        let slot = {
            let inner = self.inner.borrow();
            if !inner.handlers.contains(fd) {
                return;
            }
            inner.handlers.checkout(fd)
        };
        let Some(slot) = slot else { return };
        let cb = slot.borrow_mut().take();
        let Some(mut cb) = cb else { return };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(mask)));
        // Put the callback back unless `remove_handler` already dropped the slot's
        // owning entry (checked via `contains` again, cheap and avoids resurrecting a
        // callback for an fd that no longer exists).
        if self.inner.borrow().handlers.contains(fd) {
            *slot.borrow_mut() = Some(cb);
        }

        match result {
            Err(panic) => self.report_exception(panic.as_ref()),
            Ok(Err(e)) if e.is_broken_pipe() => {
                tracing::debug!(fd, "handler broken pipe, swallowed");
            }
            Ok(Err(e)) => self.report_exception_message(&e.to_string()),
            Ok(Ok(())) => {}
        }
    }

    /// Runs any queued callback or due timer under the panic guard, reporting and
    /// returning whether it enqueued new work (via either queue) so step 4 can poll
    /// with a zero timeout instead of possibly blocking past freshly-scheduled work.
    fn run_guarded<F: FnOnce()>(&self, cb: F) -> bool {
        let was_empty = |this: &Self| {
            this.inner.borrow().queue.is_empty() && this.inner.borrow().local_queue.borrow().is_empty()
        };
        let before = was_empty(self);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb));
        if let Err(panic) = result {
            self.report_exception(panic.as_ref());
        }
        let after = was_empty(self);
        !before || !after
    }

    // ---- test-only hooks ---------------------------------------------------------
    // Exposed so `periodic`'s catch-up cadence and the timer heap's GC thresholds can
    // be exercised deterministically without sleeping real wall-clock time.

    #[cfg(test)]
    #[must_use]
    pub fn manual_clock_for_test(&self) -> Rc<ManualClock> {
        let clock = Rc::new(ManualClock::new());
        self.inner.borrow_mut().clock = Clock::Manual(Rc::clone(&clock));
        clock
    }

    #[cfg(test)]
    pub fn drive_timers_for_test(&self) {
        let now = self.time();
        let due = self.inner.borrow_mut().timers.pop_due(now);
        for cb in due {
            cb();
        }
    }
}

fn maybe_gc(inner: &mut LoopInner) {
    let absolute = inner.cancellation_count > inner.config.gc_absolute_threshold;
    if absolute && inner.timers.gc_threshold_reached(inner.config.gc_load_factor) {
        inner.timers.compact();
        inner.cancellation_count = 0;
        tracing::trace!("timer heap tombstone GC ran");
    }
}
