//! Self-rescheduling periodic callback with catch-up semantics: a slow callback never
//! causes a backlog of queued fires, it just skips the ticks it missed and realigns to
//! the original grid.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::event_loop::EventLoop;
use crate::timer::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
}

struct Inner {
    period: Duration,
    callback: RefCell<Box<dyn FnMut()>>,
    next_fire: Cell<Duration>,
    state: Cell<State>,
    pending: RefCell<Option<TimerHandle>>,
}

/// A periodic timer. Must be driven by the same [`EventLoop`] it was created on —
/// `start`/`stop` are not cross-thread safe, matching every other timer operation.
#[derive(Clone)]
pub struct PeriodicCallback {
    inner: Rc<Inner>,
    event_loop: Weak<RefCell<crate::event_loop::LoopInner>>,
}

impl std::fmt::Debug for PeriodicCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicCallback")
            .field("period", &self.inner.period)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl PeriodicCallback {
    /// `period` must be greater than zero; the event loop's driver will never observe
    /// a zero period since callers construct this only through
    /// [`EventLoop::periodic`], which enforces the invariant.
    pub(crate) fn new(
        event_loop: &EventLoop,
        period: Duration,
        callback: Box<dyn FnMut()>,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                period,
                callback: RefCell::new(callback),
                next_fire: Cell::new(Duration::ZERO),
                state: Cell::new(State::Idle),
                pending: RefCell::new(None),
            }),
            event_loop: event_loop.downgrade(),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool { self.inner.state.get() == State::Running }

    /// Arms the periodic timer starting now. A no-op if already running.
    pub fn start(&self) {
        if self.inner.state.get() == State::Running {
            return;
        }
        self.inner.state.set(State::Running);
        let Some(event_loop) = self.event_loop.upgrade() else { return };
        let now = EventLoop::clock_now(&event_loop);
        self.inner.next_fire.set(now);
        self.arm(now);
    }

    /// Cancels the pending fire and returns to idle. Safe to call whether or not the
    /// callback is currently running.
    pub fn stop(&self) {
        self.inner.state.set(State::Idle);
        if let Some(handle) = self.inner.pending.borrow_mut().take() {
            handle.cancel();
        }
    }

    fn arm(&self, deadline: Duration) {
        let Some(event_loop) = self.event_loop.upgrade() else { return };
        let this = self.clone();
        let handle = EventLoop::schedule_timer_at(&event_loop, deadline, Box::new(move || this.fire()));
        *self.inner.pending.borrow_mut() = Some(handle);
    }

    fn fire(&self) {
        if self.inner.state.get() != State::Running {
            return;
        }
        // Run the callback first; its duration is exactly what catch-up accounts for.
        (self.inner.callback.borrow_mut())();

        if self.inner.state.get() != State::Running {
            // `stop()` was called reentrantly from within the callback.
            return;
        }

        let Some(event_loop) = self.event_loop.upgrade() else { return };
        let now = EventLoop::clock_now(&event_loop);
        let period = self.inner.period;
        let mut next = self.inner.next_fire.get();

        if next <= now {
            let elapsed = now - next;
            let periods_missed = elapsed.as_nanos() / period.as_nanos().max(1);
            next += period * u32::try_from(periods_missed + 1).unwrap_or(u32::MAX);
            if periods_missed > 0 {
                let skipped = u64::try_from(periods_missed).unwrap_or(u64::MAX);
                let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
                tracing::debug!(skipped, period_ms, "periodic callback caught up, skipping missed ticks");
            }
        }
        self.inner.next_fire.set(next);
        self.arm(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::cell::Cell as StdCell;

    #[test]
    fn catch_up_skips_missed_ticks_instead_of_queueing_them() {
        let event_loop = EventLoop::new().unwrap();
        let clock = event_loop.manual_clock_for_test();
        let count = Rc::new(StdCell::new(0u32));
        let count_clone = Rc::clone(&count);

        let period = Duration::from_millis(10);
        let periodic = event_loop.periodic(period, Box::new(move || {
            count_clone.set(count_clone.get() + 1);
        }));
        periodic.start();

        // Simulate a callback that effectively ran 35ms late relative to its period by
        // advancing the clock past several ticks before the timer is driven.
        clock.advance(Duration::from_millis(35));
        event_loop.drive_timers_for_test();

        assert_eq!(count.get(), 1, "only one fire should have executed despite multiple missed periods");
    }
}
