//! Time source abstraction. Part of the loop state per the data model: the loop never
//! calls `Instant::now()` directly so tests can substitute a controllable clock (e.g.
//! the periodic-cadence and tombstone-GC tests drive time forward without sleeping).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A source of monotonic "loop time". Implementations must be cheap to call since
/// `now()` is read at least once per iteration.
///
/// No `Send`/`Sync` bound: the loop's own clock is reached only through `EventLoop`,
/// which is itself `!Send`, and the manual test clock is shared via `Rc` for the same
/// single-owner-thread reason.
pub trait TimeSource {
    fn now(&self) -> Duration;
}

/// Wall-clock time source backed by [`Instant`], pinned to an epoch captured at
/// construction so deadlines fit in a plain [`Duration`].
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self { Self { epoch: Instant::now() } }
}

impl Default for MonotonicClock {
    fn default() -> Self { Self::new() }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Duration { self.epoch.elapsed() }
}

/// A manually-advanced clock for deterministic tests. `now()` reports whatever was last
/// set via [`ManualClock::advance`]/[`ManualClock::set`]; nothing advances on its own.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self { Self { nanos: AtomicU64::new(0) } }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(u64::try_from(by.as_nanos()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(u64::try_from(at.as_nanos()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Duration { Duration::from_nanos(self.nanos.load(Ordering::SeqCst)) }
}
