//! Timer heap with lazy tombstone cancellation.
//!
//! Cancelling a timer doesn't touch the heap — it just clears the callback slot,
//! leaving a "tombstone" entry that `pop_due` skips over when its turn comes. This
//! keeps `cancel` O(log n) amortized instead of requiring an O(n) heap-internal
//! search, at the cost of the heap accumulating dead entries, which is why
//! `EventLoop` periodically calls [`TimerHeap::gc_threshold_reached`] and
//! [`TimerHeap::compact`] to bound that growth.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Duration;

/// Opaque handle returned from `call_at`/`call_later`/`add_timeout`. Cancelling
/// through this handle after the timer has already fired is a harmless no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    slot: Rc<RefCell<Option<TimerCallback>>>,
    seq: u64,
}

impl TimerHandle {
    /// Clears this timer's callback slot. The heap entry itself is left in place as a
    /// tombstone and skipped by `pop_due`.
    pub fn cancel(&self) {
        self.slot.borrow_mut().take();
    }

    #[must_use]
    pub fn is_pending(&self) -> bool { self.slot.borrow().is_some() }

    #[must_use]
    pub(crate) fn seq(&self) -> u64 { self.seq }
}

pub type TimerCallback = Box<dyn FnOnce()>;

struct TimerEntry {
    deadline: Duration,
    seq: u64,
    slot: Rc<RefCell<Option<TimerCallback>>>,
}

/// Min-heap ordering: earliest deadline first, ties broken by insertion order so
/// timers scheduled for the same instant fire in the order they were added.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool { self.deadline == other.deadline && self.seq == other.seq }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Amortizes tombstone cleanup: once cancelled-but-not-yet-popped entries exceed this
/// fraction of the heap, `EventLoop` triggers a compaction pass.
pub const GC_LOAD_FACTOR: f64 = 0.5;

pub struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    /// Entries known to be tombstoned but not yet removed from `heap`. Tracked
    /// separately from a heap scan because `BinaryHeap` has no cheap "is this dead"
    /// query short of popping.
    tombstones: usize,
}

impl std::fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHeap")
            .field("len", &self.heap.len())
            .field("tombstones", &self.tombstones)
            .finish()
    }
}

impl TimerHeap {
    #[must_use]
    pub fn new() -> Self { Self { heap: BinaryHeap::new(), next_seq: 0, tombstones: 0 } }

    #[must_use]
    pub fn len(&self) -> usize { self.heap.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.heap.is_empty() }

    pub fn insert(&mut self, deadline: Duration, callback: TimerCallback) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = Rc::new(RefCell::new(Some(callback)));
        self.heap.push(Reverse(TimerEntry { deadline, seq, slot: Rc::clone(&slot) }));
        TimerHandle { slot, seq }
    }

    /// Deadline of the earliest *live* entry, skipping (and permanently discarding)
    /// any tombstones found along the way. Used by the loop driver to compute the
    /// next poll timeout.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_leading_tombstones();
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Pops and returns every timer whose deadline is `<= now`, skipping tombstones.
    /// Callbacks are returned rather than invoked here so the caller can run them
    /// outside of any borrow this heap itself might be participating in.
    pub fn pop_due(&mut self, now: Duration) -> Vec<TimerCallback> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peek just confirmed an entry");
            match entry.slot.borrow_mut().take() {
                Some(cb) => fired.push(cb),
                None => self.tombstones = self.tombstones.saturating_sub(1),
            }
        }
        fired
    }

    fn discard_leading_tombstones(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.slot.borrow().is_some() {
                break;
            }
            self.heap.pop();
            self.tombstones = self.tombstones.saturating_sub(1);
        }
    }

    /// Call this whenever [`TimerHandle::cancel`] is invoked, so the tombstone count
    /// stays accurate for [`TimerHeap::gc_threshold_reached`].
    pub fn note_cancelled(&mut self) { self.tombstones += 1; }

    #[must_use]
    pub fn gc_threshold_reached(&self, load_factor: f64) -> bool {
        !self.heap.is_empty() && (self.tombstones as f64 / self.heap.len() as f64) >= load_factor
    }

    /// Rebuilds the heap with every tombstone dropped. O(n); only called when
    /// [`TimerHeap::gc_threshold_reached`] says the dead-entry fraction warrants it.
    pub fn compact(&mut self) {
        let live: Vec<_> = self.heap.drain().filter(|Reverse(e)| e.slot.borrow().is_some()).collect();
        self.heap = live.into_iter().collect();
        self.tombstones = 0;
    }

    /// Drops every pending timer without running it. Called from `EventLoop::close`
    /// to null out the heap per the teardown contract; never called while the loop is
    /// running.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.tombstones = 0;
    }
}

impl Default for TimerHeap {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        heap.insert(Duration::from_secs(2), Box::new(move || o1.borrow_mut().push(2)));
        heap.insert(Duration::from_secs(1), Box::new(move || o2.borrow_mut().push(1)));

        for cb in heap.pop_due(Duration::from_secs(5)) {
            cb();
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut heap = TimerHeap::new();
        let fired = Rc::new(Cell::new(false));
        let fired_clone = Rc::clone(&fired);
        let handle = heap.insert(Duration::from_secs(1), Box::new(move || fired_clone.set(true)));
        handle.cancel();
        heap.note_cancelled();

        let due = heap.pop_due(Duration::from_secs(5));
        assert!(due.is_empty());
        assert!(!fired.get());
    }

    #[test]
    fn compact_drops_tombstones_and_keeps_live_entries() {
        let mut heap = TimerHeap::new();
        let h1 = heap.insert(Duration::from_secs(1), Box::new(|| {}));
        heap.insert(Duration::from_secs(2), Box::new(|| {}));
        h1.cancel();
        heap.note_cancelled();

        assert!(heap.gc_threshold_reached(GC_LOAD_FACTOR));
        heap.compact();
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.next_deadline(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn same_deadline_ties_break_by_insertion_order() {
        let mut heap = TimerHeap::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        heap.insert(Duration::from_secs(1), Box::new(move || o1.borrow_mut().push('a')));
        heap.insert(Duration::from_secs(1), Box::new(move || o2.borrow_mut().push('b')));

        for cb in heap.pop_due(Duration::from_secs(1)) {
            cb();
        }
        assert_eq!(*order.borrow(), vec!['a', 'b']);
    }
}
