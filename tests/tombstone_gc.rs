//! Invariant 5 (black-box view): inserting 10,000 timers and cancelling 6,000 of them
//! before they're due leaves exactly the surviving 4,000 to fire — cancellation holds
//! at the scale where `remove_timeout`'s amortized tombstone GC (triggered once
//! cancellations cross both the absolute and relative thresholds) actually runs.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use reactor_loop::EventLoop;

#[test]
fn cancelling_6000_of_10000_timers_leaves_exactly_4000_firing() {
    let event_loop = EventLoop::new().unwrap();
    let now = event_loop.time();
    let fired = Rc::new(Cell::new(0u32));

    let mut handles = Vec::with_capacity(10_000);
    for i in 0..10_000u64 {
        let fired_clone = Rc::clone(&fired);
        let handle = event_loop.call_at(
            now + Duration::from_millis(i % 20),
            Box::new(move || fired_clone.set(fired_clone.get() + 1)),
        );
        handles.push(handle);
    }
    for handle in handles.iter().take(6_000) {
        event_loop.remove_timeout(handle);
    }

    let event_loop_for_stop = event_loop.clone();
    event_loop.call_later(Duration::from_millis(100), Box::new(move || event_loop_for_stop.stop()));
    event_loop.start().unwrap();

    assert_eq!(fired.get(), 4_000);
}
