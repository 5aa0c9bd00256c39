//! S2: timers scheduled out of deadline order fire in deadline order, and all land
//! inside a generous wall-clock window.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use reactor_loop::EventLoop;

#[test]
fn timers_fire_earliest_deadline_first() {
    let event_loop = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let start = Instant::now();
    let now = event_loop.time();

    for (label, delay_ms) in [("30ms", 30u64), ("10ms", 10), ("20ms", 20)] {
        let order_clone = Rc::clone(&order);
        let event_loop_for_last = event_loop.clone();
        let is_last = label == "30ms";
        event_loop.call_at(now + Duration::from_millis(delay_ms), Box::new(move || {
            order_clone.borrow_mut().push(label);
            if is_last {
                event_loop_for_last.stop();
            }
        }));
    }

    event_loop.start().unwrap();

    assert_eq!(*order.borrow(), vec!["10ms", "20ms", "30ms"]);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(10) && elapsed <= Duration::from_millis(150));
}
