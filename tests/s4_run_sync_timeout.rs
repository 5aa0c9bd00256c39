//! S4: `run_sync` on a future that never completes fails with `OperationTimedOut`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use reactor_loop::future_bridge::run_sync;
use reactor_loop::{EventLoop, LoopError};

struct Never;
impl Future for Never {
    type Output = ();
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> { Poll::Pending }
}

#[test]
fn run_sync_times_out_on_a_future_that_never_completes() {
    let event_loop = EventLoop::new().unwrap();
    let result = run_sync(&event_loop, || Box::pin(Never) as Pin<Box<dyn Future<Output = ()>>>, Some(Duration::from_millis(50)));
    assert!(matches!(result, Err(LoopError::OperationTimedOut)));
}
