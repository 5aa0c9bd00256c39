//! Bridges a `std::future::Future` onto the loop without pulling in a general task or
//! coroutine runtime (explicitly out of scope — see the futures non-goal). The loop
//! only ever needs to drive a handful of top-level futures to completion, so a minimal
//! [`std::task::Wake`]-based executor is enough; grounded on the reactor-and-waker
//! pattern of a small single-threaded async bridge rather than a scheduler.
//!
//! `std::task::Wake` requires `Send + Sync`, but the future itself, and everything it
//! closes over, lives behind `Rc`/`RefCell` and must stay on the loop thread. The
//! waker therefore never touches the future directly: it only holds a `u64` id and the
//! cross-thread-safe [`crate::queue::LoopHandle`], and schedules a lookup-by-id repoll
//! that runs on the loop thread, where a thread-local registry resolves the id back to
//! the `Rc`-based poll trampoline.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker as TaskWaker};
use std::time::Duration;

use crate::error::{LoopError, Result};
use crate::event_loop::EventLoop;
use crate::queue::LoopHandle;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

thread_local! {
    static REPOLLERS: RefCell<HashMap<u64, Rc<dyn Fn()>>> = RefCell::new(HashMap::new());
    static NEXT_ID: Cell<u64> = const { Cell::new(0) };
}

fn next_id() -> u64 { NEXT_ID.with(|n| { let v = n.get(); n.set(v + 1); v }) }

/// Looks up `id`'s repoll trampoline and invokes it. A miss means the future already
/// completed (and deregistered itself) between the wake being scheduled and it running
/// — harmless, the wake is simply stale.
fn repoll(id: u64) {
    let trampoline = REPOLLERS.with(|r| r.borrow().get(&id).cloned());
    if let Some(f) = trampoline {
        f();
    }
}

struct LoopWake {
    handle: LoopHandle,
    id: u64,
}

impl Wake for LoopWake {
    fn wake(self: Arc<Self>) {
        let id = self.id;
        self.handle.schedule(move || repoll(id));
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let id = self.id;
        self.handle.schedule(move || repoll(id));
    }
}

/// Drives `future` to completion on `event_loop`, invoking `on_complete` with its
/// output once it resolves. Matches `add_future`'s contract: completion always
/// happens on the loop thread, even if the future's own waker fires from elsewhere.
pub fn add_future<T: 'static>(
    event_loop: &EventLoop,
    future: impl Future<Output = T> + 'static,
    on_complete: impl FnOnce(T) + 'static,
) {
    let id = next_id();
    let slot: Rc<RefCell<Option<BoxFuture<T>>>> = Rc::new(RefCell::new(Some(Box::pin(future))));
    let on_complete: Rc<RefCell<Option<Box<dyn FnOnce(T)>>>> =
        Rc::new(RefCell::new(Some(Box::new(on_complete))));

    let event_loop_for_trampoline = event_loop.clone();
    let slot_for_trampoline = Rc::clone(&slot);
    let on_complete_for_trampoline = Rc::clone(&on_complete);
    let trampoline: Rc<dyn Fn()> = Rc::new(move || {
        poll_once(&event_loop_for_trampoline, id, &slot_for_trampoline, &on_complete_for_trampoline);
    });
    REPOLLERS.with(|r| r.borrow_mut().insert(id, trampoline));

    poll_once(event_loop, id, &slot, &on_complete);
}

fn poll_once<T: 'static>(
    event_loop: &EventLoop,
    id: u64,
    slot: &Rc<RefCell<Option<BoxFuture<T>>>>,
    on_complete: &Rc<RefCell<Option<Box<dyn FnOnce(T)>>>>,
) {
    let task_waker: TaskWaker =
        Arc::new(LoopWake { handle: event_loop.handle(), id }).into();
    let mut cx = Context::from_waker(&task_waker);

    let poll_result = {
        let mut borrowed = slot.borrow_mut();
        let Some(fut) = borrowed.as_mut() else { return };
        fut.as_mut().poll(&mut cx)
    };

    if let Poll::Ready(value) = poll_result {
        *slot.borrow_mut() = None;
        REPOLLERS.with(|r| r.borrow_mut().remove(&id));
        if let Some(cb) = on_complete.borrow_mut().take() {
            cb(value);
        }
    }
}

/// Runs `event_loop` synchronously until `f`'s future completes (or `timeout`
/// elapses), mirroring Tornado's `IOLoop.run_sync`. If `f` returns a plain value
/// rather than a future, it's treated as already complete.
pub fn run_sync<T: 'static>(
    event_loop: &EventLoop,
    f: impl FnOnce() -> BoxFuture<T>,
    timeout: Option<Duration>,
) -> Result<T> {
    let result: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
    let result_for_complete = Rc::clone(&result);
    let event_loop_for_stop = event_loop.clone();

    let future = f();
    add_future(event_loop, future, move |value| {
        *result_for_complete.borrow_mut() = Some(value);
        event_loop_for_stop.stop();
    });

    let timeout_handle = timeout.map(|t| {
        let event_loop_for_timeout = event_loop.clone();
        event_loop.call_later(t, Box::new(move || event_loop_for_timeout.stop()))
    });

    event_loop.start()?;

    if let Some(handle) = &timeout_handle {
        event_loop.remove_timeout(handle);
    }

    result.borrow_mut().take().ok_or(LoopError::OperationTimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    struct Ready<T>(Option<T>);
    impl<T: Unpin> Future for Ready<T> {
        type Output = T;
        fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
            Poll::Ready(self.0.take().expect("polled after completion"))
        }
    }

    #[test]
    fn already_ready_future_completes_on_first_poll() {
        let event_loop = EventLoop::new().unwrap();
        let completed = Rc::new(StdCell::new(false));
        let completed_clone = Rc::clone(&completed);
        add_future(&event_loop, Ready(Some(42)), move |value| {
            assert_eq!(value, 42);
            completed_clone.set(true);
        });
        assert!(completed.get(), "an already-ready future should complete synchronously on first poll");
    }

    #[test]
    fn run_sync_returns_the_resolved_value() {
        let event_loop = EventLoop::new().unwrap();
        let value = run_sync(&event_loop, || Box::pin(Ready(Some(7))) as BoxFuture<i32>, None).unwrap();
        assert_eq!(value, 7);
    }
}
