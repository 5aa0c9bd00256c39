//! Process-wide loop registry.
//!
//! The spec's two slots — a lazily-initialized default instance and a per-thread
//! current-loop slot — both have to be adapted to `EventLoop` being deliberately
//! `!Send` (it owns `Rc<RefCell<_>>` state, per the single-owner-thread model in
//! §5). The adaptation kept here:
//!
//! - [`instance`] is itself thread-local: each thread gets its own lazily-constructed
//!   default `EventLoop` the first time it asks for one, mirroring what a thread-local
//!   default would mean for a type that can't cross threads at all.
//! - A separate, genuinely process-wide [`OnceLock<Mutex<Option<LoopHandle>>>`] holds
//!   only the cross-thread-safe [`LoopHandle`] — that's the piece other threads can
//!   legitimately reach for, via [`install`]/[`global_handle`]/[`clear_instance`].
//! - [`current`] is the per-thread *running* loop, set only while `start()` is on the
//!   stack, exactly as in the spec.

use std::cell::RefCell;
use std::rc::Weak;
use std::sync::{Mutex, OnceLock};

use crate::error::{LoopError, Result};
use crate::event_loop::{EventLoop, LoopInner};
use crate::queue::LoopHandle;

thread_local! {
    static CURRENT: RefCell<Option<Weak<RefCell<LoopInner>>>> = const { RefCell::new(None) };
    static THREAD_INSTANCE: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

static DEFAULT_HANDLE: OnceLock<Mutex<Option<LoopHandle>>> = OnceLock::new();

fn default_slot() -> &'static Mutex<Option<LoopHandle>> {
    DEFAULT_HANDLE.get_or_init(|| Mutex::new(None))
}

/// Returns the loop currently running on *this* thread, if any.
#[must_use]
pub fn current() -> Option<EventLoop> {
    CURRENT.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade)).map(EventLoop::from_inner)
}

/// Marks `event_loop` as the one running on this thread. `start()` calls this on
/// entry; exposed publicly per the spec's Loop API so an embedder driving its own
/// run loop (rather than calling `start()`) can still make `current()` resolve
/// correctly inside callbacks it dispatches by hand.
pub fn make_current(event_loop: &EventLoop) {
    CURRENT.with(|slot| {
        *slot.borrow_mut() = Some(event_loop.downgrade());
    });
}

/// Clears the per-thread current-loop slot. `start()` calls this on exit (including
/// via panic unwind through its `Drop` guard); exposed publicly alongside
/// [`make_current`].
pub fn clear_current() {
    CURRENT.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

/// Returns this thread's default loop, constructing one with [`LoopConfig::default`]
/// on first use and opportunistically publishing its handle to the process-wide slot
/// (best-effort: if another thread's default already claimed that slot, this thread's
/// loop still exists and is returned, it just isn't the one cross-thread callers see).
#[must_use]
pub fn instance() -> EventLoop {
    THREAD_INSTANCE.with(|slot| {
        if let Some(existing) = slot.borrow().as_ref() {
            return existing.clone();
        }
        let event_loop =
            EventLoop::new().expect("default loop construction should not fail");
        let _ = install(event_loop.handle());
        *slot.borrow_mut() = Some(event_loop.clone());
        event_loop
    })
}

/// The process-wide cross-thread handle, if any thread has installed one (either via
/// [`instance`] or explicit [`install`]).
#[must_use]
pub fn global_handle() -> Option<LoopHandle> {
    default_slot().lock().expect("default instance mutex poisoned").clone()
}

/// Installs `handle` as the process-wide default. Fails with `AlreadyRunning` if one
/// is already installed.
pub fn install(handle: LoopHandle) -> Result<()> {
    let mut guard = default_slot().lock().expect("default instance mutex poisoned");
    if guard.is_some() {
        return Err(LoopError::AlreadyRunning);
    }
    *guard = Some(handle);
    Ok(())
}

/// Removes the process-wide default handle, if any.
pub fn clear_instance() {
    *default_slot().lock().expect("default instance mutex poisoned") = None;
}
