//! Handler table: the map from registered fd to its interest mask and callback.
//!
//! Each entry's callback lives in its own `RefCell`, not behind one table-wide lock,
//! so dispatching one handler only ever borrows that handler's slot. A callback that
//! reenters the loop — e.g. to call `update_handler` on a *different* fd — never
//! collides with the borrow `dispatch_one` is holding for its own fd.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::error::{LoopError, Result};
use crate::mask::EventMask;

/// Callback invoked when a registered fd becomes ready. Receives the mask of events
/// that actually fired (a subset of the handler's registered interest). A returned
/// `Err` is classified by the dispatcher: `LoopError::BrokenPipe` is swallowed
/// silently (the peer went away, nothing to report), anything else is routed to
/// `handle_callback_exception` exactly like a caught panic.
pub type HandlerCallback = Box<dyn FnMut(EventMask) -> Result<()>>;

struct HandlerEntry {
    mask: EventMask,
    /// `None` while a callback is checked out for invocation (see
    /// [`HandlerTable::checkout`]); callers must never observe this state, only
    /// `dispatch_one` holds it transiently.
    callback: Rc<RefCell<Option<HandlerCallback>>>,
}

/// Owns every registered (fd, mask, callback) triple. Registration bookkeeping only —
/// talking to the OS backend is [`crate::backend::Backend`]'s job; the event loop
/// keeps the two in sync.
#[derive(Default)]
pub struct HandlerTable {
    entries: HashMap<RawFd, HandlerEntry>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable").field("registered", &self.entries.len()).finish()
    }
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// `ERROR` is implicitly OR'd into every mask — a handler is always interested in
    /// hangup/error on its own fd, per the data model.
    pub fn add(&mut self, fd: RawFd, mask: EventMask, callback: HandlerCallback) -> Result<()> {
        if self.entries.contains_key(&fd) {
            return Err(LoopError::AlreadyRegistered { fd });
        }
        let mask = mask | EventMask::ERROR;
        self.entries.insert(
            fd,
            HandlerEntry { mask, callback: Rc::new(RefCell::new(Some(callback))) },
        );
        Ok(())
    }

    pub fn update_mask(&mut self, fd: RawFd, mask: EventMask) -> Result<EventMask> {
        let entry = self.entries.get_mut(&fd).ok_or(LoopError::NotRegistered { fd })?;
        entry.mask = mask | EventMask::ERROR;
        Ok(entry.mask)
    }

    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        self.entries.remove(&fd).map(|_| ()).ok_or(LoopError::NotRegistered { fd })
    }

    #[must_use]
    pub fn contains(&self, fd: RawFd) -> bool { self.entries.contains_key(&fd) }

    #[must_use]
    pub fn mask_of(&self, fd: RawFd) -> Option<EventMask> { self.entries.get(&fd).map(|e| e.mask) }

    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Snapshots every currently-registered fd, for callers (`EventLoop::close`) that
    /// need to tear the whole table down without holding a borrow across the teardown.
    #[must_use]
    pub fn fds(&self) -> Vec<RawFd> { self.entries.keys().copied().collect() }

    /// Checks a callback out for invocation: clones the `Rc` slot and returns it along
    /// with whether the fd is still registered, without holding any borrow across the
    /// call site. The caller (`dispatch_one`) then briefly borrows the slot, takes the
    /// `FnMut` out, drops the borrow, invokes it, and puts it back — so a reentrant
    /// call into `HandlerTable::remove`/`add` for a *different* fd never observes a
    /// live borrow from this one's invocation.
    pub(crate) fn checkout(&self, fd: RawFd) -> Option<Rc<RefCell<Option<HandlerCallback>>>> {
        self.entries.get(&fd).map(|e| Rc::clone(&e.callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn add_then_add_same_fd_is_rejected() {
        let mut table = HandlerTable::new();
        table.add(3, EventMask::READ, Box::new(|_| Ok(()))).unwrap();
        let err = table.add(3, EventMask::READ, Box::new(|_| Ok(()))).unwrap_err();
        assert!(matches!(err, LoopError::AlreadyRegistered { fd: 3 }));
    }

    #[test]
    fn add_implicitly_sets_error_interest() {
        let mut table = HandlerTable::new();
        table.add(4, EventMask::READ, Box::new(|_| Ok(()))).unwrap();
        assert!(table.mask_of(4).unwrap().contains(EventMask::ERROR));
    }

    #[test]
    fn remove_unregistered_fd_errors() {
        let mut table = HandlerTable::new();
        assert!(matches!(table.remove(9).unwrap_err(), LoopError::NotRegistered { fd: 9 }));
    }

    #[test]
    fn checkout_allows_reentrant_removal_of_a_different_fd() {
        let mut table = HandlerTable::new();
        let fired = Rc::new(Cell::new(false));
        let fired_clone = Rc::clone(&fired);
        table.add(5, EventMask::READ, Box::new(move |_| { fired_clone.set(true); Ok(()) })).unwrap();
        table.add(6, EventMask::READ, Box::new(|_| Ok(()))).unwrap();

        let slot = table.checkout(5).unwrap();
        let mut cb = slot.borrow_mut().take().unwrap();
        let _ = cb(EventMask::READ);
        // Reentrant call while `cb` is detached from its slot: must not panic.
        table.remove(6).unwrap();
        assert!(fired.get());
    }
}
