//! Direct `select(2)` backend. Exists for the fd ranges and platforms where mio's
//! epoll/kqueue path either isn't available or isn't wanted (e.g. piping through a
//! non-socket, non-evented fd type mio refuses to register). O(n) per poll in the
//! number of registered fds, same ceiling `select(2)` itself imposes — acceptable for
//! the small handler counts this variant targets; callers with large fd counts should
//! use [`super::mio_backend::MioBackend`] instead.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};

use super::{Backend, ReadyEvent};
use crate::error::{LoopError, Result};
use crate::mask::EventMask;

#[derive(Debug)]
pub struct SelectBackend {
    registered: BTreeMap<RawFd, EventMask>,
}

impl SelectBackend {
    #[must_use]
    pub fn new() -> Self { Self { registered: BTreeMap::new() } }
}

impl Default for SelectBackend {
    fn default() -> Self { Self::new() }
}

impl Backend for SelectBackend {
    fn register(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
        if self.registered.contains_key(&fd) {
            return Err(LoopError::AlreadyRegistered { fd });
        }
        self.registered.insert(fd, mask);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
        if !self.registered.contains_key(&fd) {
            return Err(LoopError::NotRegistered { fd });
        }
        self.registered.insert(fd, mask);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_none() {
            return Err(LoopError::NotRegistered { fd });
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        if self.registered.is_empty() {
            // `select(2)` with no fds and no timeout would block forever with nothing
            // to ever wake it; the loop driver should not call us in that state, but
            // if it does, honor the timeout as a sleep instead of erroring.
            if let Some(t) = timeout {
                std::thread::sleep(t);
            }
            return Ok(Vec::new());
        }

        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        let mut except_set = FdSet::new();
        let mut max_fd = 0;
        for (&fd, mask) in &self.registered {
            if mask.contains(EventMask::READ) {
                read_set.insert(fd);
            }
            if mask.contains(EventMask::WRITE) {
                write_set.insert(fd);
            }
            // ERROR is implicit on every registration; select always reports
            // exceptional conditions on the except set regardless of R/W interest.
            except_set.insert(fd);
            max_fd = max_fd.max(fd);
        }

        let mut tv = timeout.map(|d| TimeVal::milliseconds(d.as_millis() as i64));

        loop {
            let mut r = read_set.clone();
            let mut w = write_set.clone();
            let mut e = except_set.clone();
            match select(max_fd + 1, &mut r, &mut w, &mut e, tv.as_mut()) {
                Ok(_) => {
                    let mut out = Vec::new();
                    for (&fd, _) in &self.registered {
                        let mut mask = EventMask::NONE;
                        if r.contains(fd) {
                            mask |= EventMask::READ;
                        }
                        if w.contains(fd) {
                            mask |= EventMask::WRITE;
                        }
                        if e.contains(fd) {
                            mask |= EventMask::ERROR;
                        }
                        if !mask.is_empty() {
                            out.push(ReadyEvent { fd, mask });
                        }
                    }
                    return Ok(out);
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(LoopError::from_io(std::io::Error::from(err))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn readable_pipe_end_is_reported() {
        let mut backend = SelectBackend::new();
        let (read_fd, write_fd) = nix::unistd::pipe().expect("pipe creation should succeed");
        backend.register(read_fd.as_raw_fd(), EventMask::READ).unwrap();
        write(&write_fd, b"x").unwrap();

        let ready = backend.poll(Some(Duration::from_secs(1))).expect("poll should succeed");
        assert!(ready.iter().any(|e| e.fd == read_fd.as_raw_fd() && e.mask.contains(EventMask::READ)));
    }

    #[test]
    fn poll_with_nothing_registered_honors_timeout_without_blocking_forever() {
        let mut backend = SelectBackend::new();
        let start = std::time::Instant::now();
        let ready = backend.poll(Some(Duration::from_millis(20))).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn double_register_is_rejected() {
        let mut backend = SelectBackend::new();
        backend.register(0, EventMask::READ).unwrap();
        let err = backend.register(0, EventMask::READ).unwrap_err();
        assert!(matches!(err, LoopError::AlreadyRegistered { .. }));
    }
}
