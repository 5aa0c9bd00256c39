//! `mio::Poll`-backed implementation: epoll on Linux, kqueue on BSD/Darwin, IOCP on
//! Windows. This is the backend the loop uses by default — mio already hides the
//! per-OS readiness API behind one portable interface, which is exactly the contract
//! [`super::Backend`] needs, so we adapt rather than re-implement it.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::{Backend, ReadyEvent};
use crate::error::{LoopError, Result};
use crate::mask::EventMask;

/// Tracks the interest mask we last told mio about for each fd, since mio's
/// `reregister` needs the previous registration to still exist and `Events` only
/// reports readiness, not which mask triggered it — we reconstruct the reported mask
/// from what `Interest` was active plus what mio's event flags say fired.
#[derive(Debug)]
pub struct MioBackend {
    poll: Poll,
    events: Events,
    registered: HashMap<RawFd, Interest>,
}

const EVENTS_CAPACITY: usize = 256;

impl MioBackend {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(LoopError::from_io)?;
        Ok(Self { poll, events: Events::with_capacity(EVENTS_CAPACITY), registered: HashMap::new() })
    }
}

fn to_interest(mask: EventMask) -> Interest {
    // mio has no standalone "error" interest; error/hangup is always reported
    // alongside read or write readiness, so ERROR never needs its own bit here.
    match (mask.contains(EventMask::READ), mask.contains(EventMask::WRITE)) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

impl Backend for MioBackend {
    fn register(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
        if self.registered.contains_key(&fd) {
            return Err(LoopError::AlreadyRegistered { fd });
        }
        let interest = to_interest(mask);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
            .map_err(LoopError::from_io)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
        if !self.registered.contains_key(&fd) {
            return Err(LoopError::NotRegistered { fd });
        }
        let interest = to_interest(mask);
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            .map_err(LoopError::from_io)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_none() {
            return Err(LoopError::NotRegistered { fd });
        }
        self.poll.registry().deregister(&mut SourceFd(&fd)).map_err(LoopError::from_io)
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LoopError::from_io(e)),
            }
        }

        let mut out = Vec::with_capacity(self.events.iter().count());
        for event in &self.events {
            let fd = event.token().0 as RawFd;
            let mut mask = EventMask::NONE;
            if event.is_readable() {
                mask |= EventMask::READ;
            }
            if event.is_writable() {
                mask |= EventMask::WRITE;
            }
            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                mask |= EventMask::ERROR;
            }
            if !mask.is_empty() {
                out.push(ReadyEvent { fd, mask });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn readable_pipe_end_is_reported() {
        let mut backend = MioBackend::new().expect("poll creation should succeed");
        let (read_fd, write_fd) = pipe().expect("pipe creation should succeed");
        backend.register(read_fd.as_raw_fd(), EventMask::READ).expect("register should succeed");

        write(&write_fd, b"x").expect("write should succeed");

        let ready = backend.poll(Some(Duration::from_secs(1))).expect("poll should succeed");
        assert!(ready.iter().any(|e| e.fd == read_fd.as_raw_fd() && e.mask.contains(EventMask::READ)));
    }

    #[test]
    fn double_register_is_rejected() {
        let mut backend = MioBackend::new().expect("poll creation should succeed");
        let (read_fd, _write_fd) = pipe().expect("pipe creation should succeed");
        backend.register(read_fd.as_raw_fd(), EventMask::READ).unwrap();
        let err = backend.register(read_fd.as_raw_fd(), EventMask::READ).unwrap_err();
        assert!(matches!(err, LoopError::AlreadyRegistered { .. }));
    }
}
