//! Self-pipe waker: lets `schedule_from_signal` and cross-thread `schedule` interrupt a
//! blocking backend poll without taking a lock. Grounded on the signal-hook low-level
//! pipe primitive — a non-blocking pipe where the write side is safe to hit from a
//! signal handler or another thread, and the read side is drained by the loop thread
//! each iteration.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read, write};

use crate::error::{LoopError, Result};

/// One byte written per wake; draining ignores the payload entirely.
const WAKE_BYTE: [u8; 1] = [1];

/// A non-blocking pipe used purely as a wakeup signal. `write_fd` is safe to call from
/// any thread, or from inside a signal handler once `schedule_from_signal` has queued
/// the callback — the write only needs to be async-signal-safe, which `write(2)` is.
#[derive(Debug)]
pub struct Waker {
    read_fd: std::os::unix::io::OwnedFd,
    write_fd: std::os::unix::io::OwnedFd,
    /// Coalesces repeated wakes: a pending unconsumed byte means another wake is
    /// redundant, so we don't pile up writes the read side will just drain one by one.
    armed: AtomicBool,
    /// Set by `close`. Once true, `wake`/`consume` are no-ops. The underlying fds are
    /// deliberately left open until the last `Arc<Waker>` drops rather than closed here
    /// — a cross-thread `LoopHandle` may still hold a clone, and closing the fd out from
    /// under it would risk a write landing on an unrelated fd the kernel reused in the
    /// meantime.
    closed: AtomicBool,
}

impl Waker {
    /// Creates the pipe and puts both ends in non-blocking mode. Non-blocking on the
    /// write side matters: a signal handler or a scheduler thread must never block on
    /// a full pipe buffer, it must drop the extra wake and move on.
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe().map_err(io_err)?;
        set_nonblocking(read_fd.as_raw_fd())?;
        set_nonblocking(write_fd.as_raw_fd())?;
        Ok(Self { read_fd, write_fd, armed: AtomicBool::new(false), closed: AtomicBool::new(false) })
    }

    /// Fd the backend registers for read-readiness.
    #[must_use]
    pub fn read_fd(&self) -> RawFd { self.read_fd.as_raw_fd() }

    #[must_use]
    pub fn write_fd(&self) -> RawFd { self.write_fd.as_raw_fd() }

    /// Writes one wake byte, unless a previous wake is still unconsumed. Safe to call
    /// from a signal handler: `write(2)` to an already-open fd is async-signal-safe,
    /// and `compare_exchange` on an `AtomicBool` involves no allocation or lock.
    pub fn wake(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.armed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let fd = self.write_fd.as_raw_fd();
            // EAGAIN means the pipe buffer is full of prior wake bytes; that's fine,
            // the loop thread still has something to drain. Any other error is not
            // recoverable from a signal context so it's simply dropped.
            let _ = write(&self.write_fd, &WAKE_BYTE);
            let _ = fd;
        }
    }

    /// Drains every pending wake byte. Called once per loop iteration after the
    /// backend poll returns readable on `read_fd`. Returns the number of bytes
    /// consumed (for diagnostics only — callers don't need to interpret it).
    pub fn consume(&self) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut buf = [0u8; 64];
        let mut total = 0usize;
        loop {
            match read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io_err(e)),
            }
        }
        self.armed.store(false, Ordering::Release);
        Ok(total)
    }

    /// Retires the waker: further `wake`/`consume` calls become no-ops. Idempotent.
    /// Called from `EventLoop::close`; the fds themselves are released once every
    /// `Arc<Waker>` (including any cross-thread `LoopHandle` clones) drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io_err)?;
    Ok(())
}

fn io_err(err: nix::errno::Errno) -> LoopError {
    LoopError::from_io(std::io::Error::from(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_consume_drains_exactly_one_round() {
        let waker = Waker::new().expect("pipe creation should succeed");
        waker.wake();
        let n = waker.consume().expect("consume should succeed");
        assert_eq!(n, 1);
        // A second consume with nothing pending drains zero bytes.
        assert_eq!(waker.consume().unwrap(), 0);
    }

    #[test]
    fn repeated_wake_coalesces_to_one_pending_byte() {
        let waker = Waker::new().expect("pipe creation should succeed");
        waker.wake();
        waker.wake();
        waker.wake();
        let n = waker.consume().expect("consume should succeed");
        assert_eq!(n, 1, "armed flag should have coalesced the extra wakes");
    }

    #[test]
    fn wake_is_callable_after_consume_rearms() {
        let waker = Waker::new().expect("pipe creation should succeed");
        waker.wake();
        waker.consume().unwrap();
        waker.wake();
        assert_eq!(waker.consume().unwrap(), 1);
    }

    #[test]
    fn closed_waker_ignores_wake_and_consume() {
        let waker = Waker::new().expect("pipe creation should succeed");
        waker.close();
        assert!(waker.is_closed());
        waker.wake();
        assert_eq!(waker.consume().unwrap(), 0);
    }
}
