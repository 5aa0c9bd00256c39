//! Readiness-backend abstraction. One trait, two implementations: [`mio_backend`]
//! (epoll on Linux, kqueue on BSD/Darwin, both through `mio::Poll`) and
//! [`select_backend`] (a direct `select(2)` wrapper for platforms or fd ranges mio
//! doesn't cover). The loop driver only ever talks to the [`Backend`] trait.

pub mod mio_backend;
pub mod select_backend;

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::mask::EventMask;

/// One readiness notification returned from a poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub mask: EventMask,
}

/// Which concrete backend to construct. `Auto` picks the edge-poll/kernel-queue
/// backend when the target OS supports it, falling back to portable select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Auto,
    EdgePoll,
    PortableSelect,
}

/// Readiness multiplexing contract. Implementations are level-triggered: a fd that
/// stays readable is reported on every poll until its interest mask is cleared or it's
/// deregistered, mirroring the spec's level-triggered requirement so handlers don't
/// need to re-arm interest after every event.
pub trait Backend: std::fmt::Debug {
    /// Starts watching `fd` for the given interest. Errors if `fd` is already
    /// registered with this backend.
    fn register(&mut self, fd: RawFd, mask: EventMask) -> Result<()>;

    /// Replaces the interest mask for an already-registered `fd`.
    fn reregister(&mut self, fd: RawFd, mask: EventMask) -> Result<()>;

    /// Stops watching `fd` entirely.
    fn deregister(&mut self, fd: RawFd) -> Result<()>;

    /// Blocks up to `timeout` (or indefinitely if `None`) for at least one
    /// registered fd to become ready, then reports every ready fd found.
    /// `Ok(vec![])` on timeout with nothing ready. Retries internally on `EINTR`
    /// rather than surfacing `LoopError::Interrupted` to the caller.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>>;
}

/// Constructs the requested backend, or the best available one for `Auto`.
pub fn build(kind: BackendKind) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Auto | BackendKind::EdgePoll => {
            Ok(Box::new(mio_backend::MioBackend::new()?))
        }
        BackendKind::PortableSelect => Ok(Box::new(select_backend::SelectBackend::new())),
    }
}

/// Inert stand-in installed by `EventLoop::close` in place of the real backend, so the
/// underlying poller is released immediately rather than only once the whole
/// `EventLoop` drops. Every operation is a no-op; `poll` returns empty as if nothing
/// were ever ready, since nothing should be calling it again after `close`.
#[derive(Debug, Default)]
pub struct ClosedBackend;

impl Backend for ClosedBackend {
    fn register(&mut self, _fd: RawFd, _mask: EventMask) -> Result<()> {
        Err(crate::error::LoopError::LoopClosing)
    }

    fn reregister(&mut self, _fd: RawFd, _mask: EventMask) -> Result<()> {
        Err(crate::error::LoopError::LoopClosing)
    }

    fn deregister(&mut self, _fd: RawFd) -> Result<()> { Ok(()) }

    fn poll(&mut self, _timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> { Ok(Vec::new()) }
}
