//! Error taxonomy for the event loop.
//!
//! Every fallible seam in this crate — backend registration, the self-pipe waker,
//! the loop's own control methods — returns [`LoopError`] so callers match on one
//! type instead of a mix of raw I/O errors and ad hoc strings.

use std::os::unix::io::RawFd;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, LoopError>;

/// Everything that can go wrong while driving the loop.
#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum LoopError {
    /// `add_handler` was called for an fd that is already registered.
    #[error("fd {fd} is already registered")]
    AlreadyRegistered { fd: RawFd },

    /// `update_handler` or `remove_handler` was called for an fd that isn't registered.
    #[error("fd {fd} is not registered")]
    NotRegistered { fd: RawFd },

    /// `start()` was called while the loop was already running.
    #[error("the loop is already running")]
    AlreadyRunning,

    /// `schedule` (or a control method) was called after `close()` began.
    #[error("the loop is closing and no longer accepts new work")]
    LoopClosing,

    /// `run_sync` exceeded its deadline before the driving future completed.
    #[error("operation timed out")]
    OperationTimedOut,

    /// `add_timeout` received a deadline value it doesn't know how to resolve. The
    /// original host language accepted either an absolute timestamp or a relative
    /// delta through one dynamically-typed parameter; `call_at`/`call_later` split
    /// that into two statically-typed methods instead, so this variant has no live
    /// caller here — kept for taxonomy parity with the rest of the error surface.
    #[error("unsupported deadline value: {reason}")]
    UnsupportedDeadline { reason: String },

    /// A caller-supplied argument failed validation (e.g. an empty signal list).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A backend call was interrupted by a signal. Recovered internally by retrying;
    /// surfaced as a variant only so backend implementations have a uniform way to
    /// signal "retry me" up through a `Result`.
    #[error("operation interrupted, retry")]
    Interrupted,

    /// A handler raised a broken-pipe error. Swallowed silently during dispatch (see
    /// `EventLoop::dispatch_one`); kept as a named variant so the classification logic
    /// lives in one place.
    #[error("broken pipe")]
    BrokenPipe,

    /// Catch-all for I/O failures that don't fit one of the named kinds above.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// Classifies a raw I/O error the way the backend contract requires: `Interrupted`
    /// (EINTR) must be retried rather than propagated, and `BrokenPipe` from handler
    /// dispatch must be swallowed rather than routed to `handle_callback_exception`.
    #[must_use]
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::Interrupted => LoopError::Interrupted,
            std::io::ErrorKind::BrokenPipe => LoopError::BrokenPipe,
            _ => LoopError::Io(err),
        }
    }

    /// True for the internal "retry the syscall" condition; never propagated to a
    /// caller's `Result`.
    #[must_use]
    pub fn is_interrupted(&self) -> bool { matches!(self, LoopError::Interrupted) }

    #[must_use]
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, LoopError::BrokenPipe)
            || matches!(self, LoopError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }
}

pub(crate) fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
