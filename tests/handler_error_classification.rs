//! §4.6/§7: a handler returning `LoopError::BrokenPipe` is swallowed silently; any
//! other `Err` is routed to `handle_callback_exception` exactly like a caught panic.

use std::cell::{Cell, RefCell};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use nix::unistd::{pipe, write};
use reactor_loop::{EventLoop, EventMask, LoopError};

#[test]
fn broken_pipe_from_a_handler_is_swallowed_without_invoking_the_exception_handler() {
    let event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe().unwrap();
    let fd = read_fd.as_raw_fd();

    let exceptions_seen = Rc::new(RefCell::new(Vec::<String>::new()));
    let exceptions_clone = Rc::clone(&exceptions_seen);
    event_loop.set_exception_handler(move |message| exceptions_clone.borrow_mut().push(message.to_string()));

    let invocations = Rc::new(Cell::new(0u32));
    let invocations_clone = Rc::clone(&invocations);
    let event_loop_for_cb = event_loop.clone();
    event_loop
        .add_handler(
            fd,
            EventMask::READ,
            Box::new(move |_mask| {
                invocations_clone.set(invocations_clone.get() + 1);
                event_loop_for_cb.stop();
                Err(LoopError::BrokenPipe)
            }),
        )
        .unwrap();

    write(&write_fd, b"x").unwrap();
    event_loop.start().unwrap();

    assert_eq!(invocations.get(), 1);
    assert!(exceptions_seen.borrow().is_empty(), "a broken-pipe error must never reach handle_callback_exception");
}

#[test]
fn a_non_broken_pipe_error_from_a_handler_reaches_the_exception_handler() {
    let event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe().unwrap();
    let fd = read_fd.as_raw_fd();

    let exceptions_seen = Rc::new(RefCell::new(Vec::<String>::new()));
    let exceptions_clone = Rc::clone(&exceptions_seen);
    event_loop.set_exception_handler(move |message| exceptions_clone.borrow_mut().push(message.to_string()));

    let event_loop_for_cb = event_loop.clone();
    event_loop
        .add_handler(
            fd,
            EventMask::READ,
            Box::new(move |_mask| {
                event_loop_for_cb.stop();
                Err(LoopError::InvalidArgument { reason: "bad frame".to_string() })
            }),
        )
        .unwrap();

    write(&write_fd, b"x").unwrap();
    event_loop.start().unwrap();

    let seen = exceptions_seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("bad frame"));
}

#[test]
fn close_all_fds_deregisters_and_closes_registered_fds() {
    let event_loop = EventLoop::new().unwrap();
    let (read_fd, _write_fd) = pipe().unwrap();
    let fd = read_fd.as_raw_fd();
    std::mem::forget(read_fd); // ownership is handed to the handler table's raw fd below

    event_loop.add_handler(fd, EventMask::READ, Box::new(|_| Ok(()))).unwrap();
    event_loop.close(true).unwrap();

    // A fresh `write` on the now-closed fd must fail with EBADF.
    let err = nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, b"x").unwrap_err();
    assert_eq!(err, nix::errno::Errno::EBADF);
}

#[test]
fn close_retires_the_loop_without_running_it_again() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.close(false).unwrap();
    // Scheduling after close must be rejected rather than silently queued forever.
    let err = event_loop.schedule(|| {}).unwrap_err();
    assert!(matches!(err, LoopError::LoopClosing));
}
