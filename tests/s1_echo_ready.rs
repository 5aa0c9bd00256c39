//! S1: a registered pipe read-end fires with a mask that includes READ and the
//! expected payload is readable from the handler.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use nix::unistd::{pipe, read, write};
use reactor_loop::{EventLoop, EventMask};

#[test]
fn echo_ready_delivers_the_written_bytes() {
    let event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe().unwrap();
    let read_fd_raw = read_fd.as_raw_fd();
    let received = Rc::new(RefCell::new(Vec::new()));
    let received_clone = Rc::clone(&received);
    let event_loop_for_cb = event_loop.clone();

    event_loop
        .add_handler(
            read_fd_raw,
            EventMask::READ,
            Box::new(move |mask| {
                assert!(mask.contains(EventMask::READ));
                let mut buf = [0u8; 16];
                let n = read(read_fd_raw, &mut buf).unwrap_or(0);
                received_clone.borrow_mut().extend_from_slice(&buf[..n]);
                event_loop_for_cb.stop();
                Ok(())
            }),
        )
        .unwrap();

    write(&write_fd, b"hi").unwrap();
    event_loop.start().unwrap();

    assert_eq!(&*received.borrow(), b"hi");
    // Keep `read_fd` alive for the duration of the test; it's registered by raw fd.
    drop(read_fd);
}
