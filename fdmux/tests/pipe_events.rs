use fdmux::{Event, Handler, Pool, PoolBuilder};

use std::os::unix::io::RawFd;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2 failed");
    (fds[0], fds[1])
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let buf = [1u8];
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1, "write failed");
}

/// Handler that forwards every event into a channel.
fn collector() -> (Handler, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let handler: Handler = Arc::new(move |event| {
        let _ = tx.lock().unwrap().send(event);
    });
    (handler, rx)
}

fn start(pool: &Arc<Pool>) -> thread::JoinHandle<()> {
    let pool = pool.clone();
    thread::spawn(move || {
        pool.dispatch().expect("dispatch failed");
    })
}

fn drain(pool: &Arc<Pool>, dispatcher: thread::JoinHandle<()>) {
    pool.shutdown();
    pool.reconfigure_threads(0).expect("reconfigure failed");
    dispatcher.join().expect("dispatcher thread panicked");
}

#[test]
fn test_single_fire_per_arming() {
    let pool = PoolBuilder::new().worker_threads(2).build().expect("build failed");
    let dispatcher = start(&pool);

    let (r, w) = pipe();
    let (handler, events) = collector();
    let handle = pool
        .register(r, Some(true), None, false, handler)
        .expect("register failed");

    write_byte(w);
    let first = events
        .recv_timeout(Duration::from_secs(5))
        .expect("no event for the first byte");
    assert!(first.readable);
    assert!(!first.writable);
    assert!(!first.error);
    assert!(!first.poller_died);
    assert_eq!(first.fd, r);
    assert_eq!(first.handle, handle);

    // One-shot arming: a second byte must not fire again before handled.
    write_byte(w);
    assert!(
        events.recv_timeout(Duration::from_millis(300)).is_err(),
        "event delivered before handled re-armed the descriptor"
    );

    pool.handled(handle, r, first.gen).expect("handled failed");
    let second = events
        .recv_timeout(Duration::from_secs(5))
        .expect("no event after re-arming");
    assert!(second.readable);

    pool.unregister(handle, r).expect("unregister failed");
    drain(&pool, dispatcher);
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

#[test]
fn test_interest_update_during_handler_applies_at_rearm() {
    let pool = PoolBuilder::new().worker_threads(2).build().expect("build failed");
    let dispatcher = start(&pool);

    let (a, b) = socketpair();
    let (handler, events) = collector();
    let handle = pool
        .register(a, Some(true), None, false, handler)
        .expect("register failed");

    write_byte(b);
    let first = events
        .recv_timeout(Duration::from_secs(5))
        .expect("no event for the first byte");
    assert!(first.readable);
    assert!(!first.writable, "write interest was never enabled");

    // The dispatch is still unacknowledged, so this must not touch the
    // kernel; the update rides along with the handled re-arm below.
    pool.select_on(handle, a, None, Some(true))
        .expect("select_on failed");

    pool.handled(handle, a, first.gen).expect("handled failed");
    let second = events
        .recv_timeout(Duration::from_secs(5))
        .expect("no event after re-arming");
    assert!(second.writable, "write interest must apply at the next arming");
    assert!(second.readable, "the unread byte is still pending");

    pool.unregister(handle, a).expect("unregister failed");
    drain(&pool, dispatcher);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn test_error_storm_is_delivered_once() {
    let pool = PoolBuilder::new().worker_threads(2).build().expect("build failed");
    let dispatcher = start(&pool);

    let (r, w) = pipe();
    let (handler, events) = collector();
    let handle = pool
        .register(r, Some(true), None, false, handler)
        .expect("register failed");

    // Closing the write end raises a hangup on the read end.
    unsafe { libc::close(w) };
    let first = events
        .recv_timeout(Duration::from_secs(5))
        .expect("no event for the hangup");
    assert!(first.error);

    // Re-arming surfaces the persistent hangup again, but the handler must
    // not run a second time for the same registration.
    pool.handled(handle, r, first.gen).expect("handled failed");
    assert!(
        events.recv_timeout(Duration::from_millis(400)).is_err(),
        "hangup storm reached the handler twice"
    );

    pool.unregister(handle, r).expect("unregister failed");
    drain(&pool, dispatcher);
    unsafe { libc::close(r) };
}

#[test]
fn test_unchanged_interest_is_a_noop() {
    let pool = PoolBuilder::new().worker_threads(1).build().expect("build failed");
    let dispatcher = start(&pool);

    let (r, w) = pipe();
    let (handler, events) = collector();
    let handle = pool
        .register(r, Some(true), None, false, handler)
        .expect("register failed");

    // (None, None) must leave the interest mask exactly as it was.
    pool.select_on(handle, r, None, None).expect("select_on failed");

    write_byte(w);
    let event = events
        .recv_timeout(Duration::from_secs(5))
        .expect("read interest was lost by the no-op update");
    assert!(event.readable);

    pool.unregister(handle, r).expect("unregister failed");
    drain(&pool, dispatcher);
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}
