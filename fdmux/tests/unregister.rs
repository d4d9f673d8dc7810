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

fn write_byte(fd: RawFd) {
    let buf = [1u8];
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1, "write failed");
}

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
fn test_unregister_stops_delivery() {
    let pool = PoolBuilder::new().worker_threads(2).build().expect("build failed");
    let dispatcher = start(&pool);

    let (r, w) = pipe();
    let (handler, events) = collector();
    let handle = pool
        .register(r, Some(true), None, false, handler)
        .expect("register failed");

    pool.unregister(handle, r).expect("unregister failed");

    write_byte(w);
    assert!(
        events.recv_timeout(Duration::from_millis(300)).is_err(),
        "event delivered after unregister"
    );

    drain(&pool, dispatcher);
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

#[test]
fn test_slot_reuse_bumps_generation() {
    let pool = PoolBuilder::new().worker_threads(1).build().expect("build failed");
    let dispatcher = start(&pool);

    let (r1, w1) = pipe();
    let (r2, w2) = pipe();

    let (first_handler, first_events) = collector();
    let first = pool
        .register(r1, Some(true), None, false, first_handler)
        .expect("register failed");

    write_byte(w1);
    let fired = first_events
        .recv_timeout(Duration::from_secs(5))
        .expect("no event for the first registration");
    assert_eq!(fired.fd, r1);

    pool.unregister(first, r1).expect("unregister failed");
    // Give the worker time to release its dispatch reference so the slot
    // is reclaimed and the next registration reuses it.
    thread::sleep(Duration::from_millis(100));

    let (second_handler, second_events) = collector();
    let second = pool
        .register(r2, Some(true), None, false, second_handler)
        .expect("register failed");
    assert_eq!(second, first, "the freed slot should be reused first");

    write_byte(w2);
    let refired = second_events
        .recv_timeout(Duration::from_secs(5))
        .expect("no event for the second registration");
    assert_eq!(refired.fd, r2);
    assert!(
        refired.gen > fired.gen,
        "generation must increase across slot reuse"
    );

    assert!(
        first_events.recv_timeout(Duration::from_millis(200)).is_err(),
        "the first registration's handler fired for the reused slot"
    );

    pool.unregister(second, r2).expect("unregister failed");
    drain(&pool, dispatcher);
    unsafe {
        libc::close(r1);
        libc::close(w1);
        libc::close(r2);
        libc::close(w2);
    }
}

#[test]
fn test_unregister_close_closes_descriptor() {
    let pool = PoolBuilder::new().worker_threads(1).build().expect("build failed");
    let dispatcher = start(&pool);

    let (r, w) = pipe();
    let handler: Handler = Arc::new(|_| {});
    let handle = pool
        .register(r, Some(true), None, false, handler)
        .expect("register failed");

    // No event ever fired, so the registration holds the only references
    // and the close happens before unregister_close returns.
    pool.unregister_close(handle, r).expect("unregister_close failed");

    let rc = unsafe { libc::fcntl(r, libc::F_GETFD) };
    assert_eq!(rc, -1, "descriptor should be closed");
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EBADF)
    );

    drain(&pool, dispatcher);
    unsafe { libc::close(w) };
}
