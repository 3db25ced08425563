use reactor_server::poller::{self, Poller, Waker, CONNECTION_READ, CONNECTION_WRITE, LISTEN};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_one_shot_needs_rearm() {
    let mut poller = Poller::new(16).unwrap();
    let (mut tx, mut rx) = UnixStream::pair().unwrap();
    rx.set_nonblocking(true).unwrap();
    poller.add(rx.as_raw_fd(), 42, CONNECTION_READ).unwrap();

    tx.write_all(b"ping").unwrap();
    let events = poller.wait(1000).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, 42);
    assert!(poller::is_readable(events[0].1));
    assert!(!poller::is_closed(events[0].1));

    // more data, but the registration is disarmed
    tx.write_all(b"pong").unwrap();
    assert!(poller.wait(50).unwrap().is_empty());

    poller.modify(rx.as_raw_fd(), 43, CONNECTION_READ).unwrap();
    let events = poller.wait(1000).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, 43);

    let mut buf = [0u8; 8];
    assert_eq!(rx.read(&mut buf).unwrap(), 8);
    assert_eq!(&buf, b"pingpong");
}

#[test]
fn test_write_interest_and_peer_hangup() {
    let mut poller = Poller::new(16).unwrap();
    let (tx, rx) = UnixStream::pair().unwrap();
    poller.add(rx.as_raw_fd(), 1, CONNECTION_WRITE).unwrap();

    let events = poller.wait(1000).unwrap();
    assert_eq!(events.len(), 1);
    assert!(poller::is_writable(events[0].1));

    drop(tx);
    poller.modify(rx.as_raw_fd(), 1, CONNECTION_READ).unwrap();
    let events = poller.wait(1000).unwrap();
    assert_eq!(events.len(), 1);
    assert!(poller::is_closed(events[0].1));
}

#[test]
fn test_removed_descriptor_reports_nothing() {
    let mut poller = Poller::new(4).unwrap();
    let (mut tx, rx) = UnixStream::pair().unwrap();
    poller.add(rx.as_raw_fd(), 9, LISTEN).unwrap();
    poller.remove(rx.as_raw_fd()).unwrap();

    tx.write_all(b"x").unwrap();
    assert!(poller.wait(50).unwrap().is_empty());
    assert!(poller.remove(rx.as_raw_fd()).is_err());
}

#[test]
fn test_waker_interrupts_blocking_wait() {
    let mut poller = Poller::new(4).unwrap();
    let waker = Arc::new(Waker::new().unwrap());
    poller.add(waker.fd(), 7, LISTEN).unwrap();

    let remote = Arc::clone(&waker);
    let wakeup = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.wake();
    });

    let start = Instant::now();
    let events = poller.wait(-1).unwrap();
    assert_eq!(events, vec![(7, LISTEN)]);
    assert!(start.elapsed() < Duration::from_secs(5));
    wakeup.join().unwrap();

    // level-triggered until drained
    assert_eq!(poller.wait(0).unwrap().len(), 1);
    waker.drain();
    assert!(poller.wait(0).unwrap().is_empty());
}
