//! Reactor, timers and hooked I/O through the public facade.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weft::{FiberListener, FiberStream, Runtime};

fn wait_until(mut pred: impl FnMut() -> bool, ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}

#[test]
fn timer_fires_on_a_worker() {
    let rt = Runtime::builder()
        .name("it_timer")
        .workers(1)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    rt.io().add_timer_ms(
        30,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1, 3000));
    rt.shutdown();
}

#[test]
fn recurring_timer_cancelled_stops() {
    let rt = Runtime::builder()
        .name("it_recur")
        .workers(1)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let id = rt.io().add_timer_ms(
        20,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );
    assert!(wait_until(|| hits.load(Ordering::SeqCst) >= 3, 3000));
    assert!(rt.io().cancel_timer(id));
    let frozen = hits.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(120));
    assert!(hits.load(Ordering::SeqCst) <= frozen + 1);
    rt.shutdown();
}

#[test]
fn sleeping_fiber_frees_its_worker() {
    let rt = Runtime::builder()
        .name("it_sleep")
        .workers(1)
        .build()
        .unwrap();
    rt.start().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let o1 = order.clone();
    rt.spawn(move || {
        o1.lock().unwrap().push("sleeper_start");
        weft::sleep_ms(80);
        o1.lock().unwrap().push("sleeper_end");
    });
    let o2 = order.clone();
    rt.spawn(move || {
        o2.lock().unwrap().push("runner");
    });
    assert!(wait_until(|| order.lock().unwrap().len() == 3, 5000));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["sleeper_start", "runner", "sleeper_end"]
    );
    rt.shutdown();
}

#[test]
fn tcp_echo_between_fibers() {
    let rt = Runtime::builder()
        .name("it_echo")
        .workers(2)
        .build()
        .unwrap();
    rt.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    rt.spawn(move || {
        let listener = FiberListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let d2 = d.clone();
        weft::spawn(move || {
            let mut stream = FiberStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            d2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let (stream, peer) = listener.accept().unwrap();
        assert_eq!(peer.ip().to_string(), "127.0.0.1");
        let mut reader = &stream;
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        let mut writer = &stream;
        writer.write_all(&buf).unwrap();
        d.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(|| done.load(Ordering::SeqCst) == 2, 5000));
    rt.shutdown();
}

#[test]
fn read_timeout_surfaces_as_timed_out() {
    let rt = Runtime::builder()
        .name("it_rto")
        .workers(2)
        .build()
        .unwrap();
    rt.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    rt.spawn(move || {
        let listener = FiberListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let d2 = d.clone();
        weft::spawn(move || {
            let mut stream = FiberStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_millis(60)));
            let mut buf = [0u8; 4];
            let err = stream.read(&mut buf).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
            d2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Accept but never write; the peer's read must time out.
        let (_stream, _) = listener.accept().unwrap();
        assert!(wait_until(|| d.load(Ordering::SeqCst) == 1, 3000));
        d.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(|| done.load(Ordering::SeqCst) == 2, 5000));
    rt.shutdown();
}

#[test]
fn shutdown_waits_for_armed_timer() {
    let rt = Runtime::builder()
        .name("it_stop_timer")
        .workers(1)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    rt.io().add_timer_ms(
        70,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    rt.shutdown();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
