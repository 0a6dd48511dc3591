//! End-to-end smoke test: spawns a batch of fibers that yield, sleep and
//! trade data over a loopback socket, plus one recurring timer, then shuts
//! the pool down and checks every counter.
//!
//! Usage:
//!     cargo run --release -p weft-smoke

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::{FiberListener, FiberStream, Runtime};

const FIBERS: usize = 200;

fn main() {
    let rt = Runtime::builder()
        .name("smoke")
        .workers(4)
        .build()
        .expect("runtime init");
    rt.start().expect("start");

    let yielded = Arc::new(AtomicUsize::new(0));
    let slept = Arc::new(AtomicUsize::new(0));
    let echoed = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));

    for i in 0..FIBERS {
        let yielded = yielded.clone();
        rt.spawn(move || {
            for _ in 0..(i % 7) {
                weft::yield_now();
            }
            yielded.fetch_add(1, Ordering::SeqCst);
        });
    }

    for _ in 0..20 {
        let slept = slept.clone();
        rt.spawn(move || {
            weft::sleep_ms(30);
            slept.fetch_add(1, Ordering::SeqCst);
        });
    }

    let t = ticks.clone();
    let timer = rt.io().add_timer_ms(
        10,
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    let e = echoed.clone();
    rt.spawn(move || {
        let listener = FiberListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let e2 = e.clone();
        let _ = weft::spawn(move || {
            let mut stream = FiberStream::connect(addr).expect("connect");
            stream.write_all(b"smoke").expect("write");
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).expect("read");
            assert_eq!(&buf, b"smoke");
            e2.fetch_add(1, Ordering::SeqCst);
        });
        let (stream, _) = listener.accept().expect("accept");
        let mut buf = [0u8; 5];
        (&stream).read_exact(&mut buf).expect("server read");
        (&stream).write_all(&buf).expect("server write");
        e.fetch_add(1, Ordering::SeqCst);
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if yielded.load(Ordering::SeqCst) == FIBERS
            && slept.load(Ordering::SeqCst) == 20
            && echoed.load(Ordering::SeqCst) == 2
            && ticks.load(Ordering::SeqCst) >= 3
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    rt.io().cancel_timer(timer);
    rt.shutdown();

    let y = yielded.load(Ordering::SeqCst);
    let s = slept.load(Ordering::SeqCst);
    let ec = echoed.load(Ordering::SeqCst);
    let tk = ticks.load(Ordering::SeqCst);
    println!("yielded {y}/{FIBERS}  slept {s}/20  echo {ec}/2  ticks {tk}");
    if y != FIBERS || s != 20 || ec != 2 || tk < 3 {
        eprintln!("smoke: FAILED");
        std::process::exit(1);
    }
    println!("smoke: OK");
}
