//! Scheduler behavior through the public facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weft::{FiberState, Runtime};

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
fn fibers_complete_across_workers() {
    let rt = Runtime::builder()
        .name("it_pool")
        .workers(3)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let done = done.clone();
        rt.spawn(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(|| done.load(Ordering::SeqCst) == 100, 5000));
    rt.shutdown();
}

#[test]
fn affinity_pins_fibers_to_their_worker() {
    let rt = Runtime::builder()
        .name("it_affinity")
        .workers(3)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for target in 0..3usize {
        let seen = seen.clone();
        rt.io().spawn_with(
            move || {
                seen.lock().unwrap().push((target, weft::worker_id()));
            },
            0,
            Some(target),
        );
    }
    assert!(wait_until(|| seen.lock().unwrap().len() == 3, 5000));
    for (target, worker) in seen.lock().unwrap().iter() {
        assert_eq!(*worker, Some(*target));
    }
    rt.shutdown();
}

#[test]
fn yield_interleaves_on_a_single_worker() {
    let rt = Runtime::builder()
        .name("it_yield")
        .workers(1)
        .hook_io(false)
        .build()
        .unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    // Queue both fibers before the worker starts so the interleaving is
    // not racing against the spawning thread.
    for tag in ["a", "b"] {
        let order = order.clone();
        rt.spawn(move || {
            for i in 0..2 {
                order.lock().unwrap().push(format!("{tag}{i}"));
                weft::yield_now();
            }
        });
    }
    rt.start().unwrap();
    assert!(wait_until(|| order.lock().unwrap().len() == 4, 5000));
    assert_eq!(*order.lock().unwrap(), vec!["a0", "b0", "a1", "b1"]);
    rt.shutdown();
}

#[test]
fn shutdown_drains_queued_work() {
    let rt = Runtime::builder()
        .name("it_drain")
        .workers(2)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let done = done.clone();
        rt.spawn(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    rt.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 50);
}

#[test]
fn adopted_fiber_resets_and_releases() {
    let rt = Runtime::builder()
        .name("it_reset")
        .workers(1)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let r = runs.clone();
    let fiber = weft::Fiber::new(
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
        64 * 1024,
    );
    let h = rt.io().adopt(fiber);
    rt.io().schedule(h);
    assert!(wait_until(|| runs.load(Ordering::SeqCst) == 1, 5000));
    assert!(wait_until(
        || rt.io().fiber_state(h) == Some(FiberState::Term),
        5000
    ));

    // Same stack, new callback.
    let r = runs.clone();
    rt.io()
        .reset_fiber(h, move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    rt.io().schedule(h);
    assert!(wait_until(|| runs.load(Ordering::SeqCst) == 2, 5000));
    assert!(wait_until(
        || rt.io().fiber_state(h) == Some(FiberState::Term),
        5000
    ));

    rt.io().release(h).unwrap();
    assert_eq!(rt.io().fiber_state(h), None);
    rt.shutdown();
}

#[test]
fn panicking_fiber_does_not_take_down_the_pool() {
    let rt = Runtime::builder()
        .name("it_panic")
        .workers(1)
        .hook_io(false)
        .build()
        .unwrap();
    rt.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    rt.spawn(|| panic!("boom"));
    for _ in 0..5 {
        let done = done.clone();
        rt.spawn(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(|| done.load(Ordering::SeqCst) == 5, 5000));
    rt.shutdown();
}

#[test]
fn caller_inclusive_runtime_finishes_inline() {
    let rt = Runtime::builder()
        .name("it_caller")
        .workers(1)
        .include_caller(true)
        .hook_io(false)
        .build()
        .unwrap();
    // No pool threads: worker count 1 with the caller included means
    // everything runs during shutdown on this thread.
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = done.clone();
        rt.spawn(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(done.load(Ordering::SeqCst), 0);
    rt.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 10);
}
