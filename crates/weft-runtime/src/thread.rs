//! Named worker threads.
//!
//! Thin wrapper over `std::thread` that names the thread and blocks the
//! spawner until the thread has actually started running, so `start()`
//! returns with the pool live.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use weft_core::{WeftError, WeftResult};

pub struct NamedThread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl NamedThread {
    pub fn spawn<F>(name: &str, f: F) -> WeftResult<NamedThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let started = Arc::new((Mutex::new(false), Condvar::new()));
        let started2 = started.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                {
                    let (lock, cvar) = &*started2;
                    *lock.lock().unwrap() = true;
                    cvar.notify_one();
                }
                f();
            })
            .map_err(|e| WeftError::ThreadSpawn(e.to_string()))?;

        let (lock, cvar) = &*started;
        let mut running = lock.lock().unwrap();
        while !*running {
            running = cvar.wait(running).unwrap();
        }

        Ok(NamedThread {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
