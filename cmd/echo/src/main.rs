//! Fiber-per-connection TCP echo server.
//!
//! Every accepted connection gets its own fiber; reads and writes look
//! blocking but park only the fiber, so a handful of workers serve many
//! connections.
//!
//! Usage:
//!     cargo run --release -p weft-echo [port] [workers]
//!
//! Test with:
//!     echo hello | nc localhost 9910

use std::io::{Read, Write};
use weft::{FiberListener, FiberStream, Runtime};

fn handle(stream: FiberStream) {
    let mut buf = [0u8; 4096];
    loop {
        let mut reader = &stream;
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                weft::wwarn!(target: "echo", "read: {}", e);
                return;
            }
        };
        let mut writer = &stream;
        if let Err(e) = writer.write_all(&buf[..n]) {
            weft::wwarn!(target: "echo", "write: {}", e);
            return;
        }
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|a| a.parse().ok()).unwrap_or(9910);
    let workers: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);

    let rt = match Runtime::builder().name("echo").workers(workers).build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("echo: runtime init failed: {e}");
            std::process::exit(1);
        }
    };

    rt.block_on(|| {
        rt.spawn(move || {
            let addr = format!("127.0.0.1:{port}").parse().unwrap();
            let listener = match FiberListener::bind(addr) {
                Ok(l) => l,
                Err(e) => {
                    eprintln!("echo: bind {addr}: {e}");
                    return;
                }
            };
            weft::winfo!(target: "echo", "listening on {}", addr);
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        weft::winfo!(target: "echo", "accepted {}", peer);
                        let _ = weft::spawn(move || handle(stream));
                    }
                    Err(e) => {
                        weft::werror!(target: "echo", "accept: {}", e);
                        return;
                    }
                }
            }
        });
        // Serve until killed.
        loop {
            std::thread::sleep(std::time::Duration::from_secs(3600));
        }
    });
}
