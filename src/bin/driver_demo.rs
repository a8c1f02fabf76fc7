//! Minimal end-to-end wiring of a `Driver`: binds one HTTP listener, runs a
//! toy worker pool that replies "hello" to every dispatched request, and
//! prints `DriverRegistry` stats every few seconds until interrupted.
//!
//! Exercises the same wiring a real embedding application would do: build
//! `DriverOptions` (optionally from a YAML fragment given as `argv[1]`),
//! build a `HostMap` with a default binding, implement `WorkerPool`, bind a
//! `Driver`, register it, and start it.

use driver_core::config::DriverOptions;
use driver_core::dispatch::{EnqueueResult, WorkerPool};
use driver_core::driver::{Driver, DriverRegistry};
use driver_core::host_map::HostMap;
use driver_core::sock::Sock;
use driver_core::writer::WriterTask;
use proxy_log::{errors, info};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Replies "hello" to every request it's handed, on a fresh thread per
/// request. Real embedders plug in their own connection-worker pool here;
/// this core only calls `enqueue`/`add_bytes_sent`/`ensure_running`.
struct EchoPool {
    driver: OnceLock<Arc<Driver>>,
    writer_cursor: Mutex<usize>,
    handled: AtomicUsize,
}

impl EchoPool {
    fn new() -> Self {
        Self {
            driver: OnceLock::new(),
            writer_cursor: Mutex::new(0),
            handled: AtomicUsize::new(0),
        }
    }

    fn attach(&self, driver: Arc<Driver>) {
        let _ = self.driver.set(driver);
    }
}

impl WorkerPool for EchoPool {
    fn enqueue(&self, mut sock: Sock, _now: Instant) -> EnqueueResult {
        let Some(driver) = self.driver.get().cloned() else {
            return EnqueueResult::Error(sock);
        };
        self.handled.fetch_add(1, Ordering::Relaxed);
        let fd = sock.fd;
        sock.flags.sent_via_writer = true;
        sock.keep = driver_core::sock::KeepState::No;

        let mut cursor = self.writer_cursor.lock().expect("echo pool lock poisoned");
        let slot = *cursor;
        *cursor = cursor.wrapping_add(1);
        drop(cursor);

        std::thread::spawn(move || {
            let body = b"hello\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let mut bytes = response.into_bytes();
            bytes.extend_from_slice(body);
            let task = WriterTask::submit_bytes(fd, "default", bytes, false);
            let mut slot = slot;
            driver.submit_writer_task(task, &mut slot);
            driver.return_socket(sock);
        });

        EnqueueResult::Ok
    }

    fn add_bytes_sent(&self, _pool: &str, _n: usize) {}

    fn allocate_thread_slot(&self, _pool: &str, _thread_id: usize) -> usize {
        0
    }

    fn total_rate(&self, _pool: &str, _slot_id: usize, _current_rate: f64) -> (f64, usize) {
        (0.0, 1)
    }

    fn ensure_running(&self, _server: &str, _reason: &str) {}

    fn default_pool(&self, _server: &str) -> String {
        "default".to_string()
    }
}

fn main() {
    let opts = match std::env::args().nth(1) {
        Some(path) => {
            let yaml = std::fs::read_to_string(&path).expect("read config file");
            DriverOptions::from_yaml_str(&yaml).expect("parse driver config")
        }
        None => DriverOptions {
            ports: driver_core::config::PortList(vec![8080]),
            ..DriverOptions::default()
        },
    };

    let mut hosts = HostMap::new();
    hosts.insert("http", "localhost", "demo", None, true);

    let pool = Arc::new(EchoPool::new());
    let driver = Driver::bind("demo", "http", IpAddr::from([0, 0, 0, 0]), opts, hosts, pool.clone())
        .unwrap_or_else(|e| {
            errors!("failed to bind driver: {e}");
            std::process::exit(1);
        });
    pool.attach(Arc::clone(&driver));

    let registry = Arc::new(DriverRegistry::new());
    registry.register(Arc::clone(&driver));
    driver.start();

    info!("demo driver listening on {:?}", driver.ports());
    loop {
        std::thread::sleep(std::time::Duration::from_secs(5));
        for (name, stats) in registry.stats() {
            info!(
                "{name}: received={} spooled={} partial={} errors={} handled={}",
                stats.received,
                stats.spooled,
                stats.partial,
                stats.errors,
                pool.handled.load(Ordering::Relaxed),
            );
        }
    }
}
