//! `SpoolerLoop`, `SpoolerQueue` (§4.7): off-thread read-ahead for large
//! uploads handed off by `DriverLoop`'s read-list pass.
//!
//! No direct teacher counterpart — `kill-ux-01-server` always finishes
//! reading a request body on the connection's own poll thread
//! (`HttpConnection::handle_read_phase`). This mirrors that same
//! read-then-parse shape but in its own queue/thread, and only for sockets
//! the driver has already decided are spooling (§4.6 step 5's `SPOOL` arm),
//! reusing `HttpParser::step` and `Dispatch::queue` unchanged.

use crate::dispatch::{self, DispatchOutcome, WorkerPool};
use crate::host_map::HostMap;
use crate::http_parser::{self, Outcome};
use crate::prelude::*;
use crate::sock::Sock;
use std::os::unix::io::RawFd;
use std::sync::Condvar;

/// The recv half of the driver's plain/TLS callback pair (§6), scoped to
/// what read-ahead needs.
pub trait RecvTransport: Send + Sync {
    fn recv(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
}

pub struct PlainRecv;

impl RecvTransport for PlainRecv {
    fn recv(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        if fd < 0 {
            return Err(io::Error::from(ErrorKind::NotConnected));
        }
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

pub struct SpoolerQueue {
    pub id: usize,
    intake: Mutex<Vec<Sock>>,
    cond: Condvar,
    queuesize: std::sync::atomic::AtomicUsize,
    shutdown: std::sync::atomic::AtomicBool,
}

impl SpoolerQueue {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            intake: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            queuesize: std::sync::atomic::AtomicUsize::new(0),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn submit(&self, sock: Sock) {
        self.intake.lock().expect("spooler queue poisoned").push(sock);
        self.queuesize.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.cond.notify_one();
    }

    pub fn queuesize(&self) -> usize {
        self.queuesize.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        self.cond.notify_one();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn absorb(&self, active: &mut Vec<Sock>) {
        let mut intake = self.intake.lock().expect("spooler queue poisoned");
        if !intake.is_empty() {
            active.append(&mut intake);
        }
    }
}

pub enum SpoolerReleaseReason {
    Close,
    ReadTimeout,
    ReadError,
    BadHeader(Reason),
}

/// One pass over the active list (§4.7: "iterates much like §4.6 steps
/// 4-5"). Readable sockets are drained and reparsed; `READY` resolves the
/// host and dispatches; otherwise the socket is re-enqueued with a
/// refreshed deadline.
pub fn run_iteration(
    active: &mut Vec<Sock>,
    queue: &SpoolerQueue,
    opts: &DriverOptions,
    recv: &dyn RecvTransport,
    hosts: &HostMap,
    default_port: u16,
    listen_ports: &[u16],
    pool: &dyn WorkerPool,
    readable: impl Fn(RawFd) -> bool,
    now: Instant,
) -> Vec<(Sock, SpoolerReleaseReason)> {
    queue.absorb(active);

    let mut still_active = Vec::new();
    let mut released = Vec::new();
    let mut dispatched = Vec::new();

    for mut sock in active.drain(..) {
        if !readable(sock.fd) {
            if sock.deadline.is_some_and(|d| d <= now) {
                released.push((sock, SpoolerReleaseReason::ReadTimeout));
            } else {
                still_active.push(sock);
            }
            continue;
        }

        let mut buf = sock
            .request_buffer
            .take()
            .unwrap_or_else(crate::request_buffer::RequestBuffer::new);
        let mut read_buf = vec![0u8; opts.bufsize];
        match recv.recv(sock.fd, &mut read_buf) {
            Ok(0) => {
                sock.request_buffer = Some(buf);
                released.push((sock, SpoolerReleaseReason::Close));
                continue;
            }
            Ok(n) => buf.fill(&read_buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                sock.request_buffer = Some(buf);
                still_active.push(sock);
                continue;
            }
            Err(_) => {
                sock.request_buffer = Some(buf);
                released.push((sock, SpoolerReleaseReason::ReadError));
                continue;
            }
        }

        let outcome = http_parser::step(&mut sock, &mut buf, opts);
        sock.request_buffer = Some(buf);

        match outcome {
            Outcome::Ready => dispatched.push(sock),
            Outcome::Spool | Outcome::More => {
                sock.deadline = Some(now + opts.recvwait());
                still_active.push(sock);
            }
            Outcome::Close => released.push((sock, SpoolerReleaseReason::Close)),
            Outcome::Err(reason) => released.push((sock, SpoolerReleaseReason::BadHeader(reason))),
        }
    }

    for sock in dispatched {
        match dispatch::queue(sock, hosts, default_port, listen_ports, pool, now) {
            DispatchOutcome::Queued => {}
            DispatchOutcome::Parked(sock) => still_active.push(sock),
            DispatchOutcome::Released { sock, reason } => {
                released.push((sock, SpoolerReleaseReason::BadHeader(reason)))
            }
        }
    }

    *active = still_active;
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EnqueueResult;
    use crate::host_map::HostMap;
    use crate::sock::test_support::bare_sock;

    struct FeedRecv {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl RecvTransport for FeedRecv {
        fn recv(&self, _fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
            let mut chunks = self.chunks.lock().unwrap();
            if chunks.is_empty() {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let chunk = chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    struct AcceptAllPool;
    impl WorkerPool for AcceptAllPool {
        fn enqueue(&self, _sock: Sock, _now: Instant) -> EnqueueResult {
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
            "default".into()
        }
    }

    #[test]
    fn readable_socket_with_full_request_dispatches() {
        let queue = SpoolerQueue::new(0);
        let opts = DriverOptions::default();
        let recv = FeedRecv {
            chunks: Mutex::new(vec![b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()]),
        };
        let mut hosts = HostMap::new();
        hosts.insert("http", "h", "srv", None, true);
        let pool = AcceptAllPool;
        let mut active = vec![bare_sock()];

        let released = run_iteration(
            &mut active,
            &queue,
            &opts,
            &recv,
            &hosts,
            80,
            &[80],
            &pool,
            |_fd| true,
            Instant::now(),
        );
        assert!(active.is_empty());
        assert!(released.is_empty());
    }

    #[test]
    fn unreadable_socket_without_deadline_stays_active() {
        let queue = SpoolerQueue::new(0);
        let opts = DriverOptions::default();
        let recv = FeedRecv { chunks: Mutex::new(vec![]) };
        let hosts = HostMap::new();
        let pool = AcceptAllPool;
        let mut active = vec![bare_sock()];

        let released = run_iteration(
            &mut active,
            &queue,
            &opts,
            &recv,
            &hosts,
            80,
            &[80],
            &pool,
            |_fd| false,
            Instant::now(),
        );
        assert_eq!(active.len(), 1);
        assert!(released.is_empty());
    }

    #[test]
    fn eof_on_read_releases_as_close() {
        let queue = SpoolerQueue::new(0);
        let opts = DriverOptions::default();
        let recv = FeedRecv {
            chunks: Mutex::new(vec![Vec::new()]),
        };
        let hosts = HostMap::new();
        let pool = AcceptAllPool;
        let mut active = vec![bare_sock()];

        let released = run_iteration(
            &mut active,
            &queue,
            &opts,
            &recv,
            &hosts,
            80,
            &[80],
            &pool,
            |_fd| true,
            Instant::now(),
        );
        assert!(active.is_empty());
        assert_eq!(released.len(), 1);
        assert!(matches!(released[0].1, SpoolerReleaseReason::Close));
    }
}
