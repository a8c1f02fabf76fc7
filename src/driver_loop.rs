//! `DriverLoop` (§4.6): the accept/read/keep-alive/close main loop, and
//! `DriverStats` (§3 "statistics counters").
//!
//! No teacher counterpart runs this shape on its own thread — the server
//! demo in `main.rs`/`server.rs` never got past a `Token` counter and a
//! commented-out async executor. The per-socket classification this loop
//! performs (HUP/readable/deadline -> release/more/spool/ready) is lifted
//! from `HttpConnection::poll`'s per-connection match, generalized from "one
//! connection per poll callback" into the nine-step batch pass §4.6
//! describes.

use crate::dispatch::{self, DispatchOutcome, WorkerPool};
use crate::host_map::HostMap;
use crate::http_parser::{self, Outcome};
use crate::pollset::Readiness;
use crate::prelude::*;
use crate::sock::{Sock, SockSlab};
use crate::spooler::{RecvTransport, SpoolerQueue};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

/// §3 Driver statistics counters: `received`, `spooled`, `partial`, `errors`.
#[derive(Default)]
pub struct DriverStats {
    pub received: AtomicU64,
    pub spooled: AtomicU64,
    pub partial: AtomicU64,
    pub errors: AtomicU64,
}

pub struct StatsSnapshot {
    pub received: u64,
    pub spooled: u64,
    pub partial: u64,
    pub errors: u64,
}

impl DriverStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            spooled: self.spooled.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// One classified step of reading/parsing a single socket, shared between
/// the read-list pass and the accept pass (§4.6 step 7: "Apply the parser
/// to the fresh socket exactly as the read-list does").
enum StepResult {
    StillActive(Sock),
    NeedsSpool(Sock),
    Dispatchable(Sock),
    Released(Sock, Reason),
}

fn process_socket(
    mut sock: Sock,
    had_data: bool,
    recv: &dyn RecvTransport,
    opts: &DriverOptions,
    now: Instant,
) -> StepResult {
    if had_data {
        let mut read_buf = vec![0u8; opts.bufsize];
        match recv.recv(sock.fd, &mut read_buf) {
            Ok(0) => return StepResult::Released(sock, Reason::ReadError("peer closed".into())),
            Ok(n) => {
                let mut buf = sock.request_buffer.take().unwrap_or_else(crate::request_buffer::RequestBuffer::new);
                buf.fill(&read_buf[..n]);
                sock.request_buffer = Some(buf);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return StepResult::Released(sock, Reason::from(e)),
        }
    }

    let Some(mut buf) = sock.request_buffer.take() else {
        sock.deadline = Some(now + opts.recvwait());
        return StepResult::StillActive(sock);
    };

    let outcome = http_parser::step(&mut sock, &mut buf, opts);
    sock.request_buffer = Some(buf);

    match outcome {
        Outcome::Ready => StepResult::Dispatchable(sock),
        Outcome::Spool => StepResult::NeedsSpool(sock),
        Outcome::More => {
            sock.deadline = Some(now + opts.recvwait());
            StepResult::StillActive(sock)
        }
        Outcome::Close => StepResult::Released(sock, Reason::Close),
        Outcome::Err(reason) => StepResult::Released(sock, reason),
    }
}

/// §4.6 step 4: close-list pass. Sockets here are draining toward
/// `shutdown(WR)` after a response; we read and discard at most 1 KiB per
/// iteration until EOF or HUP.
pub fn close_list_pass(
    close_list: &mut Vec<Sock>,
    readiness: impl Fn(RawFd) -> Readiness,
    recv: &dyn RecvTransport,
    now: Instant,
) -> Vec<(Sock, Reason)> {
    const DRAIN_CHUNK: usize = 1024;
    let mut still = Vec::new();
    let mut released = Vec::new();

    for sock in close_list.drain(..) {
        let r = readiness(sock.fd);
        if r.hup {
            released.push((sock, Reason::Close));
            continue;
        }
        if r.readable {
            let mut scratch = [0u8; DRAIN_CHUNK];
            match recv.recv(sock.fd, &mut scratch) {
                Ok(0) => released.push((sock, Reason::ReadError("eof while draining".into()))),
                Ok(_) => still.push(sock),
                Err(e) if e.kind() == ErrorKind::WouldBlock => still.push(sock),
                Err(e) => released.push((sock, Reason::from(e))),
            }
            continue;
        }
        if sock.deadline.is_some_and(|d| d <= now) {
            released.push((sock, Reason::CloseTimeout));
        } else {
            still.push(sock);
        }
    }

    *close_list = still;
    released
}

/// §4.6 step 5: read-list pass. Classifies each socket into still-active,
/// ready-to-dispatch, needs-spooling, or released.
#[allow(clippy::too_many_arguments)]
pub fn read_list_pass(
    read_list: &mut Vec<Sock>,
    wait_list: &mut Vec<Sock>,
    readiness: impl Fn(RawFd) -> Readiness,
    recv: &dyn RecvTransport,
    opts: &DriverOptions,
    hosts: &HostMap,
    default_port: u16,
    listen_ports: &[u16],
    pool: &dyn WorkerPool,
    spooler_ring: &[Arc<SpoolerQueue>],
    spooler_cursor: &mut usize,
    stats: &DriverStats,
    now: Instant,
) -> Vec<(Sock, Reason)> {
    let mut still = Vec::new();
    let mut released = Vec::new();

    for sock in read_list.drain(..) {
        let r = readiness(sock.fd);
        if r.hup {
            released.push((sock, Reason::Close));
            continue;
        }
        let had_data = r.readable;
        if !had_data && sock.deadline.is_some_and(|d| d <= now) {
            released.push((sock, Reason::ReadTimeout));
            continue;
        }
        if !had_data {
            still.push(sock);
            continue;
        }

        match process_socket(sock, true, recv, opts, now) {
            StepResult::StillActive(s) => {
                stats.partial.fetch_add(1, Ordering::Relaxed);
                still.push(s);
            }
            StepResult::NeedsSpool(s) => {
                stats.spooled.fetch_add(1, Ordering::Relaxed);
                if spooler_ring.is_empty() {
                    still.push(s);
                } else {
                    let idx = *spooler_cursor % spooler_ring.len();
                    *spooler_cursor = spooler_cursor.wrapping_add(1);
                    spooler_ring[idx].submit(s);
                }
            }
            StepResult::Dispatchable(s) => {
                stats.received.fetch_add(1, Ordering::Relaxed);
                match dispatch::queue(s, hosts, default_port, listen_ports, pool, now) {
                    DispatchOutcome::Queued => {}
                    // Parked sockets go back through the wait-list, not the
                    // read-list; `requeue_pass` retries them (§4.6 step 6).
                    DispatchOutcome::Parked(s) => wait_list.push(s),
                    DispatchOutcome::Released { sock, reason } => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        released.push((sock, reason));
                    }
                }
            }
            StepResult::Released(s, reason) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                released.push((s, reason));
            }
        }
    }

    *read_list = still;
    released
}

/// §4.6 step 6: requeue pass. The wait-list is drained in reverse to
/// preserve FIFO order across iterations (each park pushes to the back;
/// draining from the back first would flip order without the reversal).
pub fn requeue_pass(
    wait_list: &mut Vec<Sock>,
    hosts: &HostMap,
    default_port: u16,
    listen_ports: &[u16],
    pool: &dyn WorkerPool,
    now: Instant,
) -> Vec<(Sock, Reason)> {
    let mut released = Vec::new();
    let drained: Vec<Sock> = wait_list.drain(..).rev().collect();
    let mut still = Vec::new();

    for sock in drained {
        match dispatch::queue(sock, hosts, default_port, listen_ports, pool, now) {
            DispatchOutcome::Queued => {}
            DispatchOutcome::Parked(s) => still.push(s),
            DispatchOutcome::Released { sock, reason } => released.push((sock, reason)),
        }
    }

    still.reverse();
    *wait_list = still;
    released
}

/// §4.6 step 7: accept pass. `accept_fn` returns a freshly accepted
/// `(fd, addr)` pair or `None` on `EAGAIN`; `loop_until_eagain` matches the
/// Linux behavior of draining a listen backlog in one pass (macOS takes at
/// most one per fd per iteration, so callers there pass `false`).
#[allow(clippy::too_many_arguments)]
pub fn accept_pass(
    listen_fds: &[RawFd],
    accept_fn: impl Fn(RawFd) -> Option<(RawFd, Option<SocketAddr>)>,
    slab: &SockSlab,
    opts: &DriverOptions,
    queuesize: usize,
    loop_until_eagain: bool,
    now: Instant,
) -> Vec<Sock> {
    let mut accepted = Vec::new();
    if queuesize >= opts.maxqueuesize {
        return accepted;
    }

    let mut budget = opts.acceptsize;
    for &fd in listen_fds {
        loop {
            if budget == 0 || queuesize + accepted.len() >= opts.maxqueuesize {
                return accepted;
            }
            match accept_fn(fd) {
                Some((client_fd, addr)) => {
                    let mut sock = slab.take(client_fd);
                    sock.remote_addr = addr;
                    sock.accept_time = now;
                    sock.deadline = Some(now + opts.recvwait());
                    accepted.push(sock);
                    budget -= 1;
                    if !loop_until_eagain {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    accepted
}

/// §4.6 step 8: close-intake pass. Decides each newly finished socket's
/// next home based on its `keep` tri-state.
pub fn close_intake_pass(
    intake: Vec<Sock>,
    opts: &DriverOptions,
    now: Instant,
) -> (Vec<Sock>, Vec<Sock>) {
    let mut to_read_list = Vec::new();
    let mut to_close_list = Vec::new();

    for mut sock in intake {
        if sock.keep == crate::sock::KeepState::Yes {
            sock.deadline = Some(now + opts.keepwait());
            to_read_list.push(sock);
        } else {
            sock.deadline = Some(now + opts.closewait());
            to_close_list.push(sock);
        }
    }

    (to_read_list, to_close_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EnqueueResult;
    use crate::sock::test_support::bare_sock;

    fn ready(readable: bool, hup: bool) -> Readiness {
        Readiness {
            readable,
            writable: false,
            hup,
            error: false,
        }
    }

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
    fn hup_on_close_list_releases_as_closed() {
        let mut close_list = vec![bare_sock()];
        let recv = FeedRecv { chunks: Mutex::new(vec![]) };
        let released = close_list_pass(&mut close_list, |_fd| ready(false, true), &recv, Instant::now());
        assert!(close_list.is_empty());
        assert_eq!(released.len(), 1);
        assert!(matches!(released[0].1, Reason::Close));
    }

    #[test]
    fn readable_socket_with_full_request_dispatches_and_counts_received() {
        let mut read_list = vec![bare_sock()];
        let recv = FeedRecv {
            chunks: Mutex::new(vec![b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()]),
        };
        let opts = DriverOptions::default();
        let mut hosts = HostMap::new();
        hosts.insert("http", "h", "srv", None, true);
        let pool = AcceptAllPool;
        let ring: Vec<Arc<SpoolerQueue>> = Vec::new();
        let mut cursor = 0;
        let stats = DriverStats::default();
        let mut wait_list = Vec::new();

        let released = read_list_pass(
            &mut read_list,
            &mut wait_list,
            |_fd| ready(true, false),
            &recv,
            &opts,
            &hosts,
            80,
            &[80],
            &pool,
            &ring,
            &mut cursor,
            &stats,
            Instant::now(),
        );
        assert!(read_list.is_empty());
        assert!(released.is_empty());
        assert_eq!(stats.received.load(Ordering::Relaxed), 1);
        assert!(wait_list.is_empty());
    }

    #[test]
    fn deadline_passed_without_data_is_read_timeout() {
        let mut sock = bare_sock();
        sock.deadline = Some(Instant::now() - Duration::from_secs(1));
        let mut read_list = vec![sock];
        let recv = FeedRecv { chunks: Mutex::new(vec![]) };
        let opts = DriverOptions::default();
        let hosts = HostMap::new();
        let pool = AcceptAllPool;
        let ring: Vec<Arc<SpoolerQueue>> = Vec::new();
        let mut cursor = 0;
        let stats = DriverStats::default();
        let mut wait_list = Vec::new();

        let released = read_list_pass(
            &mut read_list,
            &mut wait_list,
            |_fd| ready(false, false),
            &recv,
            &opts,
            &hosts,
            80,
            &[80],
            &pool,
            &ring,
            &mut cursor,
            &stats,
            Instant::now(),
        );
        assert_eq!(released.len(), 1);
        assert!(matches!(released[0].1, Reason::ReadTimeout));
    }

    #[test]
    fn accept_pass_stops_at_maxqueuesize() {
        let slab = SockSlab::new();
        let mut opts = DriverOptions::default();
        opts.maxqueuesize = 1;
        opts.acceptsize = 10;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&listener);

        let accepted = accept_pass(&[fd], |_fd| Some((-1, None)), &slab, &opts, 1, true, Instant::now());
        assert!(accepted.is_empty());
    }

    #[test]
    fn accept_pass_loops_until_eagain_on_linux_style() {
        let slab = SockSlab::new();
        let opts = DriverOptions::default();
        let calls = Mutex::new(3);
        let accepted = accept_pass(
            &[3],
            |_fd| {
                let mut remaining = calls.lock().unwrap();
                if *remaining == 0 {
                    None
                } else {
                    *remaining -= 1;
                    Some((-1, None))
                }
            },
            &slab,
            &opts,
            0,
            true,
            Instant::now(),
        );
        assert_eq!(accepted.len(), 3);
    }

    #[test]
    fn close_intake_routes_by_keep_state() {
        let mut keep_sock = bare_sock();
        keep_sock.keep = crate::sock::KeepState::Yes;
        let close_sock = bare_sock();
        let opts = DriverOptions::default();
        let (to_read, to_close) = close_intake_pass(vec![keep_sock, close_sock], &opts, Instant::now());
        assert_eq!(to_read.len(), 1);
        assert_eq!(to_close.len(), 1);
    }
}
