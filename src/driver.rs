//! `Driver` (§3) and `DriverRegistry` (§4.12): the owning struct that wires
//! `PollSet`/`SockSlab`/`HostMap`/`SpoolerQueue`/`WriterQueue` together
//! behind real listening sockets, and the process-wide registry that backs
//! the control surface (§4.13).
//!
//! No teacher counterpart wires these together either — `server.rs` never
//! got past `Server { connections: HashMap<Token, HttpConnection> }` plus a
//! bare `Token` counter, and `main.rs` is an abandoned scratch async
//! executor. This is grounded on the *shape* of that intended `Server`
//! (one struct owning the listener, the connection table, and the mio
//! `Poll`) generalized into the multi-thread, multi-queue driver §3/§4.6
//! describe.

use crate::dispatch::WorkerPool;
use crate::driver_loop::{self, DriverStats, StatsSnapshot};
use crate::host_map::HostMap;
use crate::pollset::PollSet;
use crate::prelude::*;
use crate::request_buffer::RequestBufferPool;
use crate::sock::{Sock, SockSlab};
use crate::spooler::{self, PlainRecv, SpoolerQueue};
use crate::writer::{self, PlainTransport, PoolTable, WriterQueue};
use mio::Interest;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// One accepted listener bound to a single port, kept nonblocking for
/// poll-gated `accept()` (§4.6 step 7).
struct Listener {
    port: u16,
    inner: std::net::TcpListener,
}

/// §3 "Driver": one per listener module instance.
pub struct Driver {
    pub name: String,
    pub protocol: String,
    listeners: Vec<Listener>,
    pub opts: Arc<DriverOptions>,
    pub hosts: Arc<HostMap>,
    pub slab: Arc<SockSlab>,
    pub buffer_pool: Arc<RequestBufferPool>,
    pub pool: Arc<dyn WorkerPool>,
    pub spooler_queues: Vec<Arc<SpoolerQueue>>,
    pub writer_queues: Vec<Arc<WriterQueue>>,
    rate_table: Arc<PoolTable>,
    pub stats: Arc<DriverStats>,
    close_intake: Mutex<Vec<Sock>>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// One waker per driver-loop thread, registered as each thread builds
    /// its own `PollSet` (§4.6 step 3's trigger pipe). `return_socket` and
    /// `request_shutdown` wake every thread early rather than waiting for
    /// the next `poll` timeout.
    wakers: Mutex<Vec<Arc<mio::Waker>>>,
    /// Backs the synthetic access-log record §4.11/§7 require on every
    /// direct-reply release, regardless of which fd it's pointed at (the
    /// access-log *format* itself stays an external concern, §1).
    access_log: crate::async_log::AsyncLogWriter,
    access_log_fd: Mutex<RawFd>,
}

impl Driver {
    /// Binds one listener per port in `opts.ports`, all nonblocking.
    /// Fails the whole driver if any port fails to bind — a partially
    /// bound driver has no sane recovery (§3 lifecycle: "started when
    /// listen succeeds").
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        name: impl Into<String>,
        protocol: impl Into<String>,
        bind_addr: IpAddr,
        opts: DriverOptions,
        hosts: HostMap,
        pool: Arc<dyn WorkerPool>,
    ) -> io::Result<Arc<Self>> {
        if hosts.default_binding().is_none() {
            // Invariant 8: no usable default vhost is a fatal startup error.
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "HostMap has no default VHostBinding",
            ));
        }

        let mut listeners = Vec::with_capacity(opts.ports.0.len());
        for &port in &opts.ports.0 {
            let std_listener = std::net::TcpListener::bind((bind_addr, port))?;
            std_listener.set_nonblocking(true)?;
            listeners.push(Listener { port, inner: std_listener });
        }

        let spooler_queues = (0..opts.spoolerthreads.max(1))
            .map(|id| Arc::new(SpoolerQueue::new(id)))
            .collect();
        let writer_queues = (0..opts.writerthreads.max(1))
            .map(|id| Arc::new(WriterQueue::new(id, opts.writersize, opts.writerstreaming)))
            .collect();

        Ok(Arc::new(Self {
            name: name.into(),
            protocol: protocol.into(),
            listeners,
            opts: Arc::new(opts),
            hosts: Arc::new(hosts),
            slab: Arc::new(SockSlab::new()),
            buffer_pool: Arc::new(RequestBufferPool::new()),
            pool,
            spooler_queues,
            writer_queues,
            rate_table: Arc::new(PoolTable::new()),
            stats: Arc::new(DriverStats::default()),
            close_intake: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            wakers: Mutex::new(Vec::new()),
            access_log: crate::async_log::AsyncLogWriter::start(),
            access_log_fd: Mutex::new(libc::STDERR_FILENO),
        }))
    }

    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|l| l.port).collect()
    }

    /// Actual bound addresses, including the OS-assigned port when a
    /// listener was configured with the ephemeral port `0`.
    pub fn local_addrs(&self) -> io::Result<Vec<std::net::SocketAddr>> {
        self.listeners.iter().map(|l| l.inner.local_addr()).collect()
    }

    /// Redirects the synthetic access-log stream (§4.11) to `fd`, e.g. the
    /// application's own access-log file once it has opened one. Defaults
    /// to stderr so direct-reply accounting is never silently dropped.
    pub fn set_access_log_fd(&self, fd: RawFd) {
        *self.access_log_fd.lock().expect("driver lock poisoned") = fd;
    }

    fn listener_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(|l| l.inner.as_raw_fd()).collect()
    }

    /// §4.6 step 8's "close-intake pass" source: whoever finishes a
    /// response (the worker pool, or the writer loop after a final flush)
    /// hands the `Sock` back here instead of closing it directly, so
    /// `DriverLoop` alone decides keep-alive vs. drain-to-close.
    pub fn return_socket(&self, sock: Sock) {
        self.close_intake.lock().expect("driver lock poisoned").push(sock);
        self.wake_all();
    }

    fn wake_all(&self) {
        for w in self.wakers.lock().expect("driver lock poisoned").iter() {
            let _ = w.wake();
        }
    }

    /// `stats.errors` is already bumped where a release reason is first
    /// decided (`read_list_pass`, `requeue_pass`'s dispatch outcome).
    ///
    /// §4.11: when the reason maps to a status code, send the minimal
    /// `HTTP/1.0` reply and a synthetic access-log entry before the `Sock`
    /// is freed — send-then-release, matching the source's own ordering
    /// (§9 unresolved-behavior note #2).
    fn release_sock(&self, sock: Sock, reason: Reason) {
        if reason.should_log() {
            warn!("driver {}: releasing fd {} ({reason})", self.name, sock.fd);
        }
        if let Some(status) = reason.http_status() {
            let reply = crate::async_log::direct_reply(status, reason.status_text(), reason.retry_after());
            let _ = crate::async_log::write_all_retrying(sock.fd, &reply);

            let (method, url) = sock
                .request_buffer
                .as_ref()
                .and_then(|b| b.request_line.as_ref())
                .map(|rl| (rl.method.as_str(), rl.url.as_str()))
                .unwrap_or(("-", "-"));
            let log_line = crate::async_log::synthetic_access_log(method, url, status, reply.len());
            let fd = *self.access_log_fd.lock().expect("driver lock poisoned");
            let _ = self.access_log.write(fd, &log_line);
        }
        self.slab.release(sock, &self.buffer_pool);
    }

    /// §4.6/§4.7/§4.8: spawns `driverthreads` driver-loop threads plus one
    /// thread per spooler/writer queue. Each thread holds its own `Arc`
    /// clone; `Driver` itself never joins them (`request_shutdown` plus
    /// process exit is the only teardown path, matching §3's lifecycle).
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().expect("driver lock poisoned");

        for _ in 0..self.opts.driverthreads.max(1) {
            let driver = Arc::clone(self);
            threads.push(std::thread::spawn(move || run_driver_loop(driver)));
        }
        for (thread_id, queue) in self.spooler_queues.iter().enumerate() {
            let driver = Arc::clone(self);
            let queue = Arc::clone(queue);
            threads.push(std::thread::spawn(move || run_spooler_loop(driver, queue, thread_id)));
        }
        for (thread_id, queue) in self.writer_queues.iter().enumerate() {
            let driver = Arc::clone(self);
            let queue = Arc::clone(queue);
            let table = Arc::clone(&self.rate_table);
            let thread_count = self.writer_queues.len();
            threads.push(std::thread::spawn(move || {
                run_writer_loop(driver, queue, table, thread_id, thread_count)
            }));
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for q in &self.spooler_queues {
            q.request_shutdown();
        }
        for q in &self.writer_queues {
            q.request_shutdown();
        }
        self.wake_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().expect("driver lock poisoned").len()
    }

    /// §6 `writer submit*`: hands a prebuilt response task to the next
    /// writer queue in round-robin order.
    pub fn submit_writer_task(&self, task: crate::writer::WriterTask, cursor: &mut usize) {
        let idx = *cursor % self.writer_queues.len().max(1);
        *cursor = cursor.wrapping_add(1);
        self.writer_queues[idx].submit(task);
    }
}

const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const TRIGGER_TOKEN: usize = usize::MAX;

fn run_driver_loop(driver: Arc<Driver>) {
    let mut pollset = match PollSet::new(driver.opts.maxqueuesize.max(64)) {
        Ok(p) => p,
        Err(e) => {
            errors!("driver {}: failed to build pollset: {e}", driver.name);
            return;
        }
    };
    let waker = match pollset.waker(mio::Token(TRIGGER_TOKEN)) {
        Ok(w) => Arc::new(w),
        Err(e) => {
            errors!("driver {}: failed to build trigger waker: {e}", driver.name);
            return;
        }
    };
    driver.wakers.lock().expect("driver lock poisoned").push(Arc::clone(&waker));

    let recv = PlainRecv;
    let listen_fds = driver.listener_fds();
    let listener_by_fd: HashMap<RawFd, &std::net::TcpListener> =
        driver.listeners.iter().map(|l| (l.inner.as_raw_fd(), &l.inner)).collect();

    let mut read_list: Vec<Sock> = Vec::new();
    let mut close_list: Vec<Sock> = Vec::new();
    let mut wait_list: Vec<Sock> = Vec::new();
    let mut spooler_cursor = 0usize;
    let ports = driver.ports();
    let default_port = ports.first().copied().unwrap_or(80);

    loop {
        // Step 1: rebuild PollSet.
        pollset.reset();
        let mut listen_indices = Vec::with_capacity(listen_fds.len());
        for &fd in &listen_fds {
            if let Ok(idx) = pollset.add(fd, Interest::READABLE, None) {
                listen_indices.push((idx, fd));
            }
        }

        let mut read_index_map = HashMap::with_capacity(read_list.len());
        for sock in &read_list {
            if let Ok(idx) = pollset.add(sock.fd, Interest::READABLE, sock.deadline) {
                read_index_map.insert(sock.fd, idx);
            }
        }
        let mut close_index_map = HashMap::with_capacity(close_list.len());
        for sock in &close_list {
            if let Ok(idx) = pollset.add(sock.fd, Interest::READABLE, sock.deadline) {
                close_index_map.insert(sock.fd, idx);
            }
        }

        // Step 2-3: poll, drain trigger, signal worker pool.
        let now = Instant::now();
        let timeout = pollset.timeout(now, MAX_POLL_TIMEOUT);
        if let Err(e) = pollset.wait(timeout) {
            errors!("driver {}: poll failed: {e}", driver.name);
            continue;
        }
        if pollset.ready(TRIGGER_TOKEN).readable {
            driver.pool.ensure_running(&driver.name, "trigger");
        }
        let now = Instant::now();

        // Step 4: close-list pass.
        let released = driver_loop::close_list_pass(
            &mut close_list,
            |fd| close_index_map.get(&fd).map(|&i| pollset.ready(i)).unwrap_or_default(),
            &recv,
            now,
        );
        for (sock, reason) in released {
            driver.release_sock(sock, reason);
        }

        // Step 5: read-list pass.
        let released = driver_loop::read_list_pass(
            &mut read_list,
            &mut wait_list,
            |fd| read_index_map.get(&fd).map(|&i| pollset.ready(i)).unwrap_or_default(),
            &recv,
            &driver.opts,
            &driver.hosts,
            default_port,
            &ports,
            driver.pool.as_ref(),
            &driver.spooler_queues,
            &mut spooler_cursor,
            &driver.stats,
            now,
        );
        for (sock, reason) in released {
            driver.release_sock(sock, reason);
        }

        // Step 6: requeue pass.
        let released = driver_loop::requeue_pass(&mut wait_list, &driver.hosts, default_port, &ports, driver.pool.as_ref(), now);
        for (sock, reason) in released {
            driver.release_sock(sock, reason);
        }

        // Step 7: accept pass, only on listen fds poll actually woke us for.
        let readable_listen_fds: Vec<RawFd> = listen_indices
            .iter()
            .filter(|(idx, _)| pollset.ready(*idx).readable)
            .map(|(_, fd)| *fd)
            .collect();
        let queuesize = read_list.len() + close_list.len() + wait_list.len();
        let accepted = driver_loop::accept_pass(
            &readable_listen_fds,
            |fd| {
                listener_by_fd.get(&fd).and_then(|l| match l.accept() {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nonblocking(true);
                        Some((stream.into_raw_fd(), Some(addr)))
                    }
                    Err(_) => None,
                })
            },
            &driver.slab,
            &driver.opts,
            queuesize,
            cfg!(target_os = "linux"),
            now,
        );
        // A freshly accepted socket has no bytes yet in the common case;
        // the next iteration's read-list pass performs the first recv.
        read_list.extend(accepted);

        // Step 8: close-intake pass.
        let intake = std::mem::take(&mut *driver.close_intake.lock().expect("driver lock poisoned"));
        if !intake.is_empty() {
            let (to_read, to_close) = driver_loop::close_intake_pass(intake, &driver.opts, now);
            read_list.extend(to_read);
            close_list.extend(to_close);
        }

        // Step 9: shutdown.
        if driver.shutdown_requested() {
            for fd in &listen_fds {
                unsafe {
                    libc::close(*fd);
                }
            }
            for sock in read_list.drain(..).chain(close_list.drain(..)).chain(wait_list.drain(..)) {
                driver.release_sock(sock, Reason::Close);
            }
            break;
        }
    }
}

fn run_spooler_loop(driver: Arc<Driver>, queue: Arc<SpoolerQueue>, _thread_id: usize) {
    let recv = PlainRecv;
    let mut active: Vec<Sock> = Vec::new();
    let ports = driver.ports();
    let default_port = ports.first().copied().unwrap_or(80);

    loop {
        if queue.shutdown_requested() && active.is_empty() && queue.queuesize() == 0 {
            break;
        }

        let mut pollset = match PollSet::new(active.len().max(16)) {
            Ok(p) => p,
            Err(e) => {
                errors!("spooler {}: failed to build pollset: {e}", queue.id);
                return;
            }
        };
        let mut index_map = HashMap::with_capacity(active.len());
        for sock in &active {
            if let Ok(idx) = pollset.add(sock.fd, Interest::READABLE, sock.deadline) {
                index_map.insert(sock.fd, idx);
            }
        }
        let now = Instant::now();
        let timeout = pollset.timeout(now, Duration::from_millis(250));
        let _ = pollset.wait(timeout);
        let now = Instant::now();

        let released = spooler::run_iteration(
            &mut active,
            &queue,
            &driver.opts,
            &recv,
            &driver.hosts,
            default_port,
            &ports,
            driver.pool.as_ref(),
            |fd| index_map.get(&fd).map(|&i| pollset.ready(i).readable).unwrap_or(false),
            now,
        );
        for (sock, reason) in released {
            let mapped = match reason {
                spooler::SpoolerReleaseReason::Close => Reason::Close,
                spooler::SpoolerReleaseReason::ReadTimeout => Reason::ReadTimeout,
                spooler::SpoolerReleaseReason::ReadError => Reason::ReadError("spooler read failed".into()),
                spooler::SpoolerReleaseReason::BadHeader(r) => r,
            };
            driver.release_sock(sock, mapped);
        }
    }
}

fn run_writer_loop(driver: Arc<Driver>, queue: Arc<WriterQueue>, table: Arc<PoolTable>, thread_id: usize, thread_count: usize) {
    let transport = PlainTransport;
    let mut active: Vec<crate::writer::WriterTask> = Vec::new();

    loop {
        queue.absorb(&mut active);
        if queue.shutdown_requested() && active.is_empty() && queue.queuesize() == 0 {
            break;
        }

        let now = Instant::now();
        let finished = writer::run_iteration(&mut active, &queue, &driver.opts, &transport, &table, thread_id, thread_count, now);

        for task in finished {
            if !matches!(task.status, crate::writer::TaskStatus::Close) {
                warn!("writer {}: task on fd {} ended with {:?}", queue.id, task.fd, task.status);
            }
            driver.pool.add_bytes_sent(&task.pool, task.nsent as usize);
        }

        if active.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// §4.12 "process-wide owning registry of every constructed Driver".
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<Vec<Arc<Driver>>>,
}

pub struct DriverInfo {
    pub name: String,
    pub protocol: String,
    pub ports: Vec<u16>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, driver: Arc<Driver>) {
        self.drivers.lock().expect("registry lock poisoned").push(driver);
    }

    pub fn find(&self, name: &str) -> Option<Arc<Driver>> {
        self.drivers
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers.lock().expect("registry lock poisoned").iter().map(|d| d.name.clone()).collect()
    }

    pub fn info(&self) -> Vec<DriverInfo> {
        self.drivers
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .map(|d| DriverInfo {
                name: d.name.clone(),
                protocol: d.protocol.clone(),
                ports: d.ports(),
            })
            .collect()
    }

    pub fn threads(&self) -> usize {
        self.drivers.lock().expect("registry lock poisoned").iter().map(|d| d.thread_count()).sum()
    }

    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.drivers
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .map(|d| (d.name.clone(), d.stats()))
            .collect()
    }

    pub fn shutdown_all(&self) {
        for d in self.drivers.lock().expect("registry lock poisoned").iter() {
            d.request_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EnqueueResult;

    struct NoopPool;
    impl WorkerPool for NoopPool {
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

    fn default_hosts() -> HostMap {
        let mut hosts = HostMap::new();
        hosts.insert("http", "localhost", "srv", None, true);
        hosts
    }

    #[test]
    fn bind_fails_without_default_vhost() {
        let opts = DriverOptions {
            ports: crate::config::PortList(vec![0]),
            ..DriverOptions::default()
        };
        let err = Driver::bind("t", "http", IpAddr::from([127, 0, 0, 1]), opts, HostMap::new(), Arc::new(NoopPool));
        assert!(err.is_err());
    }

    #[test]
    fn bind_succeeds_on_ephemeral_port_and_registers() {
        let opts = DriverOptions {
            ports: crate::config::PortList(vec![0]),
            driverthreads: 1,
            spoolerthreads: 1,
            writerthreads: 1,
            ..DriverOptions::default()
        };
        let driver = Driver::bind("t", "http", IpAddr::from([127, 0, 0, 1]), opts, default_hosts(), Arc::new(NoopPool)).unwrap();
        assert_eq!(driver.ports().len(), 1);

        let registry = DriverRegistry::new();
        registry.register(Arc::clone(&driver));
        assert_eq!(registry.names(), vec!["t".to_string()]);
        assert_eq!(registry.info().len(), 1);

        driver.request_shutdown();
        assert!(driver.shutdown_requested());
    }

    /// §4.11 end-to-end: an HTTP/1.1 request with no `Host` header is a
    /// `BadHeader` release, which must carry a direct `HTTP/1.0 400` reply
    /// back to the client before the connection closes (scenario 6's
    /// shape, applied to the missing-`Host` case instead of oversize).
    #[test]
    fn missing_host_gets_direct_400_reply() {
        use std::io::{Read, Write};
        use std::net::TcpStream;
        use std::time::Duration;

        let opts = DriverOptions {
            ports: crate::config::PortList(vec![0]),
            driverthreads: 1,
            spoolerthreads: 1,
            writerthreads: 1,
            ..DriverOptions::default()
        };
        let driver = Driver::bind("t", "http", IpAddr::from([127, 0, 0, 1]), opts, default_hosts(), Arc::new(NoopPool)).unwrap();
        let addr = driver.local_addrs().unwrap()[0];
        driver.start();

        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
            if response.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.0 400"), "unexpected reply: {text:?}");

        driver.request_shutdown();
    }
}
