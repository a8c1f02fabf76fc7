//! `WriterLoop`, `WriterTask`, `PoolInfo` and `PerPoolRates` (§4.8): the
//! asynchronous send side of a driver — memory/file/file-vector responses,
//! per-pool bandwidth shaping, and streamed appends from a worker.
//!
//! No direct teacher counterpart: `HttpConnection::handle_write_phase`
//! (§ teacher `http/http_connection.rs`) only ever flushes one in-memory
//! `write_buffer` or refills from a single `File`, synchronously, on the
//! connection's own poll thread. This generalizes that shape (fill buffer
//! -> flush -> re-poll) into its own thread pool with the iovec/file-vector/
//! rate-limiting machinery §4.8 specifies, reusing `PollSet` the same way
//! `DriverLoop` does.

use crate::prelude::*;
use std::io::IoSlice;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Condvar;

/// §6 listener interface's `send` callback, scoped down to just the
/// iovec-send half the writer needs. Plain TCP and TLS drivers both
/// implement this; TLS wraps the same fd with its own buffering.
pub trait SendTransport: Send + Sync {
    fn send(&self, fd: RawFd, bufs: &[IoSlice]) -> io::Result<usize>;
}

/// `writev(2)`-backed plain-TCP implementation.
pub struct PlainTransport;

impl SendTransport for PlainTransport {
    fn send(&self, fd: RawFd, bufs: &[IoSlice]) -> io::Result<usize> {
        if fd < 0 {
            return Err(io::Error::from(ErrorKind::NotConnected));
        }
        let n = unsafe { libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as i32) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

const UIO_SMALLIOV: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    None,
    Active,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Close,
    CloseTimeout,
    WriteError(String),
    WriteTimeout,
}

pub struct FileRange {
    pub fd: RawFd,
    pub offset: u64,
    pub length: u64,
}

/// The per-task lock from §3's `WriterTask`: held only while a streamed
/// task's `size`/read position are touched, since a worker may be appending
/// concurrently via `append`.
#[derive(Default)]
struct StreamCell {
    to_read: u64,
}

pub enum Payload {
    Memory {
        chunks: Vec<Vec<u8>>,
        index: usize,
        offset: usize,
    },
    File {
        fd: RawFd,
        buf: Vec<u8>,
        buf_len: usize,
        buf_off: usize,
        filevec: Option<Vec<FileRange>>,
        vec_index: usize,
    },
}

pub struct WriterTask {
    pub fd: RawFd,
    pub pool: String,
    pub status: TaskStatus,
    pub keep: bool,
    /// KB/s; `0` means unlimited.
    pub rate_limit: u64,
    pub current_rate: f64,
    pub start: Instant,
    pub nsent: u64,
    /// Bytes remaining to send; for streamed tasks this is bumped by
    /// `append`.
    pub size: u64,
    pub stream: StreamState,
    pub tag: Option<String>,
    pub payload: Payload,
    deadline: Option<Instant>,
    stream_cell: Mutex<StreamCell>,
}

impl WriterTask {
    pub fn submit_bytes(fd: RawFd, pool: impl Into<String>, bytes: Vec<u8>, keep: bool) -> Self {
        let size = bytes.len() as u64;
        Self::new(
            fd,
            pool,
            keep,
            size,
            Payload::Memory {
                chunks: vec![bytes],
                index: 0,
                offset: 0,
            },
        )
    }

    pub fn submit_file(fd: RawFd, pool: impl Into<String>, file_fd: RawFd, size: u64, bufsize: usize, keep: bool) -> Self {
        Self::new(
            fd,
            pool,
            keep,
            size,
            Payload::File {
                fd: file_fd,
                buf: vec![0u8; bufsize],
                buf_len: 0,
                buf_off: 0,
                filevec: None,
                vec_index: 0,
            },
        )
    }

    pub fn submit_filevec(fd: RawFd, pool: impl Into<String>, ranges: Vec<FileRange>, bufsize: usize, keep: bool) -> Self {
        let size = ranges.iter().map(|r| r.length).sum();
        let first_fd = ranges.first().map(|r| r.fd).unwrap_or(-1);
        Self::new(
            fd,
            pool,
            keep,
            size,
            Payload::File {
                fd: first_fd,
                buf: vec![0u8; bufsize],
                buf_len: 0,
                buf_off: 0,
                filevec: Some(ranges),
                vec_index: 0,
            },
        )
    }

    fn new(fd: RawFd, pool: impl Into<String>, keep: bool, size: u64, payload: Payload) -> Self {
        Self {
            fd,
            pool: pool.into(),
            status: TaskStatus::Active,
            keep,
            rate_limit: 0,
            current_rate: 0.0,
            start: Instant::now(),
            nsent: 0,
            size,
            stream: StreamState::None,
            tag: None,
            payload,
            deadline: None,
            stream_cell: Mutex::new(StreamCell::default()),
        }
    }

    /// A worker extending a streaming task's spool file (§4.8.4). Only
    /// valid for `Payload::File` without a file-vector.
    pub fn append(&mut self, extra_bytes: u64) {
        self.stream = StreamState::Active;
        let mut cell = self.stream_cell.lock().expect("writer task stream cell poisoned");
        cell.to_read += extra_bytes;
        self.size += extra_bytes;
    }

    pub fn finish(&mut self) {
        self.stream = StreamState::Finish;
    }

    fn measure_rate(&mut self, bufsize: usize) {
        if self.nsent as usize > bufsize {
            let elapsed_ms = self.start.elapsed().as_millis().max(1) as f64;
            self.current_rate = self.nsent as f64 / elapsed_ms;
        }
    }

    /// `sleep_ms = nsent/rateLimit - nsent/currentRate` (§4.8 step 5). A
    /// positive result means this task should not be scheduled for
    /// `POLLOUT` this round.
    fn oversend_sleep_ms(&self) -> f64 {
        if self.rate_limit == 0 || self.current_rate <= 0.0 {
            return 0.0;
        }
        let target_ms = self.nsent as f64 / (self.rate_limit as f64 * 1024.0 / 1000.0);
        let actual_ms = self.nsent as f64 / self.current_rate;
        target_ms - actual_ms
    }
}

/// §3 `PoolInfo`: per-writer-thread, per-pool cached rate accounting,
/// shared across a driver's writer threads so §4.8.3's `totalPoolRate` sum
/// has something to sum over.
#[derive(Default, Clone, Copy)]
struct PoolSlot {
    current_rate: f64,
}

pub struct PoolTable {
    limits: Mutex<HashMap<String, u64>>,
    slots: Mutex<HashMap<String, Vec<PoolSlot>>>,
}

impl Default for PoolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolTable {
    pub fn new() -> Self {
        Self {
            limits: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_limit(&self, pool: &str, kb_per_sec: u64) {
        self.limits
            .lock()
            .expect("pool table poisoned")
            .insert(pool.to_string(), kb_per_sec);
    }

    fn limit(&self, pool: &str) -> u64 {
        *self.limits.lock().expect("pool table poisoned").get(pool).unwrap_or(&0)
    }

    fn slot(&self, pool: &str, thread_count: usize, thread_id: usize) -> usize {
        let mut slots = self.slots.lock().expect("pool table poisoned");
        let v = slots.entry(pool.to_string()).or_insert_with(Vec::new);
        if v.len() < thread_count {
            v.resize(thread_count, PoolSlot::default());
        }
        thread_id.min(v.len().saturating_sub(1))
    }

    fn set_rate(&self, pool: &str, slot: usize, rate: f64) {
        let mut slots = self.slots.lock().expect("pool table poisoned");
        if let Some(v) = slots.get_mut(pool) {
            if let Some(s) = v.get_mut(slot) {
                s.current_rate = rate;
            }
        }
    }

    fn total_rate(&self, pool: &str) -> f64 {
        self.slots
            .lock()
            .expect("pool table poisoned")
            .get(pool)
            .map(|v| v.iter().map(|s| s.current_rate).sum())
            .unwrap_or(0.0)
    }
}

/// §4.8.3 `PerPoolRates`: divides each pool's configured limit fairly
/// across the writer threads currently sending for it.
fn per_pool_rates(
    active: &mut [WriterTask],
    table: &PoolTable,
    thread_id: usize,
    thread_count: usize,
) {
    let mut per_pool_current: HashMap<String, f64> = HashMap::new();
    for task in active.iter() {
        if task.rate_limit > 0 && task.current_rate > 0.0 {
            *per_pool_current.entry(task.pool.clone()).or_insert(0.0) += task.current_rate;
        }
    }

    for (pool, current) in &per_pool_current {
        let slot = table.slot(pool, thread_count, thread_id);
        table.set_rate(pool, slot, *current);
    }

    let mut delta_pct: HashMap<String, f64> = HashMap::new();
    for pool in per_pool_current.keys() {
        let limit = table.limit(pool) as f64 * 1024.0; // bytes/sec
        if limit <= 0.0 {
            continue;
        }
        let total = table.total_rate(pool);
        let this_rate = *per_pool_current.get(pool).unwrap_or(&0.0);
        let delta = limit - total;
        let thread_delta = if this_rate == 0.0 {
            delta
        } else {
            delta / thread_count.max(1) as f64
        };
        delta_pct.insert(pool.clone(), (thread_delta / 10.0).max(-50.0));
    }

    for task in active.iter_mut() {
        if task.rate_limit == 0 {
            continue;
        }
        let near_limit = task.rate_limit > 0
            && task.current_rate * 100.0 / (task.rate_limit as f64 * 1024.0 / 1000.0) > 90.0;
        if !near_limit {
            continue;
        }
        if let Some(pct) = delta_pct.get(&task.pool) {
            let pool_limit = table.limit(&task.pool);
            let adjusted = task.rate_limit as f64 * (1.0 + pct / 100.0);
            task.rate_limit = adjusted.max(5.0).min(pool_limit.max(5) as f64) as u64;
        }
    }
}

/// `WriterTask` summary exposed through `writer list` (§6, §4.13).
pub struct TaskSummary {
    pub start: Instant,
    pub fd: RawFd,
    pub pool: String,
    pub size: u64,
    pub nsent: u64,
    pub current_rate: f64,
    pub rate_limit: u64,
    pub tag: Option<String>,
}

pub struct WriterQueue {
    pub id: usize,
    intake: Mutex<Vec<WriterTask>>,
    cond: Condvar,
    queuesize: AtomicUsize,
    shutdown: AtomicBool,
    stopped: AtomicBool,
    summaries: Mutex<Vec<TaskSummary>>,
    size_limit: AtomicUsize,
    streaming_enabled: AtomicBool,
}

impl WriterQueue {
    pub fn new(id: usize, writersize: usize, writerstreaming: bool) -> Self {
        Self {
            id,
            intake: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            queuesize: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            summaries: Mutex::new(Vec::new()),
            size_limit: AtomicUsize::new(writersize),
            streaming_enabled: AtomicBool::new(writerstreaming),
        }
    }

    pub fn submit(&self, task: WriterTask) {
        self.intake.lock().expect("writer queue poisoned").push(task);
        self.queuesize.fetch_add(1, Ordering::SeqCst);
        self.cond.notify_one();
    }

    pub fn queuesize(&self) -> usize {
        self.queuesize.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cond.notify_one();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Moves freshly submitted tasks into `active`. `run_iteration` itself
    /// stays agnostic of the intake list so it can be driven directly in
    /// tests; the owning thread calls this once per iteration first.
    pub fn absorb(&self, active: &mut Vec<WriterTask>) {
        let mut intake = self.intake.lock().expect("writer queue poisoned");
        if !intake.is_empty() {
            active.append(&mut intake);
            self.queuesize.store(active.len(), Ordering::SeqCst);
        }
    }

    pub fn get_size(&self) -> usize {
        self.size_limit.load(Ordering::SeqCst)
    }

    pub fn set_size(&self, n: usize) {
        self.size_limit.store(n, Ordering::SeqCst);
    }

    pub fn get_streaming(&self) -> bool {
        self.streaming_enabled.load(Ordering::SeqCst)
    }

    pub fn set_streaming(&self, v: bool) {
        self.streaming_enabled.store(v, Ordering::SeqCst);
    }

    /// §6 `writer list [-server S]`: a snapshot of the last iteration's
    /// active tasks. `server` filtering is left to the caller (the pool
    /// name doubles as the server tag in this core's minimal model).
    pub fn list(&self, server: Option<&str>) -> Vec<String> {
        let summaries = self.summaries.lock().expect("writer queue poisoned");
        summaries
            .iter()
            .filter(|s| server.is_none_or(|f| s.pool == f))
            .map(|s| {
                format!(
                    "start={:?} fd={} pool={} size={} nsent={} rate={:.1} limit={} tag={}",
                    s.start,
                    s.fd,
                    s.pool,
                    s.size,
                    s.nsent,
                    s.current_rate,
                    s.rate_limit,
                    s.tag.as_deref().unwrap_or("-"),
                )
            })
            .collect()
    }

    fn publish_summaries(&self, active: &[WriterTask]) {
        let snapshot = active
            .iter()
            .map(|t| TaskSummary {
                start: t.start,
                fd: t.fd,
                pool: t.pool.clone(),
                size: t.size,
                nsent: t.nsent,
                current_rate: t.current_rate,
                rate_limit: t.rate_limit,
                tag: t.tag.clone(),
            })
            .collect();
        *self.summaries.lock().expect("writer queue poisoned") = snapshot;
    }
}

/// One iteration of the writer thread's loop (§4.8). Split out from `run`
/// so tests can drive a single pass deterministically without a real
/// socket poll.
pub fn run_iteration(
    active: &mut Vec<WriterTask>,
    queue: &WriterQueue,
    opts: &DriverOptions,
    transport: &dyn SendTransport,
    table: &PoolTable,
    thread_id: usize,
    thread_count: usize,
    now: Instant,
) -> Vec<WriterTask> {
    if opts.writerratelimit > 0 {
        per_pool_rates(active, table, thread_id, thread_count);
    }

    let mut finished = Vec::new();
    let mut still_active = Vec::new();

    for mut task in active.drain(..) {
        if task.size == 0 && task.stream != StreamState::Active {
            task.status = TaskStatus::Close;
            finished.push(task);
            continue;
        }

        if task.oversend_sleep_ms() > 0.0 {
            still_active.push(task);
            continue;
        }

        match read_from_spool(&mut task) {
            Ok(()) => {}
            Err(e) => {
                task.status = TaskStatus::WriteError(e.to_string());
                finished.push(task);
                continue;
            }
        }

        match send_task(&mut task, transport) {
            Ok(0) if task.size > 0 => {
                if task.deadline.is_none() {
                    task.deadline = Some(now + opts.sendwait());
                }
                if task.deadline.is_some_and(|d| d <= now) {
                    task.status = TaskStatus::WriteTimeout;
                    finished.push(task);
                } else {
                    still_active.push(task);
                }
            }
            Ok(_) => {
                task.deadline = None;
                task.measure_rate(opts.writerbufsize);
                if task.size == 0 && task.stream != StreamState::Active {
                    task.status = TaskStatus::Close;
                    finished.push(task);
                } else {
                    still_active.push(task);
                }
            }
            Err(e) => {
                task.status = TaskStatus::WriteError(e.to_string());
                finished.push(task);
            }
        }
    }

    queue.publish_summaries(&still_active);
    *active = still_active;
    finished
}

/// §4.8.1 `ReadFromSpool`. A no-op for memory-sourced tasks.
fn read_from_spool(task: &mut WriterTask) -> io::Result<()> {
    let Payload::File {
        fd,
        buf,
        buf_len,
        buf_off,
        filevec,
        vec_index,
    } = &mut task.payload
    else {
        return Ok(());
    };

    if *buf_off > 0 && *buf_off < *buf_len {
        buf.copy_within(*buf_off..*buf_len, 0);
    }
    *buf_len -= *buf_off;
    *buf_off = 0;

    if *buf_len >= buf.len() {
        return Ok(()); // still have a full buffer queued to send
    }

    if task.stream == StreamState::Active {
        unsafe {
            libc::lseek(*fd, task.nsent as i64, libc::SEEK_SET);
        }
    }

    if let Some(ranges) = filevec {
        loop {
            if *vec_index >= ranges.len() {
                return Ok(());
            }
            let range = &ranges[*vec_index];
            let want = (buf.len() - *buf_len).min(range.length as usize);
            if want == 0 {
                return Ok(());
            }
            let n = unsafe {
                libc::pread(
                    range.fd,
                    buf[*buf_len..*buf_len + want].as_mut_ptr() as *mut libc::c_void,
                    want,
                    range.offset as i64,
                )
            };
            if n <= 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "filevec read returned <= 0"));
            }
            *buf_len += n as usize;
            if (n as u64) < range.length {
                ranges[*vec_index].offset += n as u64;
                ranges[*vec_index].length -= n as u64;
            } else {
                unsafe { libc::close(range.fd) };
                *vec_index += 1;
            }
            if *buf_len == buf.len() {
                return Ok(());
            }
        }
    }

    let want = buf.len() - *buf_len;
    if want == 0 || *fd < 0 {
        return Ok(());
    }
    let n = unsafe { libc::read(*fd, buf[*buf_len..].as_mut_ptr() as *mut libc::c_void, want) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    *buf_len += n as usize;
    Ok(())
}

/// §4.8.2 `Send`: builds an iovec, sends, and compacts on partial send.
fn send_task(task: &mut WriterTask, transport: &dyn SendTransport) -> io::Result<usize> {
    let fd = task.fd;
    let sent = match &mut task.payload {
        Payload::File { buf, buf_off, buf_len, .. } => {
            if *buf_len == *buf_off {
                return Ok(0);
            }
            let slice = [IoSlice::new(&buf[*buf_off..*buf_len])];
            let n = transport.send(fd, &slice)?;
            *buf_off += n;
            n
        }
        Payload::Memory { chunks, index, offset } => {
            let mut slices: Vec<IoSlice> = Vec::with_capacity(UIO_SMALLIOV);
            let mut i = *index;
            let mut first = true;
            while i < chunks.len() && slices.len() < UIO_SMALLIOV {
                let start = if first { *offset } else { 0 };
                first = false;
                slices.push(IoSlice::new(&chunks[i][start..]));
                i += 1;
            }
            if slices.is_empty() {
                return Ok(0);
            }
            let n = transport.send(fd, &slices)?;
            advance_memory_cursor(chunks, index, offset, n);
            n
        }
    };

    task.nsent += sent as u64;
    if task.stream == StreamState::Active {
        let mut cell = task.stream_cell.lock().expect("writer task stream cell poisoned");
        cell.to_read = cell.to_read.saturating_sub(sent as u64);
    }
    task.size = task.size.saturating_sub(sent as u64);
    Ok(sent)
}

/// Advances `(index, offset)` over `chunks` by `sent` bytes, as if the
/// scratch iovec array had been compacted in place (§4.8.2).
fn advance_memory_cursor(chunks: &[Vec<u8>], index: &mut usize, offset: &mut usize, mut sent: usize) {
    while sent > 0 && *index < chunks.len() {
        let remaining_in_chunk = chunks[*index].len() - *offset;
        if sent < remaining_in_chunk {
            *offset += sent;
            return;
        }
        sent -= remaining_in_chunk;
        *index += 1;
        *offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingTransport {
        per_call: Mutex<Vec<usize>>,
    }

    impl SendTransport for RecordingTransport {
        fn send(&self, _fd: RawFd, bufs: &[IoSlice]) -> io::Result<usize> {
            let total: usize = bufs.iter().map(|b| b.len()).sum();
            let mut calls = self.per_call.lock().unwrap();
            let cap = calls.pop().unwrap_or(total);
            Ok(cap.min(total))
        }
    }

    #[test]
    fn partial_send_resumes_from_first_unsent_byte() {
        let task = WriterTask::submit_bytes(3, "p", b"abcdefghij".to_vec(), true);
        let queue = WriterQueue::new(0, 1024, false);
        let opts = DriverOptions::default();
        let transport = RecordingTransport {
            per_call: Mutex::new(vec![2, 3, 5]),
        };
        let table = PoolTable::new();
        let mut active = vec![task];

        let finished = run_iteration(&mut active, &queue, &opts, &transport, &table, 0, 1, Instant::now());
        assert!(finished.is_empty());
        assert_eq!(active[0].nsent, 5);

        run_iteration(&mut active, &queue, &opts, &transport, &table, 0, 1, Instant::now());
        let finished = run_iteration(&mut active, &queue, &opts, &transport, &table, 0, 1, Instant::now());
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].nsent, 10);
    }

    #[test]
    fn zero_size_non_streaming_task_closes_immediately() {
        let mut task = WriterTask::submit_bytes(3, "p", Vec::new(), true);
        task.size = 0;
        let queue = WriterQueue::new(0, 1024, false);
        let opts = DriverOptions::default();
        let transport = RecordingTransport { per_call: Mutex::new(vec![]) };
        let table = PoolTable::new();
        let mut active = vec![task];
        let finished = run_iteration(&mut active, &queue, &opts, &transport, &table, 0, 1, Instant::now());
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, TaskStatus::Close);
    }

    #[test]
    fn streaming_task_stays_active_until_finished() {
        let mut task = WriterTask::submit_bytes(3, "p", Vec::new(), true);
        task.size = 0;
        task.stream = StreamState::Active;
        let queue = WriterQueue::new(0, 1024, true);
        let opts = DriverOptions::default();
        let transport = RecordingTransport { per_call: Mutex::new(vec![]) };
        let table = PoolTable::new();
        let mut active = vec![task];
        let finished = run_iteration(&mut active, &queue, &opts, &transport, &table, 0, 1, Instant::now());
        assert!(finished.is_empty());
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn pool_rate_clamp_never_drops_below_five() {
        let table = PoolTable::new();
        table.set_limit("p", 100);
        let mut task = WriterTask::submit_bytes(3, "p", b"x".repeat(1000), true);
        task.rate_limit = 1;
        task.current_rate = 10_000.0; // far above limit, forces near-limit branch
        let mut active = vec![task];
        per_pool_rates(&mut active, &table, 0, 1);
        assert!(active[0].rate_limit >= 5);
    }
}
