//! `AsyncLogWriter` (§4.9): a single background thread that moves log
//! writes off the calling thread, with synchronous fallback when disabled
//! and a drain-on-shutdown guarantee.
//!
//! No teacher counterpart exists (the teacher's logging is a bare
//! `println!`-based macro, §9 of DESIGN.md); grounded directly on §4.9's
//! description and on the same intake-list/condvar shape `SpoolerQueue`/
//! `WriterQueue` use elsewhere in this crate, since it is the same "queue
//! plus worker thread" pattern applied to a different payload.

use crate::prelude::*;
use std::os::unix::io::RawFd;
use std::sync::Condvar;
use std::thread::JoinHandle;

struct Task {
    fd: RawFd,
    data: Vec<u8>,
}

struct Shared {
    intake: Mutex<Vec<Task>>,
    cond: Condvar,
    shutdown: Mutex<bool>,
}

pub struct AsyncLogWriter {
    shared: Arc<Shared>,
    enabled: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncLogWriter {
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            intake: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            shutdown: Mutex::new(false),
        });
        let enabled = Arc::new(Mutex::new(true));

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || run(worker_shared));

        Self {
            shared,
            enabled,
            handle: Some(handle),
        }
    }

    pub fn enable(&self) {
        *self.enabled.lock().expect("async log writer poisoned") = true;
    }

    pub fn disable(&self) {
        *self.enabled.lock().expect("async log writer poisoned") = false;
    }

    /// Writes `bytes` to `fd`. Synchronous (with bounded partial-write
    /// retry) when disabled; otherwise queues a copy and wakes the worker.
    pub fn write(&self, fd: RawFd, bytes: &[u8]) -> io::Result<()> {
        let enabled = *self.enabled.lock().expect("async log writer poisoned");
        if !enabled {
            return write_all_retrying(fd, bytes);
        }
        let mut intake = self.shared.intake.lock().expect("async log writer poisoned");
        intake.push(Task {
            fd,
            data: bytes.to_vec(),
        });
        drop(intake);
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Signals shutdown and blocks until the worker has drained both the
    /// active and intake lists.
    pub fn shutdown(&mut self) {
        *self.shared.shutdown.lock().expect("async log writer poisoned") = true;
        self.shared.cond.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncLogWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let tasks = {
            let mut intake = shared.intake.lock().expect("async log writer poisoned");
            while intake.is_empty() && !*shared.shutdown.lock().expect("async log writer poisoned") {
                intake = shared
                    .cond
                    .wait_timeout(intake, Duration::from_millis(500))
                    .expect("async log writer poisoned")
                    .0;
            }
            std::mem::take(&mut *intake)
        };

        for task in tasks {
            let _ = write_all_retrying(task.fd, &task.data);
        }

        let done = *shared.shutdown.lock().expect("async log writer poisoned");
        let empty = shared
            .intake
            .lock()
            .expect("async log writer poisoned")
            .is_empty();
        if done && empty {
            break;
        }
    }
}

const MAX_PARTIAL_WRITE_RETRIES: usize = 8;

/// Best-effort, bounded-retry `write(2)` loop shared by the synchronous
/// fallback above and the driver's direct error-reply path (§4.11): both
/// write a handful of bytes to a socket that might be in the middle of
/// closing, and neither can afford to block indefinitely on it.
pub(crate) fn write_all_retrying(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
    if fd < 0 {
        return Ok(());
    }
    let mut retries = 0;
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            if err.kind() == ErrorKind::WouldBlock && retries < MAX_PARTIAL_WRITE_RETRIES {
                retries += 1;
                std::thread::yield_now();
                continue;
            }
            return Err(err);
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

/// Builds the synthetic access-log record (§4.11, §4.9): a small
/// `(method, url, status, bytes)` tuple serialized the same way regardless
/// of whether a worker or the driver thread produced it.
pub fn synthetic_access_log(method: &str, url: &str, status: u16, bytes: usize) -> Vec<u8> {
    format!("{method} {url} {status} {bytes}\n").into_bytes()
}

/// Minimal `HTTP/1.0` direct-reply status line (§4.11): no body, a bare
/// `Retry-After` when the caller has one (503 only). This is the only HTTP
/// the driver thread ever writes itself — everything else goes through
/// `WriterLoop`.
pub fn direct_reply(status: u16, reason_phrase: &str, retry_after: Option<u32>) -> Vec<u8> {
    let mut out = format!("HTTP/1.0 {status} {reason_phrase}\r\n");
    if let Some(secs) = retry_after {
        out.push_str(&format!("Retry-After: {secs}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek};

    #[test]
    fn synchronous_write_when_disabled() {
        let mut writer = AsyncLogWriter::start();
        writer.disable();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(tmp.as_file());
        writer.write(fd, b"hello\n").unwrap();
        let mut contents = String::new();
        tmp.as_file_mut().seek(std::io::SeekFrom::Start(0)).unwrap();
        tmp.as_file_mut().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn async_write_drains_on_shutdown() {
        let mut writer = AsyncLogWriter::start();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(tmp.as_file());
        writer.write(fd, b"one\n").unwrap();
        writer.write(fd, b"two\n").unwrap();
        writer.shutdown();

        let mut contents = String::new();
        let mut f = std::fs::File::open(tmp.path()).unwrap();
        f.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test]
    fn synthetic_access_log_matches_tuple_shape() {
        let line = synthetic_access_log("GET", "/x", 413, 0);
        assert_eq!(line, b"GET /x 413 0\n");
    }

    #[test]
    fn direct_reply_is_minimal_http10() {
        let reply = direct_reply(400, "Bad Request", None);
        assert_eq!(reply, b"HTTP/1.0 400 Bad Request\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn direct_reply_carries_retry_after_for_503() {
        let reply = direct_reply(503, "Service Unavailable", Some(5));
        let text = String::from_utf8(reply).unwrap();
        assert!(text.starts_with("HTTP/1.0 503 Service Unavailable\r\n"));
        assert!(text.contains("Retry-After: 5\r\n"));
    }
}
