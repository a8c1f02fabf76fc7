//! `Dispatch` (§4.10): resolves the `VHostBinding` for a ready `Sock` and
//! hands it to the worker pool, translating the pool's back-pressure
//! signal into a release reason or a park-for-retry decision.
//!
//! The worker pool itself is out of scope (§1); `WorkerPool` is the
//! `enqueue`/`add_bytes_sent`/`ensure_running` contract §6 describes.

use crate::host_map::HostMap;
use crate::prelude::*;
use crate::sock::Sock;

/// §6 "Worker-pool contract". Implemented by whatever connection-worker
/// pool the embedding application provides; this crate only calls through
/// the trait.
pub trait WorkerPool: Send + Sync {
    /// Takes ownership of `sock` on success; hands it back on `Timeout`/
    /// `Error` so the caller can park or release it (§4.10).
    fn enqueue(&self, sock: Sock, now: Instant) -> EnqueueResult;
    fn add_bytes_sent(&self, pool: &str, n: usize);
    fn allocate_thread_slot(&self, pool: &str, thread_id: usize) -> usize;
    fn total_rate(&self, pool: &str, slot_id: usize, current_rate: f64) -> (f64, usize);
    fn ensure_running(&self, server: &str, reason: &str);
    fn default_pool(&self, server: &str) -> String;
    /// Retry window the pool advertises for a 503 reply, if any (§4.11).
    fn retry_after(&self, pool: &str) -> Option<u32> {
        let _ = pool;
        None
    }
}

pub enum EnqueueResult {
    Ok,
    Timeout(Sock),
    Error(Sock),
}

pub enum DispatchOutcome {
    Queued,
    Parked(Sock),
    Released { sock: Sock, reason: Reason },
}

/// §4.10 `queue(sock, now)`. Host-header resolution happens here rather
/// than in `HttpParser` so the same code path serves both `DriverLoop`'s
/// inline ready sockets and `SpoolerLoop`'s handed-off ones (§4.7).
pub fn queue(
    mut sock: Sock,
    hosts: &HostMap,
    default_port: u16,
    listen_ports: &[u16],
    pool: &dyn WorkerPool,
    now: Instant,
) -> DispatchOutcome {
    if sock.vhost.is_none() {
        let host_header = sock
            .request_buffer
            .as_ref()
            .and_then(|b| b.request_line.as_ref())
            .and_then(|rl| rl.host.clone());

        let binding = host_header
            .as_deref()
            .and_then(|h| hosts.lookup(h, default_port, listen_ports))
            .or_else(|| hosts.default_binding());

        match binding {
            Some(b) => {
                sock.location = Some(b.location.clone());
                sock.vhost = Some(b.clone());
            }
            None => {
                let is_http11 = sock
                    .request_buffer
                    .as_ref()
                    .and_then(|b| b.request_line.as_ref())
                    .map(|rl| rl.version >= (1, 1))
                    .unwrap_or(false);
                if is_http11 && host_header.is_none() {
                    return DispatchOutcome::Released {
                        sock,
                        reason: Reason::BadHeader("no Host header to resolve".into()),
                    };
                }
                // Fall through with no vhost; the worker pool's default
                // server handles it (§4.4 step 4).
            }
        }
    }

    let server = sock
        .vhost
        .as_ref()
        .map(|v| v.server_ref.clone())
        .unwrap_or_default();
    let pool_name = pool.default_pool(&server);

    match pool.enqueue(sock, now) {
        EnqueueResult::Ok => DispatchOutcome::Queued,
        EnqueueResult::Timeout(sock) => DispatchOutcome::Parked(sock),
        EnqueueResult::Error(sock) => DispatchOutcome::Released {
            sock,
            reason: Reason::QueueFull {
                retry_after: pool.retry_after(&pool_name),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::test_support::bare_sock;
    use std::sync::Mutex;

    struct FakePool {
        verdict: Mutex<Option<Box<dyn FnMut(Sock) -> EnqueueResult + Send>>>,
    }

    impl WorkerPool for FakePool {
        fn enqueue(&self, sock: Sock, _now: Instant) -> EnqueueResult {
            (self.verdict.lock().unwrap().as_mut().unwrap())(sock)
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
        fn retry_after(&self, _pool: &str) -> Option<u32> {
            Some(5)
        }
    }

    #[test]
    fn missing_host_on_http11_is_released_as_bad_header() {
        let mut sock = bare_sock();
        let mut buf = crate::request_buffer::RequestBuffer::new();
        buf.request_line = Some(crate::request_buffer::RequestLine {
            method: crate::http_parser::Method::Get,
            url: "/".into(),
            host: None,
            port: None,
            query: None,
            fragment: None,
            version: (1, 1),
        });
        sock.request_buffer = Some(buf);
        let hosts = HostMap::new();
        let pool = FakePool {
            verdict: Mutex::new(Some(Box::new(|s| EnqueueResult::Error(s)))),
        };
        match queue(sock, &hosts, 80, &[80], &pool, Instant::now()) {
            DispatchOutcome::Released { reason, .. } => {
                assert!(matches!(reason, Reason::BadHeader(_)));
            }
            _ => panic!("expected a release"),
        }
    }

    #[test]
    fn queue_full_carries_pool_retry_after() {
        let sock = bare_sock();
        let hosts = HostMap::new();
        let pool = FakePool {
            verdict: Mutex::new(Some(Box::new(|s| EnqueueResult::Error(s)))),
        };
        match queue(sock, &hosts, 80, &[80], &pool, Instant::now()) {
            DispatchOutcome::Released { reason, .. } => {
                assert_eq!(reason.retry_after(), Some(5));
            }
            _ => panic!("expected a release"),
        }
    }

    #[test]
    fn timeout_parks_the_socket_instead_of_releasing() {
        let sock = bare_sock();
        let hosts = HostMap::new();
        let pool = FakePool {
            verdict: Mutex::new(Some(Box::new(|s| EnqueueResult::Timeout(s)))),
        };
        match queue(sock, &hosts, 80, &[80], &pool, Instant::now()) {
            DispatchOutcome::Parked(_) => {}
            _ => panic!("expected a park"),
        }
    }
}
