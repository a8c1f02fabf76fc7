//! `RequestBuffer` and its pool (§3, §4.2): the growable per-connection
//! parse buffer `HttpParser` reads and decodes into, plus the small state
//! machine around what has been parsed out of it so far.
//!
//! Generalized from `http/request.rs`'s `HttpRequest` (`buffer`, `cursor`,
//! `state`, `chunk_state`, `headers: HashMap<String, String>`) into a
//! pooled, offset-tracked buffer decoupled from any one connection.

use crate::http_parser::Method;
use crate::prelude::*;

const POOL_MAX_BUFFER: usize = 64 * 1024;
const DEFAULT_HEADER_CAPACITY: usize = 10;

/// Recognized singleton headers (§4.5): extracted once into a fixed slot
/// array instead of looked up by name on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Singleton {
    Authorization,
    ContentLength,
    Expect,
    Host,
}

impl Singleton {
    pub const ALL: [Singleton; 4] = [
        Singleton::Authorization,
        Singleton::ContentLength,
        Singleton::Expect,
        Singleton::Host,
    ];

    fn index(self) -> usize {
        match self {
            Singleton::Authorization => 0,
            Singleton::ContentLength => 1,
            Singleton::Expect => 2,
            Singleton::Host => 3,
        }
    }

    /// The lexicographically sorted table from §4.5. Anything not in this
    /// list is an ordinary (repeatable) header.
    pub fn lookup(name: &str) -> Option<Singleton> {
        match name {
            "authorization" => Some(Singleton::Authorization),
            "content-length" => Some(Singleton::ContentLength),
            "expect" => Some(Singleton::Expect),
            "host" => Some(Singleton::Host),
            _ => None,
        }
    }
}

/// The other entries in §4.5's sorted table that are singleton-checked but
/// not extracted into a fixed slot (no component below needs fast access
/// to them — they're validated for duplicates and otherwise left in the
/// ordinary header multimap).
pub const SINGLETON_CHECK_ONLY: &[&str] = &[
    "content-type",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "origin",
    "upgrade",
    "user-agent",
];

#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub url: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub query: Option<String>,
    pub fragment: Option<String>,
    pub version: (u8, u8),
}

/// The growable byte buffer plus parser offsets from §3.
pub struct RequestBuffer {
    pub data: Vec<u8>,
    /// Next byte to parse.
    pub read_off: usize,
    /// Next byte to fill.
    pub write_off: usize,
    /// Start of the body, once headers are fully parsed. `0` beforehand
    /// (invariant 3, §3).
    pub content_off: usize,
    /// Expected total body length once known.
    pub length: Option<usize>,
    pub content_length: Option<usize>,
    /// `X-Expected-Entity-Length` hint for chunked termination.
    pub expected_length: Option<usize>,
    /// `0` unless chunked decoding is active (invariant 4, §3).
    pub chunk_start_off: usize,
    pub chunk_write_off: usize,
    /// Byte overwritten by a NUL terminator, restored on buffer reuse.
    pub saved_char: Option<u8>,
    pub request_line: Option<RequestLine>,
    pub headers: Vec<(String, String)>,
    pub trailers: Vec<(String, String)>,
    pub auth: Option<String>,
    singletons: [Option<String>; 4],
}

impl RequestBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            read_off: 0,
            write_off: 0,
            content_off: 0,
            length: None,
            content_length: None,
            expected_length: None,
            chunk_start_off: 0,
            chunk_write_off: 0,
            saved_char: None,
            request_line: None,
            headers: Vec::with_capacity(DEFAULT_HEADER_CAPACITY),
            trailers: Vec::new(),
            auth: None,
            singletons: [None, None, None, None],
        }
    }

    /// Bytes available to the parser: `avail = write_off - read_off`
    /// (invariant 2, §3).
    pub fn avail(&self) -> usize {
        self.write_off - self.read_off
    }

    pub fn unparsed(&self) -> &[u8] {
        &self.data[self.read_off..self.write_off]
    }

    /// Appends freshly-read bytes, growing the backing `Vec` as needed.
    pub fn fill(&mut self, bytes: &[u8]) {
        if self.write_off + bytes.len() > self.data.len() {
            self.data.resize(self.write_off + bytes.len(), 0);
        }
        self.data[self.write_off..self.write_off + bytes.len()].copy_from_slice(bytes);
        self.write_off += bytes.len();
    }

    pub fn set_singleton(&mut self, which: Singleton, value: String) {
        self.singletons[which.index()] = Some(value);
    }

    pub fn singleton(&self, which: Singleton) -> Option<&str> {
        self.singletons[which.index()].as_deref()
    }

    pub fn has_singleton(&self, which: Singleton) -> bool {
        self.singletons[which.index()].is_some()
    }

    /// Drains bytes already consumed by a completed request, shifting any
    /// pipelined leftover to the front and resetting offsets so the buffer
    /// is ready to parse the next request on the same connection.
    pub fn finish_request(&mut self) {
        let leftover = self.write_off - self.read_off;
        if leftover > 0 {
            self.data.copy_within(self.read_off..self.write_off, 0);
        }
        self.data.truncate(leftover);
        self.read_off = 0;
        self.write_off = leftover;
        self.content_off = 0;
        self.length = None;
        self.content_length = None;
        self.expected_length = None;
        self.chunk_start_off = 0;
        self.chunk_write_off = 0;
        self.saved_char = None;
        self.request_line = None;
        self.headers.clear();
        self.trailers.clear();
        self.auth = None;
        self.singletons = [None, None, None, None];
    }

    /// Whether pipelined bytes from a subsequent request already arrived.
    pub fn has_pipelined_data(&self) -> bool {
        self.write_off > self.read_off
    }

    /// Shifts out body bytes already flushed to a spool file, so a large
    /// upload doesn't keep its whole read-ahead resident in memory.
    /// `content_off` is left untouched (still nonzero, per invariant 3) —
    /// only the window after it collapses.
    pub(crate) fn compact_body(&mut self) {
        if self.read_off == self.content_off {
            return;
        }
        let leftover = self.write_off - self.read_off;
        self.data.copy_within(self.read_off..self.write_off, self.content_off);
        self.data.truncate(self.content_off + leftover);
        self.read_off = self.content_off;
        self.write_off = self.content_off + leftover;
    }

    fn is_oversized(&self) -> bool {
        self.data.capacity() > POOL_MAX_BUFFER
    }
}

/// Recyclable buffer pool (§4.2). A single mutex is sufficient: the
/// uncontended common path is one lock/unlock per accepted connection, and
/// sharding would add complexity no measured workload here needs (§9).
pub struct RequestBufferPool {
    free: Mutex<Vec<RequestBuffer>>,
}

impl Default for RequestBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Returns a recycled buffer if one is free, otherwise allocates fresh.
    pub fn take(&self) -> RequestBuffer {
        let mut free = self.free.lock().expect("request buffer pool poisoned");
        free.pop().unwrap_or_else(RequestBuffer::new)
    }

    /// Returns a finished buffer to the pool. Buffers larger than 64 KiB
    /// are dropped instead of pooled (invariant 7, §3) — holding onto an
    /// oversized buffer after one large upload would waste memory for
    /// every future ordinary connection that recycles it.
    pub fn put(&self, mut buf: RequestBuffer) {
        if buf.is_oversized() {
            return;
        }
        buf.finish_request();
        buf.data.clear();
        buf.write_off = 0;
        let mut free = self.free.lock().expect("request buffer pool poisoned");
        free.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_advances_write_off_and_avail() {
        let mut buf = RequestBuffer::new();
        buf.fill(b"GET / HTTP/1.1\r\n");
        assert_eq!(buf.write_off, 16);
        assert_eq!(buf.avail(), 16);
    }

    #[test]
    fn finish_request_preserves_pipelined_leftover() {
        let mut buf = RequestBuffer::new();
        buf.fill(b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n");
        buf.read_off = 18; // pretend the first request was fully consumed
        buf.finish_request();
        assert_eq!(buf.read_off, 0);
        assert_eq!(buf.avail(), buf.write_off);
        assert!(buf.has_pipelined_data());
        assert_eq!(&buf.data[..buf.write_off], b"GET /next HTTP/1.1\r\n".as_slice());
    }

    #[test]
    fn pool_round_trips_a_buffer() {
        let pool = RequestBufferPool::new();
        let mut buf = pool.take();
        buf.fill(b"hello");
        pool.put(buf);
        let recycled = pool.take();
        assert_eq!(recycled.write_off, 0);
    }

    #[test]
    fn pool_drops_oversized_buffers_instead_of_pooling() {
        let pool = RequestBufferPool::new();
        let mut buf = pool.take();
        buf.data.reserve(POOL_MAX_BUFFER + 1);
        buf.fill(&vec![0u8; 1]);
        pool.put(buf);
        // Nothing was pooled; take() allocates a fresh buffer again.
        let fresh = pool.take();
        assert_eq!(fresh.data.capacity(), 0);
    }

    #[test]
    fn singleton_slots_round_trip() {
        let mut buf = RequestBuffer::new();
        assert!(!buf.has_singleton(Singleton::Host));
        buf.set_singleton(Singleton::Host, "example.com".to_string());
        assert_eq!(buf.singleton(Singleton::Host), Some("example.com"));
    }
}
