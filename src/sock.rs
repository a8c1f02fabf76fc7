//! `Sock` (§3) and `SockSlab` (§4.3): per-connection state and the
//! driver-owned free-list that recycles it.
//!
//! Generalized from `http/http_connection.rs`'s `HttpConnection` (one struct
//! per accepted `TcpStream`, owned by `Server::connections: HashMap<Token,
//! HttpConnection>`) into a slab-indexed struct whose lifecycle is exactly
//! one of the owning lists named in §3's invariant 1, rather than a hash map
//! entry removed/inserted by `terminate_connection`.

use crate::host_map::VHostBinding;
use crate::prelude::*;
use crate::request_buffer::RequestBuffer;
use std::ffi::OsString;
use std::net::IpAddr;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::RawFd;

/// Tri-state keep-alive decision (§3): undecided until headers/response are
/// both known, then fixed for the rest of the connection's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepState {
    Unknown,
    Yes,
    No,
}

/// Per-connection flags (§3). A plain `bool` struct rather than a bitset:
/// nothing here is sent over the wire or needs to be packed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SockFlags {
    pub entity_too_large: bool,
    pub continue_pending: bool,
    pub zip_accepted: bool,
    pub brotli_accepted: bool,
    pub request_uri_too_long: bool,
    pub line_too_long: bool,
    pub sent_via_writer: bool,
    pub closed: bool,
    pub stream: bool,
}

/// Where body bytes are landing (§4.5 "Body placement policy"). `Spool`
/// covers both the managed-temp-fd/mmap case and the persistent
/// `maxupload`-triggered spool file; `persists` distinguishes them since
/// only the latter survives past the request (§6 "Filesystem").
#[derive(Debug, Default)]
pub enum BodyPlacement {
    #[default]
    Undecided,
    Memory,
    Spool {
        persists: bool,
    },
}

/// A memory-mapped, read-only view of a completed spool file's body
/// (invariant 5, §3). Built with `libc::mmap` directly — the workspace pulls
/// in `libc` already (its CGI pipe plumbing) and nothing else in the pack
/// reaches for a dedicated mmap crate.
pub struct MappedBody {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is read-only and never mutated after creation; sharing the
// pointer across threads (writer <-> driver) is safe on that basis.
unsafe impl Send for MappedBody {}
unsafe impl Sync for MappedBody {}

impl MappedBody {
    /// Maps the first `len` bytes of `fd` read-only. `len` should include
    /// the trailing NUL byte the parser appends (§6 "Wire behavior").
    pub fn new(fd: RawFd, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
        }
    }
}

impl Drop for MappedBody {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

/// Opens a fresh spool file under `opts.uploadpath` (§6 "Filesystem":
/// template `<uploadpath>/<sock>.XXXXXX`) via `mkstemp`, the same
/// "ask the kernel for a unique name" idiom this module already uses
/// `libc` for directly elsewhere (`MappedBody`'s mmap).
pub fn open_spool_file(opts: &DriverOptions) -> io::Result<(RawFd, PathBuf)> {
    let mut template = format!("{}/sock.XXXXXX", opts.uploadpath).into_bytes();
    template.push(0);
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    template.pop();
    Ok((fd, PathBuf::from(OsString::from_vec(template))))
}

/// Per-connection state (§3). Exclusively owned, at any instant, by exactly
/// one of: the driver free-list, the driver's read/close list, a spooler
/// queue, a writer queue, or the worker pool (invariant 1).
pub struct Sock {
    pub fd: RawFd,
    pub remote_addr: Option<SocketAddr>,
    pub forwarded_for: Option<IpAddr>,
    pub trusted_proxies: Vec<String>,
    pub vhost: Option<VHostBinding>,
    pub location: Option<String>,
    pub accept_time: Instant,
    pub deadline: Option<Instant>,
    pub poll_index: Option<usize>,
    pub request_buffer: Option<RequestBuffer>,
    pub body: BodyPlacement,
    pub spool_fd: Option<RawFd>,
    pub spool_path: Option<PathBuf>,
    /// Body bytes already flushed to `spool_fd` for the in-progress request.
    pub spool_written: usize,
    pub mapped_body: Option<MappedBody>,
    pub flags: SockFlags,
    pub keep: KeepState,
}

impl Sock {
    fn fresh(fd: RawFd) -> Self {
        Self {
            fd,
            remote_addr: None,
            forwarded_for: None,
            trusted_proxies: Vec::new(),
            vhost: None,
            location: None,
            accept_time: Instant::now(),
            deadline: None,
            poll_index: None,
            request_buffer: None,
            body: BodyPlacement::Undecided,
            spool_fd: None,
            spool_path: None,
            spool_written: 0,
            mapped_body: None,
            flags: SockFlags::default(),
            keep: KeepState::Unknown,
        }
    }

    /// Resets per-request state while keeping the fd/connection alive, for
    /// a keep-alive socket about to parse its next request.
    pub fn reset_for_next_request(&mut self) {
        let persists = matches!(self.body, BodyPlacement::Spool { persists: true });
        self.body = BodyPlacement::Undecided;
        self.spool_written = 0;
        self.mapped_body = None;
        if let Some(fd) = self.spool_fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(path) = self.spool_path.take() {
            if !persists {
                let _ = std::fs::remove_file(path);
            }
        }
        self.flags = SockFlags::default();
        self.keep = KeepState::Unknown;
    }
}

/// The driver's per-Sock free-list (§4.3). Sized generously up front since
/// `maxqueuesize` bounds how many can ever be in flight at once; beyond
/// that, fresh allocation is just as cheap as slab reuse in Rust.
pub struct SockSlab {
    free: Mutex<Vec<Sock>>,
}

impl Default for SockSlab {
    fn default() -> Self {
        Self::new()
    }
}

impl SockSlab {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self, fd: RawFd) -> Sock {
        let mut free = self.free.lock().expect("sock slab poisoned");
        match free.pop() {
            Some(mut sock) => {
                sock.fd = fd;
                sock.reset_for_next_request();
                sock.accept_time = Instant::now();
                sock.remote_addr = None;
                sock.vhost = None;
                sock.location = None;
                sock.request_buffer = None;
                sock
            }
            None => Sock::fresh(fd),
        }
    }

    /// Closes the underlying fd if still open, clears any temp file/mmap,
    /// and returns the `Sock` to the free-list. The caller is responsible
    /// for logging/replying based on `reason` (§4.11) before calling this.
    pub fn release(&self, mut sock: Sock, pool: &crate::request_buffer::RequestBufferPool) {
        if sock.fd >= 0 {
            unsafe {
                libc::close(sock.fd);
            }
            sock.fd = -1;
        }
        let persists = matches!(sock.body, BodyPlacement::Spool { persists: true });
        sock.mapped_body = None;
        if let Some(fd) = sock.spool_fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(path) = sock.spool_path.take() {
            if !persists {
                let _ = std::fs::remove_file(path);
            }
        }
        if let Some(buf) = sock.request_buffer.take() {
            pool.put(buf);
        }
        let mut free = self.free.lock().expect("sock slab poisoned");
        free.push(sock);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A `Sock` detached from any real fd, for parser unit tests that never
    /// touch the network.
    pub fn bare_sock() -> Sock {
        Sock::fresh(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_recycles_released_socks() {
        let slab = SockSlab::new();
        let pool = crate::request_buffer::RequestBufferPool::new();
        let sock = Sock::fresh(-1);
        slab.release(sock, &pool);
        let recycled = slab.take(-1);
        assert_eq!(recycled.keep, KeepState::Unknown);
    }

    #[test]
    fn reset_for_next_request_clears_flags_and_body() {
        let mut sock = Sock::fresh(-1);
        sock.flags.entity_too_large = true;
        sock.body = BodyPlacement::Memory;
        sock.reset_for_next_request();
        assert!(!sock.flags.entity_too_large);
        assert!(matches!(sock.body, BodyPlacement::Undecided));
    }
}
