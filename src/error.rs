//! The driver core's single error currency.
//!
//! Every release path (`SockSlab::release`, `DriverLoop`, `SpoolerLoop`,
//! `WriterLoop`) ends up with a `Reason`, whether it originated from a
//! syscall failure, a parse error, or an explicit protocol decision (queue
//! full, entity too large). `Reason` carries enough information to pick the
//! direct-reply status code (§4.11, §7) and whether the event is worth a log
//! line.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;

use parser::YamlError;

/// Error taxonomy. Ordered roughly as the source's negative reason codes:
/// peer-driven closes first, then timeouts, then syscall failures, then
/// protocol-level rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Peer EOF. Drop silently.
    Close,
    /// Drain-phase (close list) timeout.
    CloseTimeout,
    /// Input deadline passed while waiting for more request bytes.
    ReadTimeout,
    /// `sendwait` passed while the writer waited for POLLOUT.
    WriteTimeout,
    /// `recv`/`read` syscall failed.
    ReadError(String),
    /// `send`/`write` syscall failed.
    WriteError(String),
    /// `shutdown` syscall failed.
    ShutError(String),
    /// Unparseable request line or a duplicate singleton header.
    BadRequest(String),
    /// Malformed header, or HTTP/1.1 with no resolvable `Host`.
    BadHeader(String),
    /// Header count exceeded `maxheaders`.
    TooManyHeaders,
    /// Declared or observed body length exceeded `maxinput`.
    EntityTooLarge,
    /// The worker pool refused the socket.
    QueueFull { retry_after: Option<u32> },
}

impl Reason {
    /// Status line sent on the direct-reply path, if any. Timeouts, closes
    /// and syscall failures get no reply: the peer is already gone or the
    /// connection is beyond saving.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Reason::BadRequest(_) | Reason::BadHeader(_) => Some(400),
            Reason::TooManyHeaders => Some(414),
            Reason::EntityTooLarge => Some(413),
            Reason::QueueFull { .. } => Some(503),
            _ => None,
        }
    }

    /// Whether releasing with this reason is worth a log line. Close and
    /// CloseTimeout are the routine end of a connection's life.
    pub fn should_log(&self) -> bool {
        !matches!(self, Reason::Close | Reason::CloseTimeout)
    }

    pub fn retry_after(&self) -> Option<u32> {
        match self {
            Reason::QueueFull { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Reason phrase for the direct-reply status line (§4.11).
    pub fn status_text(&self) -> &'static str {
        match self.http_status() {
            Some(400) => "Bad Request",
            Some(413) => "Request Entity Too Large",
            Some(414) => "Request-URI Too Long",
            Some(503) => "Service Unavailable",
            _ => "Error",
        }
    }

    pub fn read_error(e: io::Error) -> Reason {
        Reason::ReadError(e.to_string())
    }

    pub fn write_error(e: io::Error) -> Reason {
        Reason::WriteError(e.to_string())
    }

    pub fn shut_error(e: io::Error) -> Reason {
        Reason::ShutError(e.to_string())
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Close => write!(f, "close"),
            Reason::CloseTimeout => write!(f, "close timeout"),
            Reason::ReadTimeout => write!(f, "read timeout"),
            Reason::WriteTimeout => write!(f, "write timeout"),
            Reason::ReadError(e) => write!(f, "read error: {e}"),
            Reason::WriteError(e) => write!(f, "write error: {e}"),
            Reason::ShutError(e) => write!(f, "shutdown error: {e}"),
            Reason::BadRequest(e) => write!(f, "bad request: {e}"),
            Reason::BadHeader(e) => write!(f, "bad header: {e}"),
            Reason::TooManyHeaders => write!(f, "too many headers"),
            Reason::EntityTooLarge => write!(f, "entity too large"),
            Reason::QueueFull { .. } => write!(f, "queue full"),
        }
    }
}

impl Error for Reason {}

/// Default mapping for call sites that don't know yet whether the failing
/// syscall was a read or a write; prefer `Reason::read_error`/`write_error`/
/// `shut_error` when the direction is known.
impl From<io::Error> for Reason {
    fn from(e: io::Error) -> Self {
        Reason::ReadError(e.to_string())
    }
}

impl From<YamlError> for Reason {
    fn from(e: YamlError) -> Self {
        Reason::BadRequest(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Reason>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy_table() {
        assert_eq!(Reason::BadRequest("x".into()).http_status(), Some(400));
        assert_eq!(Reason::BadHeader("x".into()).http_status(), Some(400));
        assert_eq!(Reason::TooManyHeaders.http_status(), Some(414));
        assert_eq!(Reason::EntityTooLarge.http_status(), Some(413));
        assert_eq!(
            Reason::QueueFull { retry_after: Some(5) }.http_status(),
            Some(503)
        );
        assert_eq!(Reason::Close.http_status(), None);
        assert_eq!(Reason::ReadTimeout.http_status(), None);
    }

    #[test]
    fn close_and_close_timeout_are_silent() {
        assert!(!Reason::Close.should_log());
        assert!(!Reason::CloseTimeout.should_log());
        assert!(Reason::ReadTimeout.should_log());
        assert!(Reason::BadRequest("x".into()).should_log());
    }

    #[test]
    fn queue_full_carries_retry_after() {
        let r = Reason::QueueFull { retry_after: Some(7) };
        assert_eq!(r.retry_after(), Some(7));
        assert_eq!(Reason::Close.retry_after(), None);
    }
}
