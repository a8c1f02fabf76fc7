//! Connection I/O driver core for an HTTP application server: listens,
//! accepts, reads and parses HTTP/1.x requests (with chunked decoding and
//! temp-file spooling for large bodies), dispatches ready requests to a
//! connection-worker pool, and asynchronously streams responses back with
//! per-pool bandwidth shaping and keep-alive lifecycle management.
//!
//! Out of scope (§1): the embedded script interpreter, the request
//! handler/URL-space dispatch, the access-log *format*, TLS library
//! integration, and the worker-thread pool implementation itself — this
//! crate only specifies the `dispatch::WorkerPool` contract toward it.

pub mod async_log;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod driver_loop;
pub mod error;
pub mod host_map;
pub mod http_parser;
pub mod pollset;
pub mod prelude;
pub mod request_buffer;
pub mod sock;
pub mod spooler;
pub mod writer;

pub use config::DriverOptions;
pub use dispatch::WorkerPool;
pub use driver::{Driver, DriverInfo, DriverRegistry};
pub use error::{Reason, Result};
