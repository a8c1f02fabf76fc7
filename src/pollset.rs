//! `PollSet` (§4.1): a growable, slab-indexed registration of raw fds
//! against a single `mio::Poll`, tracking the running minimum absolute
//! deadline across every registered entry — the value `DriverLoop`/
//! `WriterLoop`/`SpoolerLoop` turn into the next `poll` timeout.
//!
//! Unlike the source design's fixed `struct pollfd` array, registration
//! itself is owned by the OS poller (epoll/kqueue via `mio`); this type
//! only keeps the slab bookkeeping (stable indices, freed/reused slots,
//! per-entry deadline) that the rest of the driver core addresses sockets
//! by.

use crate::prelude::*;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use std::collections::HashMap;
use std::os::unix::io::RawFd;

const GROWTH_STEP: usize = 100;

struct Entry {
    fd: RawFd,
    deadline: Option<Instant>,
}

/// Readiness observed for one registered index during the last `wait()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
}

pub struct PollSet {
    poll: mio::Poll,
    events: mio::Events,
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    last_ready: HashMap<usize, Readiness>,
}

impl PollSet {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(capacity.max(GROWTH_STEP)),
            entries: Vec::new(),
            free: Vec::new(),
            last_ready: HashMap::new(),
        })
    }

    pub fn waker(&self, token: Token) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), token)
    }

    /// Deregisters every entry and empties the slab. Called at the top of
    /// each loop iteration before the fresh set of fds for this pass is
    /// re-added (§4.6 step 1: "Rebuild PollSet").
    pub fn reset(&mut self) {
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot.take() {
                let mut source = SourceFd(&entry.fd);
                let _ = self.poll.registry().deregister(&mut source);
            }
        }
        self.entries.clear();
        self.free.clear();
        self.last_ready.clear();
    }

    /// Grows the backing array in steps of `GROWTH_STEP` as the source
    /// design does; with a slab the growth only affects `Vec` capacity,
    /// not the live OS registration.
    pub fn add(
        &mut self,
        fd: RawFd,
        interest: Interest,
        deadline: Option<Instant>,
    ) -> io::Result<usize> {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                if self.entries.len() % GROWTH_STEP == 0 {
                    self.entries.reserve(GROWTH_STEP);
                }
                self.entries.push(None);
                self.entries.len() - 1
            }
        };
        let mut source = SourceFd(&fd);
        self.poll
            .registry()
            .register(&mut source, Token(index), interest)?;
        self.entries[index] = Some(Entry { fd, deadline });
        Ok(index)
    }

    pub fn min_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .flatten()
            .filter_map(|e| e.deadline)
            .min()
    }

    /// Relative timeout from the running minimum deadline, rounded up by a
    /// millisecond so a deadline a sub-millisecond away is never reported
    /// as already elapsed, and capped at `max`.
    pub fn timeout(&self, now: Instant, max: Duration) -> Duration {
        match self.min_deadline() {
            None => max,
            Some(d) => {
                if d <= now {
                    Duration::ZERO
                } else {
                    (d - now + Duration::from_millis(1)).min(max)
                }
            }
        }
    }

    /// Polls once. `EINTR` is retried transparently; any other error is
    /// fatal and propagated to the caller.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.last_ready.clear();
        let mut n = 0;
        for ev in self.events.iter() {
            self.last_ready.insert(
                ev.token().0,
                Readiness {
                    readable: ev.is_readable(),
                    writable: ev.is_writable(),
                    hup: ev.is_read_closed() || ev.is_write_closed(),
                    error: ev.is_error(),
                },
            );
            n += 1;
        }
        Ok(n)
    }

    pub fn ready(&self, index: usize) -> Readiness {
        self.last_ready.get(&index).copied().unwrap_or_default()
    }

    pub fn is_in(&self, index: usize) -> bool {
        self.ready(index).readable
    }

    pub fn is_out(&self, index: usize) -> bool {
        self.ready(index).writable
    }

    pub fn is_hup(&self, index: usize) -> bool {
        self.ready(index).hup
    }

    pub fn registered(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_capped_and_floored_at_zero() {
        let ps = PollSet::new(4).unwrap();
        let now = Instant::now();
        assert_eq!(ps.timeout(now, Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn add_reuses_freed_slots_after_reset() {
        let mut ps = PollSet::new(4).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&listener);
        let i0 = ps.add(fd, Interest::READABLE, None).unwrap();
        assert_eq!(i0, 0);
        ps.reset();
        let i1 = ps.add(fd, Interest::READABLE, None).unwrap();
        assert_eq!(i1, 0);
    }
}
