//! Single-threaded readiness multiplexer.
//!
//! Wraps a `mio::Poll` with one `SourceFd` registration per endpoint
//! (token = peer pid) and a `signal-hook-mio` source for SIGCHLD plus the
//! urgent signal. Signals interrupt the kernel wait and surface as
//! ordinary wake events between dispatches; nothing runs inside a raw
//! signal handler.

use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::Signal;
use signal_hook::consts::SIGCHLD;
use signal_hook_mio::v0_8::Signals;

const SIGNAL_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// One readiness fact. Per-fd, readable is reported before writable so
/// an EOF is observed before a doomed write is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Readable(u32),
    Writable(u32),
    Signal(i32),
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    signals: Signals,
}

impl Reactor {
    /// Build a fresh multiplexer. The child rebuilds one after fork so
    /// that inherited registrations cannot duplicate callbacks; dropping
    /// the old instance unhooks its signal plumbing in the child.
    pub(crate) fn new(urgent: Signal) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut signals = Signals::new([SIGCHLD, urgent as libc::c_int])?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            signals,
        })
    }

    pub(crate) fn register_endpoint(&self, fd: RawFd, pid: u32) -> io::Result<()> {
        self.poll.registry().register(
            &mut SourceFd(&fd),
            Token(pid as usize),
            Interest::READABLE,
        )
    }

    /// Add or drop write interest, keeping read interest in place.
    pub(crate) fn set_writer(&self, fd: RawFd, pid: u32, want_write: bool) -> io::Result<()> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(pid as usize), interest)
    }

    pub(crate) fn deregister_endpoint(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Wait for readiness. `None` blocks until at least one event fires;
    /// `Some(t)` returns after `t` at the latest. An interrupted wait is
    /// not an error: pending signals are picked up through the signal
    /// source on the next call.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Wake>> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut wakes = Vec::new();
        for event in &self.events {
            if event.token() == SIGNAL_TOKEN {
                for signal in self.signals.pending() {
                    wakes.push(Wake::Signal(signal));
                }
            } else {
                let pid = event.token().0 as u32;
                if event.is_readable() || event.is_read_closed() {
                    wakes.push(Wake::Readable(pid));
                }
                if event.is_writable() {
                    wakes.push(Wake::Writable(pid));
                }
            }
        }
        Ok(wakes)
    }
}
