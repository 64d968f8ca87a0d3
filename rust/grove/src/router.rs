//! Flood routing with split-horizon over the per-neighbour endpoints.
//!
//! The router owns every endpoint of the local process and decides, for
//! each frame, whether to deliver it locally, forward it, do both
//! (broadcast), or drop it. It never dispatches listeners itself: every
//! externally visible effect is returned as a [`RouterNotice`] and turned
//! into listener calls by the executor, which owns the listener set.

use std::collections::HashMap;
use std::os::unix::io::{OwnedFd, RawFd};

use bytes::Bytes;
use grove_wire::{Frame, DST_ALIAS, DST_BROADCAST, MAX_ALIAS_LEN, MAX_PAYLOAD_SIZE};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::endpoint::{Endpoint, FlushOrder};
use crate::error::{ErrorOp, RouterError};
use crate::event::{MessageEvent, UnsentFrame};
use crate::reactor::Reactor;

/// When listener callbacks fire relative to routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Fire only when the local process is the logical sender or the
    /// logical receiver. `on_message_sent` fires once per submission.
    #[default]
    ProcessContext,
    /// Additionally fire at every transit hop: forwarding a frame reports
    /// it received, flushing a forwarded copy reports it sent. Meant for
    /// tracing.
    RawContext,
}

/// Where a submission is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination<'a> {
    /// A specific process, direct neighbour or not.
    Pid(u32),
    /// Whichever process carries this alias.
    Alias(&'a str),
    /// Every process in the tree except the emitter.
    Broadcast,
}

/// Per-submission knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Mark the payload as an application-encoded blob. Forwarded
    /// unchanged; the library never interprets it.
    pub serialize: bool,
    /// Ask the recipient to send an ack frame back.
    pub request_ack: bool,
    /// Signal the next hop after the frame is flushed.
    pub urgent: bool,
}

/// Snapshot of one endpoint's counters.
#[derive(Debug, Clone)]
pub struct EndpointDiagnostics {
    pub pid: u32,
    pub queued: usize,
    pub tx_frames: u64,
    pub rx_frames: u64,
}

/// Snapshot of the router state, for inspection and tests.
#[derive(Debug, Clone)]
pub struct RouterDiagnostics {
    pub pid: u32,
    pub alias: Option<String>,
    /// Locally originated ids still being transmitted.
    pub in_flight_submissions: usize,
    pub endpoints: Vec<EndpointDiagnostics>,
}

/// An externally visible routing effect, dispatched by the executor.
#[derive(Debug)]
pub(crate) enum RouterNotice {
    Sent(MessageEvent),
    Received(MessageEvent),
    /// Received during the urgent drain; dispatched through
    /// `on_interrupt_receive`.
    Interrupted(MessageEvent),
    PeerShutdown { pid: u32, unsent: Vec<UnsentFrame> },
    Error(RouterError),
}

/// Tracks how many copies of a locally originated frame are still
/// queued, and whether `on_message_sent` already fired for it.
struct Emission {
    remaining: u32,
    fired: bool,
}

pub(crate) struct Router {
    pid: u32,
    alias: Option<String>,
    endpoints: HashMap<u32, Endpoint>,
    emissions: HashMap<u32, Emission>,
    interrupted: bool,
    mode: DispatchMode,
    urgent_signal: Signal,
    rng: StdRng,
}

impl Router {
    pub(crate) fn new(
        pid: u32,
        alias: Option<String>,
        mode: DispatchMode,
        urgent_signal: Signal,
    ) -> Self {
        Self {
            pid,
            alias,
            endpoints: HashMap::new(),
            emissions: HashMap::new(),
            interrupted: false,
            mode,
            urgent_signal,
            rng: StdRng::from_entropy(),
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Frames not yet fully on the wire, across all endpoints.
    pub(crate) fn pending(&self) -> usize {
        self.endpoints.values().map(Endpoint::pending_frames).sum()
    }

    pub(crate) fn diagnostics(&self) -> RouterDiagnostics {
        let mut endpoints: Vec<EndpointDiagnostics> = self
            .endpoints
            .values()
            .map(|ep| EndpointDiagnostics {
                pid: ep.pid(),
                queued: ep.pending_frames(),
                tx_frames: ep.tx_frames(),
                rx_frames: ep.rx_frames(),
            })
            .collect();
        endpoints.sort_by_key(|ep| ep.pid);
        RouterDiagnostics {
            pid: self.pid,
            alias: self.alias.clone(),
            in_flight_submissions: self.emissions.len(),
            endpoints,
        }
    }

    /// Register a new neighbour edge. The endpoint takes ownership of the
    /// descriptor and switches it to non-blocking mode.
    pub(crate) fn add_endpoint(
        &mut self,
        reactor: &Reactor,
        pid: u32,
        sock: OwnedFd,
    ) -> Result<(), RouterError> {
        if pid == self.pid {
            return Err(RouterError::Loopback { pid });
        }
        if self.endpoints.contains_key(&pid) {
            return Err(RouterError::PeerExists { pid });
        }
        let endpoint = Endpoint::new(pid, sock).map_err(|source| RouterError::Io {
            op: ErrorOp::Recv,
            peer: pid,
            source,
        })?;
        reactor
            .register_endpoint(endpoint.fd(), pid)
            .map_err(|source| RouterError::Io {
                op: ErrorOp::Recv,
                peer: pid,
                source,
            })?;
        tracing::debug!(node = self.pid, peer = pid, fd = endpoint.fd(), "endpoint added");
        self.endpoints.insert(pid, endpoint);
        Ok(())
    }

    /// Emit a message into the tree. Returns the fresh message id.
    pub(crate) fn submit(
        &mut self,
        reactor: &Reactor,
        payload: Bytes,
        dst: Destination<'_>,
        opts: SubmitOptions,
    ) -> Result<u32, RouterError> {
        if let Destination::Pid(pid) = dst {
            if pid == self.pid {
                return Err(RouterError::Loopback { pid });
            }
        }
        if self.endpoints.is_empty() {
            return Err(RouterError::NoRoute);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RouterError::Protocol {
                peer: 0,
                source: grove_wire::FrameError::PayloadTooLarge(payload.len()),
            });
        }

        let (dst_remote, alias, broadcast) = match dst {
            Destination::Broadcast => (DST_BROADCAST, String::new(), true),
            Destination::Alias(alias) => {
                if alias.len() > MAX_ALIAS_LEN {
                    return Err(RouterError::Protocol {
                        peer: 0,
                        source: grove_wire::FrameError::AliasTooLong(alias.len()),
                    });
                }
                (DST_ALIAS, alias.to_owned(), false)
            }
            Destination::Pid(pid) => (pid, String::new(), false),
        };

        let id = self.rng.gen();
        let template = Frame {
            dst: 0,
            src: self.pid,
            serialize: opts.serialize,
            request_ack: opts.request_ack,
            is_ack: false,
            id,
            urgent: opts.urgent,
            dst_remote,
            last_node_pid: self.pid,
            broadcast,
            alias,
            payload,
        };

        let direct = match dst {
            Destination::Pid(pid) if self.endpoints.contains_key(&pid) => Some(pid),
            _ => None,
        };

        let copies = if let Some(peer) = direct {
            self.enqueue_on(reactor, peer, template)?;
            1
        } else {
            let peers: Vec<u32> = self.endpoints.keys().copied().collect();
            for peer in &peers {
                self.enqueue_on(reactor, *peer, template.clone())?;
            }
            peers.len() as u32
        };

        self.emissions.insert(
            id,
            Emission {
                remaining: copies,
                fired: false,
            },
        );
        tracing::trace!(node = self.pid, id, copies, "submitted");
        Ok(id)
    }

    /// Drain the socket for `pid` and route everything that decoded.
    pub(crate) fn handle_readable(&mut self, reactor: &Reactor, pid: u32) -> Vec<RouterNotice> {
        let mut notices = Vec::new();
        let (frames, eof) = {
            let Some(endpoint) = self.endpoints.get_mut(&pid) else {
                return notices;
            };
            match endpoint.fill() {
                Ok(pass) => (pass.frames, pass.eof),
                Err(err) => {
                    let fault = matches!(err, RouterError::Protocol { .. });
                    notices.push(RouterNotice::Error(err));
                    if fault {
                        // Nothing to resynchronise on; the stream is dead.
                        if let Some(notice) = self.close_endpoint(reactor, pid) {
                            notices.push(notice);
                        }
                    }
                    return notices;
                }
            }
        };

        for frame in frames {
            self.process_frame(reactor, pid, frame, &mut notices);
        }
        if eof {
            if let Some(notice) = self.close_endpoint(reactor, pid) {
                notices.push(notice);
            }
        }
        notices
    }

    /// Flush the socket for `pid` after a write-readiness wake.
    pub(crate) fn handle_writable(&mut self, reactor: &Reactor, pid: u32) -> Vec<RouterNotice> {
        self.flush_endpoint(reactor, pid, FlushOrder::Fifo)
    }

    /// Explicitly push queued frames out on every endpoint. This is the
    /// only path that honours [`FlushOrder::NewestFirst`].
    pub(crate) fn flush_writes(&mut self, reactor: &Reactor, order: FlushOrder) -> Vec<RouterNotice> {
        let mut notices = Vec::new();
        let pids: Vec<u32> = self.endpoints.keys().copied().collect();
        for pid in pids {
            notices.extend(self.flush_endpoint(reactor, pid, order));
        }
        notices
    }

    /// The urgent-signal read pass: drain every endpoint once, delivering
    /// through the interrupt path. Re-entry is a hard error.
    ///
    /// The interrupted flag stays set when this returns; the caller
    /// clears it with [`end_interrupt`](Self::end_interrupt) once the
    /// resulting deliveries have been dispatched, so a listener trying
    /// to start another drain from inside the pass is caught.
    pub(crate) fn drain_urgent(
        &mut self,
        reactor: &Reactor,
    ) -> Result<Vec<RouterNotice>, RouterError> {
        if self.interrupted {
            return Err(RouterError::UrgentReentry);
        }
        self.interrupted = true;
        let mut notices = Vec::new();
        let pids: Vec<u32> = self.endpoints.keys().copied().collect();
        for pid in pids {
            if self.endpoints.contains_key(&pid) {
                notices.extend(self.handle_readable(reactor, pid));
            }
        }
        Ok(notices)
    }

    pub(crate) fn end_interrupt(&mut self) {
        self.interrupted = false;
    }

    /// Close every endpoint without surfacing events. Used at teardown,
    /// after the loop has exited.
    pub(crate) fn close_all(&mut self, reactor: &Reactor) {
        for (_, endpoint) in self.endpoints.drain() {
            let _ = reactor.deregister_endpoint(endpoint.fd());
        }
        self.emissions.clear();
    }

    fn close_endpoint(&mut self, reactor: &Reactor, pid: u32) -> Option<RouterNotice> {
        let mut endpoint = self.endpoints.remove(&pid)?;
        let _ = reactor.deregister_endpoint(endpoint.fd());
        let unsent: Vec<UnsentFrame> = endpoint
            .drain_unsent()
            .into_iter()
            .map(UnsentFrame::from)
            .collect();
        tracing::debug!(node = self.pid, peer = pid, lost = unsent.len(), "peer shut down");
        Some(RouterNotice::PeerShutdown { pid, unsent })
    }

    fn process_frame(
        &mut self,
        reactor: &Reactor,
        from: u32,
        frame: Frame,
        notices: &mut Vec<RouterNotice>,
    ) {
        let fd = self.endpoints.get(&from).map_or(-1, Endpoint::fd);
        let targeted = frame.dst_remote == self.pid
            || (frame.is_alias_routed() && self.alias.as_deref() == Some(frame.alias.as_str()));
        let flood = frame.is_broadcast();

        if !targeted || flood {
            self.forward(reactor, from, &frame, notices);
            if !targeted && !flood {
                // Pure transit; only raw-context dispatch sees it.
                if self.mode == DispatchMode::RawContext {
                    notices.push(self.delivery_notice(&frame, fd));
                }
                return;
            }
        }

        if targeted && frame.request_ack && !frame.is_ack {
            let ack = Frame {
                dst: from,
                src: self.pid,
                serialize: false,
                request_ack: false,
                is_ack: true,
                id: frame.id,
                urgent: false,
                dst_remote: frame.src,
                last_node_pid: self.pid,
                broadcast: false,
                alias: String::new(),
                payload: Bytes::from_static(b"1"),
            };
            // The ack retraces the edge the request arrived on.
            if let Err(err) = self.enqueue_on(reactor, from, ack) {
                notices.push(RouterNotice::Error(err));
            }
        }

        notices.push(self.delivery_notice(&frame, fd));
    }

    fn delivery_notice(&self, frame: &Frame, fd: RawFd) -> RouterNotice {
        let event = MessageEvent::from_frame(frame, fd);
        if self.interrupted {
            RouterNotice::Interrupted(event)
        } else {
            RouterNotice::Received(event)
        }
    }

    fn forward(
        &mut self,
        reactor: &Reactor,
        from: u32,
        frame: &Frame,
        notices: &mut Vec<RouterNotice>,
    ) {
        let peers: Vec<u32> = self
            .endpoints
            .keys()
            .copied()
            .filter(|peer| *peer != from && *peer != frame.last_node_pid)
            .collect();
        for peer in peers {
            if let Err(err) = self.enqueue_on(reactor, peer, frame.clone()) {
                notices.push(RouterNotice::Error(err));
            }
        }
    }

    fn enqueue_on(
        &mut self,
        reactor: &Reactor,
        peer: u32,
        mut frame: Frame,
    ) -> Result<(), RouterError> {
        frame.dst = peer;
        frame.last_node_pid = self.pid;
        let Some(endpoint) = self.endpoints.get_mut(&peer) else {
            return Err(RouterError::NoRoute);
        };
        endpoint.enqueue(frame);
        if !endpoint.writer_registered {
            reactor
                .set_writer(endpoint.fd(), peer, true)
                .map_err(|source| RouterError::Io {
                    op: ErrorOp::Send,
                    peer,
                    source,
                })?;
            endpoint.writer_registered = true;
        }
        Ok(())
    }

    fn flush_endpoint(
        &mut self,
        reactor: &Reactor,
        pid: u32,
        order: FlushOrder,
    ) -> Vec<RouterNotice> {
        let mut notices = Vec::new();
        let (flushed, fd) = {
            let Some(endpoint) = self.endpoints.get_mut(&pid) else {
                return notices;
            };
            let fd = endpoint.fd();
            match endpoint.flush(order) {
                Ok(flushed) => (flushed, fd),
                Err(err) => {
                    notices.push(RouterNotice::Error(err));
                    return notices;
                }
            }
        };

        for frame in &flushed {
            if frame.urgent {
                self.signal_urgent(frame.dst);
            }
            self.note_flush(frame, fd, &mut notices);
        }

        if let Some(endpoint) = self.endpoints.get_mut(&pid) {
            if endpoint.writer_registered && !endpoint.has_pending_writes() {
                match reactor.set_writer(endpoint.fd(), pid, false) {
                    Ok(()) => endpoint.writer_registered = false,
                    Err(err) => {
                        tracing::debug!(peer = pid, error = %err, "writer deregistration failed")
                    }
                }
            }
        }
        notices
    }

    /// Post-flush bookkeeping: urgent signalling is done by the caller;
    /// this decides whether the flush is reported as a sent message.
    fn note_flush(&mut self, frame: &Frame, fd: RawFd, notices: &mut Vec<RouterNotice>) {
        if frame.src == self.pid {
            if let Some(counter) = self.emissions.get_mut(&frame.id) {
                let first = !counter.fired;
                counter.fired = true;
                counter.remaining = counter.remaining.saturating_sub(1);
                if counter.remaining == 0 {
                    self.emissions.remove(&frame.id);
                }
                let fire = match self.mode {
                    DispatchMode::ProcessContext => first,
                    DispatchMode::RawContext => true,
                };
                if fire {
                    notices.push(RouterNotice::Sent(MessageEvent::from_frame(frame, fd)));
                }
                return;
            }
        }
        // Forwarded frames and acks: only raw-context dispatch sees them.
        if self.mode == DispatchMode::RawContext {
            notices.push(RouterNotice::Sent(MessageEvent::from_frame(frame, fd)));
        }
    }

    fn signal_urgent(&self, pid: u32) {
        if let Err(err) = kill(Pid::from_raw(pid as i32), self.urgent_signal) {
            tracing::debug!(peer = pid, error = %err, "urgent signal failed (peer likely gone)");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_interrupted_for_test(&mut self, value: bool) {
        self.interrupted = value;
    }
}
