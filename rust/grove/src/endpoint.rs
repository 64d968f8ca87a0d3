//! Per-neighbour I/O endpoint: one non-blocking socketpair half with
//! bounded read/write buffering and a per-endpoint send queue.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use bytes::{Buf, BytesMut};
use grove_wire::Frame;

use crate::error::{ErrorOp, RouterError};

/// How much to pull off the socket per `read` call.
pub(crate) const RCV_BUF_SIZE: usize = 64 * 1024;

/// Dequeue order for the write path. The reactor always drains FIFO;
/// newest-first is an advisory knob honoured only by an explicit
/// [`flush_writes`](crate::Executor::flush_writes) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushOrder {
    #[default]
    Fifo,
    NewestFirst,
}

/// One neighbour edge: the socket plus everything in flight on it.
pub(crate) struct Endpoint {
    pid: u32,
    sock: OwnedFd,
    /// Bytes read off the socket, not yet decoded into a full frame.
    rx_buf: BytesMut,
    /// Remaining bytes of the frame currently being written.
    cursor: BytesMut,
    /// The frame the cursor belongs to; taken when the cursor empties to
    /// run the post-flush action.
    in_flight: Option<Frame>,
    queue: VecDeque<Frame>,
    pub(crate) writer_registered: bool,
    tx_frames: u64,
    rx_frames: u64,
}

/// Outcome of one read pass.
pub(crate) struct ReadPass {
    pub(crate) frames: Vec<Frame>,
    pub(crate) eof: bool,
}

impl Endpoint {
    pub(crate) fn new(pid: u32, sock: OwnedFd) -> io::Result<Self> {
        set_nonblocking(sock.as_raw_fd())?;
        Ok(Self {
            pid,
            sock,
            rx_buf: BytesMut::new(),
            cursor: BytesMut::new(),
            in_flight: None,
            queue: VecDeque::new(),
            writer_registered: false,
            tx_frames: 0,
            rx_frames: 0,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub(crate) fn enqueue(&mut self, frame: Frame) {
        self.queue.push_back(frame);
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.cursor.is_empty() || !self.queue.is_empty()
    }

    /// Frames not yet fully on the wire: the queue plus the one at the
    /// cursor.
    pub(crate) fn pending_frames(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    pub(crate) fn tx_frames(&self) -> u64 {
        self.tx_frames
    }

    pub(crate) fn rx_frames(&self) -> u64 {
        self.rx_frames
    }

    /// Read until the socket would block, decoding every complete frame.
    ///
    /// `eof` is set when the peer closed its end; frames decoded before
    /// the EOF are still returned and must be processed.
    pub(crate) fn fill(&mut self) -> Result<ReadPass, RouterError> {
        let mut scratch = [0u8; RCV_BUF_SIZE];
        let mut eof = false;

        loop {
            let n = unsafe {
                libc::read(
                    self.sock.as_raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n > 0 {
                self.rx_buf.extend_from_slice(&scratch[..n as usize]);
                continue;
            }
            if n == 0 {
                eof = true;
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::WouldBlock => break,
                ErrorKind::Interrupted => continue,
                _ => {
                    return Err(RouterError::Io {
                        op: ErrorOp::Recv,
                        peer: self.pid,
                        source: err,
                    })
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match grove_wire::try_decode(&mut self.rx_buf) {
                Ok(Some(frame)) => {
                    self.rx_frames += 1;
                    frames.push(frame);
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(RouterError::Protocol {
                        peer: self.pid,
                        source,
                    })
                }
            }
        }

        Ok(ReadPass { frames, eof })
    }

    /// Write until the socket would block or nothing is left. Returns the
    /// frames whose last byte left during this pass, in flush order; the
    /// caller runs their post-flush actions.
    pub(crate) fn flush(&mut self, order: FlushOrder) -> Result<Vec<Frame>, RouterError> {
        let mut flushed = Vec::new();

        loop {
            if self.cursor.is_empty() {
                if let Some(done) = self.in_flight.take() {
                    self.tx_frames += 1;
                    flushed.push(done);
                }
                let next = match order {
                    FlushOrder::Fifo => self.queue.pop_front(),
                    FlushOrder::NewestFirst => self.queue.pop_back(),
                };
                let Some(frame) = next else { break };
                if let Err(source) = grove_wire::encode(&frame, &mut self.cursor) {
                    // Queued frames were validated at submit time; hitting
                    // this means the queue was corrupted.
                    return Err(RouterError::Protocol {
                        peer: self.pid,
                        source,
                    });
                }
                self.in_flight = Some(frame);
            }

            let n = unsafe {
                libc::write(
                    self.sock.as_raw_fd(),
                    self.cursor.as_ptr() as *const libc::c_void,
                    self.cursor.len(),
                )
            };
            if n > 0 {
                self.cursor.advance(n as usize);
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::WouldBlock => break,
                ErrorKind::Interrupted => continue,
                _ => {
                    return Err(RouterError::Io {
                        op: ErrorOp::Send,
                        peer: self.pid,
                        source: err,
                    })
                }
            }
        }

        Ok(flushed)
    }

    /// Take every frame that never made it onto the wire, the one at the
    /// cursor first, then the queue in enqueue order.
    pub(crate) fn drain_unsent(&mut self) -> Vec<Frame> {
        let mut unsent = Vec::with_capacity(self.pending_frames());
        self.cursor.clear();
        if let Some(frame) = self.in_flight.take() {
            unsent.push(frame);
        }
        unsent.extend(self.queue.drain(..));
        unsent
    }
}

/// Switch a descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap()
    }

    fn frame(id: u32, payload: &'static [u8]) -> Frame {
        Frame {
            dst: 2,
            src: 1,
            serialize: false,
            request_ack: false,
            is_ack: false,
            id,
            urgent: false,
            dst_remote: 2,
            last_node_pid: 1,
            broadcast: false,
            alias: String::new(),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn frames_cross_the_pair() {
        let (a, b) = pair();
        let mut tx = Endpoint::new(2, a).unwrap();
        let mut rx = Endpoint::new(1, b).unwrap();

        tx.enqueue(frame(7, b"one"));
        tx.enqueue(frame(8, b"two"));
        let flushed = tx.flush(FlushOrder::Fifo).unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(tx.tx_frames(), 2);

        let pass = rx.fill().unwrap();
        assert!(!pass.eof);
        assert_eq!(pass.frames.len(), 2);
        assert_eq!(pass.frames[0].id, 7);
        assert_eq!(pass.frames[1].id, 8);
        assert_eq!(rx.rx_frames(), 2);
    }

    #[test]
    fn newest_first_reorders_the_queue() {
        let (a, b) = pair();
        let mut tx = Endpoint::new(2, a).unwrap();
        let mut rx = Endpoint::new(1, b).unwrap();

        tx.enqueue(frame(1, b"old"));
        tx.enqueue(frame(2, b"new"));
        tx.flush(FlushOrder::NewestFirst).unwrap();

        let pass = rx.fill().unwrap();
        assert_eq!(pass.frames[0].id, 2);
        assert_eq!(pass.frames[1].id, 1);
    }

    #[test]
    fn eof_is_reported_after_remaining_frames() {
        let (a, b) = pair();
        let mut tx = Endpoint::new(2, a).unwrap();
        let mut rx = Endpoint::new(1, b).unwrap();

        tx.enqueue(frame(9, b"last"));
        tx.flush(FlushOrder::Fifo).unwrap();
        drop(tx);

        let pass = rx.fill().unwrap();
        assert!(pass.eof);
        assert_eq!(pass.frames.len(), 1);
        assert_eq!(pass.frames[0].id, 9);
    }

    #[test]
    fn drain_unsent_preserves_enqueue_order() {
        let (a, _b) = pair();
        let mut tx = Endpoint::new(2, a).unwrap();
        tx.enqueue(frame(1, b"x"));
        tx.enqueue(frame(2, b"y"));

        let unsent = tx.drain_unsent();
        assert_eq!(unsent.len(), 2);
        assert_eq!(unsent[0].id, 1);
        assert_eq!(unsent[1].id, 2);
        assert!(!tx.has_pending_writes());
    }
}
