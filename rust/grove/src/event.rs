//! Message views handed to listeners.

use std::os::unix::io::RawFd;

use bytes::Bytes;
use grove_wire::{Frame, DST_BROADCAST};

/// A received or flushed message, as seen by listeners.
///
/// Everything is read-only except the payload, which a listener may
/// rewrite in place (e.g. to decode an application encoding once for the
/// listeners behind it).
#[derive(Debug, Clone)]
pub struct MessageEvent {
    id: u32,
    src: u32,
    dst: u32,
    alias: String,
    fd: RawFd,
    urgent: bool,
    ack: bool,
    broadcast: bool,
    serialized: bool,
    payload: Bytes,
}

impl MessageEvent {
    pub(crate) fn from_frame(frame: &Frame, fd: RawFd) -> Self {
        Self {
            id: frame.id,
            src: frame.src,
            dst: frame.dst_remote,
            alias: frame.alias.clone(),
            fd,
            urgent: frame.urgent,
            ack: frame.is_ack,
            broadcast: frame.broadcast || frame.dst_remote == DST_BROADCAST,
            serialized: frame.serialize,
            payload: frame.payload.clone(),
        }
    }

    /// Logical message id, stable across routing and ack.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Pid of the original emitter.
    pub fn src(&self) -> u32 {
        self.src
    }

    /// Semantic destination: `0` for a broadcast, `1` when alias-routed
    /// (see [`alias`](Self::alias)), otherwise a pid.
    pub fn dst(&self) -> u32 {
        self.dst
    }

    /// Destination alias, empty unless the message was alias-routed.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// File descriptor of the endpoint the message crossed.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Whether the emitter marked the payload as an application-encoded
    /// blob. Transport-opaque; the library never interprets it.
    pub fn is_serialized(&self) -> bool {
        self.serialized
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Replace the payload seen by later listeners.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }
}

/// A frame that was queued toward a peer that shut down before it could
/// be transmitted. Plain data, detached from any endpoint, in enqueue
/// order; suitable for resubmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsentFrame {
    /// Semantic destination the frame was travelling toward.
    pub dst: u32,
    pub serialize: bool,
    pub is_ack: bool,
    pub urgent: bool,
    pub broadcast: bool,
    pub data: Bytes,
    pub alias: String,
}

impl From<Frame> for UnsentFrame {
    fn from(frame: Frame) -> Self {
        Self {
            dst: frame.dst_remote,
            serialize: frame.serialize,
            is_ack: frame.is_ack,
            urgent: frame.urgent,
            broadcast: frame.broadcast,
            data: frame.payload,
            alias: frame.alias,
        }
    }
}
