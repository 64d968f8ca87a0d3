#![deny(unsafe_code)]

//! Wire format for messages exchanged between neighbouring processes.
//!
//! Every frame is a fixed 44-byte header followed by a variable-length
//! alias string and a variable-length payload:
//!
//! ```text
//! +--------------------+-----------+-------------+-----------+
//! | header (44 bytes)  | alias     | payload_len | payload   |
//! +--------------------+-----------+-------------+-----------+
//! ```
//!
//! All integers are little-endian `u32`, packed without padding. There is
//! no framing token: alignment is implicit from the length prefixes, so a
//! malformed length means the stream is unrecoverable and the endpoint
//! must be closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 44;

/// Maximum alias length in bytes.
pub const MAX_ALIAS_LEN: usize = 255;

/// Maximum payload size (16 MiB). Validated before allocation.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// `dst_remote` value selecting broadcast delivery.
pub const DST_BROADCAST: u32 = 0;

/// `dst_remote` value selecting alias-based delivery.
pub const DST_ALIAS: u32 = 1;

/// A single routed message.
///
/// `dst` and `last_node_pid` are rewritten at every hop; everything else is
/// immutable once emitted (ack synthesis builds a new frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Next-hop peer pid.
    pub dst: u32,
    /// Original emitter pid.
    pub src: u32,
    /// Payload is an application-encoded blob. Transport-opaque marker,
    /// forwarded unchanged and reported to listeners.
    pub serialize: bool,
    /// Recipient must emit an ack.
    pub request_ack: bool,
    /// This frame is itself an ack.
    pub is_ack: bool,
    /// Logical message id, stable across routing and ack.
    pub id: u32,
    /// Sender signals the next hop after flushing this frame.
    pub urgent: bool,
    /// Ultimate destination: [`DST_BROADCAST`], [`DST_ALIAS`], or a pid.
    pub dst_remote: u32,
    /// Pid that transmitted this hop (split-horizon key).
    pub last_node_pid: u32,
    /// Fan out at each node.
    pub broadcast: bool,
    /// Destination alias, meaningful when `dst_remote == DST_ALIAS`.
    pub alias: String,
    /// Opaque bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Total encoded size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.alias.len() + 4 + self.payload.len()
    }

    /// Whether the frame asks for broadcast delivery.
    pub fn is_broadcast(&self) -> bool {
        self.dst_remote == DST_BROADCAST
    }

    /// Whether the frame is routed by alias rather than pid.
    pub fn is_alias_routed(&self) -> bool {
        self.dst_remote == DST_ALIAS
    }
}

/// Violation of the wire format bounds.
///
/// There is nothing to resynchronise on, so any of these means the byte
/// stream is corrupt and the connection carrying it must be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// `alias_len` exceeds [`MAX_ALIAS_LEN`].
    AliasTooLong(usize),
    /// Alias bytes are not valid UTF-8.
    AliasNotUtf8,
    /// `payload_len` exceeds [`MAX_PAYLOAD_SIZE`].
    PayloadTooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::AliasTooLong(n) => {
                write!(f, "alias length {n} exceeds maximum {MAX_ALIAS_LEN}")
            }
            FrameError::AliasNotUtf8 => write!(f, "alias bytes are not valid UTF-8"),
            FrameError::PayloadTooLarge(n) => {
                write!(f, "payload length {n} exceeds maximum {MAX_PAYLOAD_SIZE}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode a frame into `dst`.
///
/// Bounds are validated before any byte is written; on error `dst` is
/// untouched.
pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
    if frame.alias.len() > MAX_ALIAS_LEN {
        return Err(FrameError::AliasTooLong(frame.alias.len()));
    }
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(frame.payload.len()));
    }

    dst.reserve(frame.encoded_len());
    dst.put_u32_le(frame.dst);
    dst.put_u32_le(frame.src);
    dst.put_u32_le(u32::from(frame.serialize));
    dst.put_u32_le(u32::from(frame.request_ack));
    dst.put_u32_le(u32::from(frame.is_ack));
    dst.put_u32_le(frame.id);
    dst.put_u32_le(u32::from(frame.urgent));
    dst.put_u32_le(frame.dst_remote);
    dst.put_u32_le(frame.last_node_pid);
    dst.put_u32_le(u32::from(frame.broadcast));
    dst.put_u32_le(frame.alias.len() as u32);
    dst.extend_from_slice(frame.alias.as_bytes());
    dst.put_u32_le(frame.payload.len() as u32);
    dst.extend_from_slice(&frame.payload);
    Ok(())
}

fn read_u32_le_at(buf: &BytesMut, offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds less than one complete frame;
/// the buffer is left untouched so the next read can complete it. A
/// complete frame removes exactly its own bytes. Length fields are
/// validated against the bounds before anything is allocated.
pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let alias_len = read_u32_le_at(buf, 40) as usize;
    if alias_len > MAX_ALIAS_LEN {
        return Err(FrameError::AliasTooLong(alias_len));
    }
    if buf.len() < HEADER_SIZE + alias_len + 4 {
        return Ok(None);
    }

    let payload_len = read_u32_le_at(buf, HEADER_SIZE + alias_len) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    let total = HEADER_SIZE + alias_len + 4 + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let dst = buf.get_u32_le();
    let src = buf.get_u32_le();
    let serialize = buf.get_u32_le() != 0;
    let request_ack = buf.get_u32_le() != 0;
    let is_ack = buf.get_u32_le() != 0;
    let id = buf.get_u32_le();
    let urgent = buf.get_u32_le() != 0;
    let dst_remote = buf.get_u32_le();
    let last_node_pid = buf.get_u32_le();
    let broadcast = buf.get_u32_le() != 0;
    let alias_len = buf.get_u32_le() as usize;

    let alias_bytes = buf.split_to(alias_len);
    let alias = match std::str::from_utf8(&alias_bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => return Err(FrameError::AliasNotUtf8),
    };

    let payload_len = buf.get_u32_le() as usize;
    let payload = buf.split_to(payload_len).freeze();

    Ok(Some(Frame {
        dst,
        src,
        serialize,
        request_ack,
        is_ack,
        id,
        urgent,
        dst_remote,
        last_node_pid,
        broadcast,
        alias,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame {
            dst: 4242,
            src: 17,
            serialize: true,
            request_ack: true,
            is_ack: false,
            id: 0xdead_beef,
            urgent: false,
            dst_remote: 4242,
            last_node_pid: 17,
            broadcast: false,
            alias: "worker".to_owned(),
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn roundtrip() {
        let frame = sample();
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len());

        let decoded = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_layout_is_little_endian_and_packed() {
        let frame = Frame {
            dst: 1,
            src: 2,
            serialize: false,
            request_ack: false,
            is_ack: false,
            id: 0x0403_0201,
            urgent: false,
            dst_remote: 1,
            last_node_pid: 2,
            broadcast: false,
            alias: String::new(),
            payload: Bytes::from_static(b"x"),
        };
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf).unwrap();

        assert_eq!(&buf[0..4], &[1, 0, 0, 0]); // dst
        assert_eq!(&buf[20..24], &[0x01, 0x02, 0x03, 0x04]); // id, LE
        assert_eq!(&buf[40..44], &[0, 0, 0, 0]); // alias_len
        assert_eq!(&buf[44..48], &[1, 0, 0, 0]); // payload_len right after alias
        assert_eq!(&buf[48..], b"x");
        assert_eq!(buf.len(), HEADER_SIZE + 4 + 1);
    }

    #[test]
    fn partial_header_is_not_consumed() {
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE - 1][..]);
        assert_eq!(try_decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), HEADER_SIZE - 1);
    }

    #[test]
    fn partial_alias_and_payload_are_not_consumed() {
        let frame = sample();
        let mut full = BytesMut::new();
        encode(&frame, &mut full).unwrap();

        // Feed the encoded bytes one at a time; no prefix may decode early.
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            if i + 1 < full.len() {
                buf.put_u8(*byte);
                assert_eq!(try_decode(&mut buf).unwrap(), None, "false decode at {i}");
                assert_eq!(buf.len(), i + 1, "buffer consumed at {i}");
            }
        }
        buf.put_u8(full[full.len() - 1]);
        assert_eq!(try_decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_back_to_back() {
        let first = sample();
        let second = Frame {
            id: 7,
            alias: String::new(),
            payload: Bytes::from_static(b"1"),
            is_ack: true,
            request_ack: false,
            ..sample()
        };
        let mut buf = BytesMut::new();
        encode(&first, &mut buf).unwrap();
        encode(&second, &mut buf).unwrap();

        assert_eq!(try_decode(&mut buf).unwrap(), Some(first));
        assert_eq!(try_decode(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_alias_is_a_protocol_fault() {
        let mut buf = BytesMut::new();
        buf.resize(40, 0);
        buf.put_u32_le(MAX_ALIAS_LEN as u32 + 1);
        assert_eq!(
            try_decode(&mut buf),
            Err(FrameError::AliasTooLong(MAX_ALIAS_LEN + 1))
        );
    }

    #[test]
    fn oversized_payload_is_a_protocol_fault() {
        let mut buf = BytesMut::new();
        buf.resize(40, 0);
        buf.put_u32_le(0); // alias_len
        buf.put_u32_le(MAX_PAYLOAD_SIZE as u32 + 1);
        assert_eq!(
            try_decode(&mut buf),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn invalid_alias_utf8_is_a_protocol_fault() {
        let mut frame = sample();
        frame.alias = "ab".to_owned();
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf).unwrap();
        buf[HEADER_SIZE] = 0xff;
        buf[HEADER_SIZE + 1] = 0xfe;
        assert_eq!(try_decode(&mut buf), Err(FrameError::AliasNotUtf8));
    }

    #[test]
    fn encode_rejects_oversized_alias() {
        let mut frame = sample();
        frame.alias = "a".repeat(MAX_ALIAS_LEN + 1);
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode(&frame, &mut buf),
            Err(FrameError::AliasTooLong(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_alias_and_payload() {
        let frame = Frame {
            alias: String::new(),
            payload: Bytes::new(),
            ..sample()
        };
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 4);
        assert_eq!(try_decode(&mut buf).unwrap(), Some(frame));
    }
}
