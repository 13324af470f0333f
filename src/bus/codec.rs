//! Wire codec and stream reassembly.
//!
//! Every frame is a fixed 20-byte big-endian header followed by `length` raw
//! body bytes. The header carries a fixed check constant instead of a real
//! checksum; any frame that fails the check is rejected before application
//! logic and the connection carrying it is closed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Serialized header size: type(4) + nid(4) + length(4) + flag(4) + check(4).
pub const HEADER_LEN: usize = 20;

/// Fixed check constant every valid frame carries.
pub const FRAME_CHECK: u32 = 0x8765_4321;

/// Hard cap on a single frame body, independent of receive buffer sizing.
pub const MAX_FRAME_BODY: usize = 1_048_576; // 1MB

/// Control frame (auth, keepalive, subscription).
pub const FLAG_SYS: i32 = -1;
/// Business frame (opaque payload for a registered handler).
pub const FLAG_EXP: i32 = 1;

pub const OP_AUTH_REQ: u32 = 0x0101;
pub const OP_AUTH_ACK: u32 = 0x0102;
pub const OP_PING: u32 = 0x0103;
pub const OP_PONG: u32 = 0x0104;
pub const OP_SUB: u32 = 0x0105;
pub const OP_UNSUB: u32 = 0x0106;

// ---------------------------------------------------------------------------
// Header + frame
// ---------------------------------------------------------------------------

/// Fixed wire header. `nid` is the origin node on requests and the
/// destination node on directed sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u32,
    pub nid: u32,
    pub length: u32,
    pub flag: i32,
    pub chksum: u32,
}

impl FrameHeader {
    /// Parse a header from exactly `HEADER_LEN` bytes. No validation here;
    /// call `validate()` before trusting any field.
    pub fn parse(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= HEADER_LEN);
        let u32_at = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            msg_type: u32_at(0),
            nid: u32_at(4),
            length: u32_at(8),
            flag: u32_at(12) as i32,
            chksum: u32_at(16),
        }
    }

    /// Reject anything a peer could use to desynchronize or flood us.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.chksum != FRAME_CHECK {
            return Err(ProtocolError::BadCheck {
                found: self.chksum,
                expected: FRAME_CHECK,
            });
        }
        if self.flag != FLAG_SYS && self.flag != FLAG_EXP {
            return Err(ProtocolError::BadFlag(self.flag));
        }
        if self.length as usize > MAX_FRAME_BODY {
            return Err(ProtocolError::FrameTooLarge {
                length: self.length as usize,
                max: MAX_FRAME_BODY,
            });
        }
        Ok(())
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u32(self.msg_type);
        buf.put_u32(self.nid);
        buf.put_u32(self.length);
        buf.put_i32(self.flag);
        buf.put_u32(self.chksum);
    }
}

/// One decoded frame: header plus an owned body.
///
/// Bodies are copied out of the wire cursor so a frame's lifetime is scoped
/// to whichever worker ends up processing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    /// Control frame with opcode `op`.
    pub fn sys(op: u32, nid: u32, body: Bytes) -> Self {
        Self::build(op, nid, FLAG_SYS, body)
    }

    /// Business frame with message type `ty`.
    pub fn exp(ty: u32, nid: u32, body: Bytes) -> Self {
        Self::build(ty, nid, FLAG_EXP, body)
    }

    fn build(msg_type: u32, nid: u32, flag: i32, body: Bytes) -> Self {
        Self {
            header: FrameHeader {
                msg_type,
                nid,
                length: body.len() as u32,
                flag,
                chksum: FRAME_CHECK,
            },
            body,
        }
    }

    pub fn is_sys(&self) -> bool {
        self.header.flag == FLAG_SYS
    }

    /// Serialize header + body into one contiguous buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        let mut header = self.header;
        header.length = self.body.len() as u32;
        header.write_to(&mut buf);
        buf.put_slice(&self.body);
        buf
    }
}

// ---------------------------------------------------------------------------
// Control bodies
// ---------------------------------------------------------------------------

/// Decoded SYS frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    AuthReq {
        gid: u32,
        username: String,
        password: String,
    },
    AuthAck {
        ok: bool,
    },
    Ping,
    Pong,
    Subscribe {
        topic: u32,
    },
    Unsubscribe {
        topic: u32,
    },
    /// Opcode from a newer peer; safe to skip since framing already
    /// consumed the right number of bytes.
    Unknown {
        op: u32,
    },
}

impl Control {
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let op = frame.header.msg_type;
        let body = &frame.body;
        let truncated = || ProtocolError::TruncatedControl(op);
        match op {
            OP_AUTH_REQ => {
                // gid(4) + user_len(2) + user + pass_len(2) + pass
                if body.len() < 8 {
                    return Err(truncated());
                }
                let gid = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let ulen = u16::from_be_bytes([body[4], body[5]]) as usize;
                if body.len() < 8 + ulen {
                    return Err(truncated());
                }
                let username = String::from_utf8(body[6..6 + ulen].to_vec())
                    .map_err(|_| truncated())?;
                let plen_at = 6 + ulen;
                let plen =
                    u16::from_be_bytes([body[plen_at], body[plen_at + 1]]) as usize;
                if body.len() < plen_at + 2 + plen {
                    return Err(truncated());
                }
                let password =
                    String::from_utf8(body[plen_at + 2..plen_at + 2 + plen].to_vec())
                        .map_err(|_| truncated())?;
                Ok(Control::AuthReq {
                    gid,
                    username,
                    password,
                })
            }
            OP_AUTH_ACK => {
                if body.is_empty() {
                    return Err(truncated());
                }
                Ok(Control::AuthAck { ok: body[0] == 1 })
            }
            OP_PING => Ok(Control::Ping),
            OP_PONG => Ok(Control::Pong),
            OP_SUB | OP_UNSUB => {
                if body.len() < 4 {
                    return Err(truncated());
                }
                let topic = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                Ok(if op == OP_SUB {
                    Control::Subscribe { topic }
                } else {
                    Control::Unsubscribe { topic }
                })
            }
            other => Ok(Control::Unknown { op: other }),
        }
    }
}

/// Build an AUTH_REQ frame for node `nid` joining group `gid`.
pub fn auth_req_frame(nid: u32, gid: u32, username: &str, password: &str) -> Frame {
    let user = username.as_bytes();
    let pass = password.as_bytes();
    let mut body = BytesMut::with_capacity(8 + user.len() + pass.len());
    body.put_u32(gid);
    body.put_u16(user.len() as u16);
    body.put_slice(user);
    body.put_u16(pass.len() as u16);
    body.put_slice(pass);
    Frame::sys(OP_AUTH_REQ, nid, body.freeze())
}

pub fn auth_ack_frame(nid: u32, ok: bool) -> Frame {
    Frame::sys(OP_AUTH_ACK, nid, Bytes::from_static(if ok { &[1] } else { &[0] }))
}

pub fn ping_frame(nid: u32) -> Frame {
    Frame::sys(OP_PING, nid, Bytes::new())
}

pub fn pong_frame(nid: u32) -> Frame {
    Frame::sys(OP_PONG, nid, Bytes::new())
}

fn topic_frame(op: u32, nid: u32, topic: u32) -> Frame {
    let mut body = BytesMut::with_capacity(4);
    body.put_u32(topic);
    Frame::sys(op, nid, body.freeze())
}

pub fn subscribe_frame(nid: u32, topic: u32) -> Frame {
    topic_frame(OP_SUB, nid, topic)
}

pub fn unsubscribe_frame(nid: u32, topic: u32) -> Frame {
    topic_frame(OP_UNSUB, nid, topic)
}

// ---------------------------------------------------------------------------
// Stream reassembly cursor
// ---------------------------------------------------------------------------

/// Reassembles frames out of a byte stream using one owned, fixed-capacity
/// buffer.
///
/// Policy: when the buffer fills without a complete frame, unconsumed bytes
/// are compacted to the front before the next read; a frame that could never
/// fit the buffer at all is a fatal stream corruption and the caller must
/// close the connection.
pub struct FrameCursor {
    buf: Vec<u8>,
    consumed: usize,
    filled: usize,
}

impl FrameCursor {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > HEADER_LEN, "cursor capacity too small");
        Self {
            buf: vec![0u8; capacity],
            consumed: 0,
            filled: 0,
        }
    }

    /// Unconsumed byte count.
    pub fn available(&self) -> usize {
        self.filled - self.consumed
    }

    fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        self.buf.copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
    }

    /// Writable tail to read socket bytes into. Compacts first when the tail
    /// is exhausted; errors when even compaction cannot free space, which
    /// means a frame larger than the whole buffer is in flight.
    pub fn unfilled(&mut self) -> Result<&mut [u8], ProtocolError> {
        if self.filled == self.buf.len() {
            if self.consumed == 0 {
                return Err(ProtocolError::BufferOverflow {
                    needed: self.buf.len() + 1,
                    capacity: self.buf.len(),
                });
            }
            self.compact();
        }
        Ok(&mut self.buf[self.filled..])
    }

    /// Record `n` bytes read into the slice returned by `unfilled()`.
    pub fn advance(&mut self, n: usize) {
        self.filled += n;
        debug_assert!(self.filled <= self.buf.len());
    }

    /// Pop the next complete frame, or `None` when more bytes are needed.
    ///
    /// Header validation (check constant, flag, length cap) happens here,
    /// before the body is ever exposed; a frame whose total size exceeds the
    /// buffer capacity is fatal.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.available() < HEADER_LEN {
            return Ok(None);
        }
        let header = FrameHeader::parse(&self.buf[self.consumed..self.consumed + HEADER_LEN]);
        header.validate()?;

        let total = HEADER_LEN + header.length as usize;
        if total > self.buf.len() {
            return Err(ProtocolError::BufferOverflow {
                needed: total,
                capacity: self.buf.len(),
            });
        }
        if self.available() < total {
            return Ok(None);
        }

        let body_start = self.consumed + HEADER_LEN;
        let body = Bytes::copy_from_slice(&self.buf[body_start..self.consumed + total]);
        self.consumed += total;
        if self.consumed == self.filled {
            self.consumed = 0;
            self.filled = 0;
        }
        Ok(Some(Frame { header, body }))
    }

    /// Discard all buffered bytes (used when a link restarts).
    pub fn reset(&mut self) {
        self.consumed = 0;
        self.filled = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn feed(cursor: &mut FrameCursor, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let dst = cursor.unfilled().unwrap();
            let n = dst.len().min(bytes.len());
            dst[..n].copy_from_slice(&bytes[..n]);
            cursor.advance(n);
            bytes = &bytes[n..];
        }
    }

    #[test]
    fn header_round_trip() {
        let frame = Frame::exp(0x0201, 42, Bytes::from_static(b"hello"));
        let wire = frame.encode();
        let header = FrameHeader::parse(&wire);
        assert_eq!(header, frame.header);
        header.validate().unwrap();
        assert_eq!(header.length, 5);
    }

    #[test]
    fn cursor_decodes_single_frame() {
        let frame = Frame::exp(0x0201, 42, Bytes::from_static(b"payload"));
        let mut cursor = FrameCursor::new(256);
        feed(&mut cursor, &frame.encode());
        let got = cursor.next_frame().unwrap().unwrap();
        assert_eq!(got, frame);
        assert!(cursor.next_frame().unwrap().is_none());
    }

    #[test]
    fn cursor_handles_partial_reads() {
        let frame = Frame::exp(0x0301, 9, Bytes::from(vec![7u8; 100]));
        let wire = frame.encode();
        let mut cursor = FrameCursor::new(256);
        // one byte at a time, checking we never get a premature frame
        for (i, b) in wire.iter().enumerate() {
            feed(&mut cursor, &[*b]);
            let out = cursor.next_frame().unwrap();
            if i + 1 < wire.len() {
                assert!(out.is_none(), "frame surfaced after {} bytes", i + 1);
            } else {
                assert_eq!(out.unwrap(), frame);
            }
        }
    }

    #[test]
    fn cursor_decodes_back_to_back_frames() {
        let a = Frame::sys(OP_PING, 1, Bytes::new());
        let b = Frame::exp(0x0201, 2, Bytes::from_static(b"x"));
        let mut wire = a.encode();
        wire.extend_from_slice(&b.encode());
        let mut cursor = FrameCursor::new(128);
        feed(&mut cursor, &wire);
        assert_eq!(cursor.next_frame().unwrap().unwrap(), a);
        assert_eq!(cursor.next_frame().unwrap().unwrap(), b);
        assert!(cursor.next_frame().unwrap().is_none());
    }

    #[test]
    fn cursor_compacts_when_full() {
        // two 34-byte frames through a 64-byte buffer: the second frame can
        // only complete after unconsumed bytes are moved to the front
        let a = Frame::exp(0x0202, 3, Bytes::from(vec![1u8; 14]));
        let b = Frame::exp(0x0202, 4, Bytes::from(vec![2u8; 14]));
        let mut wire = a.encode();
        wire.extend_from_slice(&b.encode());
        assert_eq!(wire.len(), 68);

        let mut cursor = FrameCursor::new(64);
        feed(&mut cursor, &wire[..64]); // fills the buffer exactly
        assert_eq!(cursor.next_frame().unwrap().unwrap(), a);
        assert!(cursor.next_frame().unwrap().is_none());
        // buffer is full with 30 unconsumed bytes; unfilled() must compact
        feed(&mut cursor, &wire[64..]);
        assert_eq!(cursor.next_frame().unwrap().unwrap(), b);
        assert_eq!(cursor.available(), 0);
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let frame = Frame::exp(0x0203, 5, Bytes::from(vec![0u8; 200]));
        let mut cursor = FrameCursor::new(64);
        let wire = frame.encode();
        feed(&mut cursor, &wire[..64]);
        match cursor.next_frame() {
            Err(ProtocolError::BufferOverflow { needed, capacity }) => {
                assert_eq!(needed, HEADER_LEN + 200);
                assert_eq!(capacity, 64);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn bad_check_rejected_before_body() {
        let frame = Frame::exp(0x0201, 1, Bytes::from_static(b"evil"));
        let mut wire = frame.encode();
        wire[16] ^= 0xff; // corrupt the check field
        let mut cursor = FrameCursor::new(128);
        feed(&mut cursor, &wire);
        assert!(matches!(
            cursor.next_frame(),
            Err(ProtocolError::BadCheck { .. })
        ));
    }

    #[test]
    fn bad_flag_rejected() {
        let mut frame = Frame::exp(0x0201, 1, Bytes::new());
        frame.header.flag = 0;
        let wire = frame.encode();
        let mut cursor = FrameCursor::new(128);
        feed(&mut cursor, &wire);
        assert!(matches!(
            cursor.next_frame(),
            Err(ProtocolError::BadFlag(0))
        ));
    }

    #[test]
    fn auth_req_round_trip() {
        let frame = auth_req_frame(9, 3, "edge-7", "s3cr3t");
        assert!(frame.is_sys());
        let ctrl = Control::decode(&frame).unwrap();
        assert_eq!(
            ctrl,
            Control::AuthReq {
                gid: 3,
                username: "edge-7".into(),
                password: "s3cr3t".into(),
            }
        );
    }

    #[test]
    fn auth_ack_round_trip() {
        assert_eq!(
            Control::decode(&auth_ack_frame(1, true)).unwrap(),
            Control::AuthAck { ok: true }
        );
        assert_eq!(
            Control::decode(&auth_ack_frame(1, false)).unwrap(),
            Control::AuthAck { ok: false }
        );
    }

    #[test]
    fn subscribe_round_trip() {
        assert_eq!(
            Control::decode(&subscribe_frame(4, 0x0201)).unwrap(),
            Control::Subscribe { topic: 0x0201 }
        );
        assert_eq!(
            Control::decode(&unsubscribe_frame(4, 0x0201)).unwrap(),
            Control::Unsubscribe { topic: 0x0201 }
        );
    }

    #[test]
    fn truncated_auth_req_rejected() {
        let frame = auth_req_frame(9, 3, "edge", "pw");
        let short = Frame::sys(OP_AUTH_REQ, 9, frame.body.slice(..5));
        assert!(matches!(
            Control::decode(&short),
            Err(ProtocolError::TruncatedControl(OP_AUTH_REQ))
        ));
    }

    #[test]
    fn unknown_opcode_is_skippable() {
        let frame = Frame::sys(0x7777, 1, Bytes::new());
        assert_eq!(
            Control::decode(&frame).unwrap(),
            Control::Unknown { op: 0x7777 }
        );
    }

    proptest! {
        #[test]
        fn frame_round_trip(
            ty in 1u32..0xffff,
            nid in 1u32..0xffff,
            body in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = Frame::exp(ty, nid, Bytes::from(body));
            let mut cursor = FrameCursor::new(1024);
            let wire = frame.encode();
            let dst = cursor.unfilled().unwrap();
            dst[..wire.len()].copy_from_slice(&wire);
            cursor.advance(wire.len());
            let got = cursor.next_frame().unwrap().unwrap();
            prop_assert_eq!(got, frame);
        }

        #[test]
        fn auth_req_round_trip_any(
            gid in any::<u32>(),
            user in "[a-zA-Z0-9_.-]{1,32}",
            pass in "[ -~]{0,48}",
        ) {
            let frame = auth_req_frame(1, gid, &user, &pass);
            let ctrl = Control::decode(&frame).unwrap();
            prop_assert_eq!(ctrl, Control::AuthReq {
                gid,
                username: user,
                password: pass,
            });
        }
    }
}
