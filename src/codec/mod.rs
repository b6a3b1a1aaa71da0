//! The gRPC length-prefix message framing: each message on the wire is a
//! 1-byte compressed flag followed by a 4-byte big-endian length and that
//! many bytes of (possibly compressed) payload.
//!
//! Message *contents* are opaque to this crate (§1 non-goal: "the
//! serialization of message payloads" is an external collaborator's job),
//! but the frame delimiter itself is not -- `CallStream` (§4.9) must split
//! incoming HTTP/2 DATA bytes into discrete messages before handing each
//! one to the receive filters, and must frame outgoing messages the same
//! way. A small `HEADER_SIZE` + `ReadHeader`/`ReadBody` state machine
//! covers this, stripped of the generic `Encoder`/`Decoder`/`Codec`
//! machinery that assumes a typed message format.

use crate::status::{Code, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_SIZE: usize = 5;

/// Frames a single opaque message for the wire.
pub fn encode_frame(payload: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(compressed as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incrementally reassembles length-delimited frames out of a byte stream
/// that may deliver arbitrarily-sized chunks (HTTP/2 DATA frames do not
/// align with gRPC message boundaries).
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly-received bytes to the reassembly buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pulls the next complete frame out of the buffer, if one is fully
    /// buffered. Returns `(compressed, payload)`; callers should keep
    /// calling this after each `push` since one `push` may complete more
    /// than one frame.
    pub fn next_frame(&mut self) -> Result<Option<(bool, Bytes)>, Status> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let compressed = match self.buf[0] {
            0 => false,
            1 => true,
            other => {
                return Err(Status::new(
                    Code::Internal,
                    format!("invalid compressed-flag byte {other} in gRPC frame header"),
                ))
            }
        };
        let len = u32::from_be_bytes(self.buf[1..HEADER_SIZE].try_into().unwrap()) as usize;
        if self.buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_SIZE);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some((compressed, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let frame = encode_frame(b"hello", false);
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        let (compressed, payload) = decoder.next_frame().unwrap().unwrap();
        assert!(!compressed);
        assert_eq!(&payload[..], b"hello");
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn reassembles_a_frame_split_across_pushes() {
        let frame = encode_frame(b"split-message", true);
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&frame[3..]);
        let (compressed, payload) = decoder.next_frame().unwrap().unwrap();
        assert!(compressed);
        assert_eq!(&payload[..], b"split-message");
    }

    #[test]
    fn decodes_back_to_back_frames_from_one_push() {
        let mut combined = BytesMut::new();
        combined.extend_from_slice(&encode_frame(b"one", false));
        combined.extend_from_slice(&encode_frame(b"two", false));
        let mut decoder = FrameDecoder::new();
        decoder.push(&combined);
        let (_, first) = decoder.next_frame().unwrap().unwrap();
        let (_, second) = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
    }

    #[test]
    fn rejects_bad_compressed_flag() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_u32(0);
        let mut decoder = FrameDecoder::new();
        decoder.push(&buf);
        assert!(decoder.next_frame().is_err());
    }
}
