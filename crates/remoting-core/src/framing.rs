//! The bit-exact wire framing of
//!
//! ```text
//! chunk  := header:2 body:len
//! header := (more:1 bit) || (len:15 bits, big-endian)
//! ```
//!
//! A `Command` ends on a chunk whose `more` bit is zero. A zero-length final
//! chunk is the end-of-command marker, emitted whenever the last body chunk
//! filled the frame exactly (so the decoder can never confuse "frame exactly
//! full" with "frame is the last one").

use crate::config::MAX_CHUNK_LEN;
use bytes::{Buf, BufMut, BytesMut};

const MORE_BIT: u16 = 0x8000;
const LEN_MASK: u16 = 0x7fff;

/// Encode `payload` as one or more chunks and append them to `out`.
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) {
    let mut remaining = payload;
    loop {
        let take = remaining.len().min(MAX_CHUNK_LEN);
        let (chunk, rest) = remaining.split_at(take);
        let more = !rest.is_empty() || take == MAX_CHUNK_LEN;
        write_chunk(out, chunk, more);
        remaining = rest;
        if !more {
            break;
        }
    }
}

fn write_chunk(out: &mut BytesMut, body: &[u8], more: bool) {
    debug_assert!(body.len() <= MAX_CHUNK_LEN);
    let mut header = body.len() as u16 & LEN_MASK;
    if more {
        header |= MORE_BIT;
    }
    out.put_u16(header);
    out.put_slice(body);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub more: bool,
    pub len: usize,
}

/// Incremental chunk decoder driven by feeding it bytes as they arrive. Not
/// tied to any particular transport; `crate::stack` layers push bytes in and
/// pull completed frames out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    assembling: BytesMut,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Not enough bytes buffered yet for the next chunk.
    NeedMore,
    /// A complete command frame was assembled.
    Frame(Vec<u8>),
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete header, if fully buffered, without consuming
    /// it from `buf`.
    fn peek_header(&self) -> Option<ChunkHeader> {
        if self.buf.len() < 2 {
            return None;
        }
        let raw = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        Some(ChunkHeader {
            more: raw & MORE_BIT != 0,
            len: (raw & LEN_MASK) as usize,
        })
    }

    /// Try to assemble as many complete frames as the buffered bytes allow.
    /// Returns `NeedMore` once no further progress can be made; callers loop
    /// until they see that.
    pub fn poll(&mut self) -> DecodeOutcome {
        loop {
            let header = match self.peek_header() {
                Some(h) => h,
                None => return DecodeOutcome::NeedMore,
            };
            if self.buf.len() < 2 + header.len {
                return DecodeOutcome::NeedMore;
            }
            self.buf.advance(2);
            let body = self.buf.split_to(header.len);
            self.assembling.extend_from_slice(&body);
            if !header.more {
                let frame = std::mem::take(&mut self.assembling).to_vec();
                return DecodeOutcome::Frame(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: &[u8]) {
        let mut out = BytesMut::new();
        encode_frame(payload, &mut out);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&out);
        match decoder.poll() {
            DecodeOutcome::Frame(frame) => assert_eq!(frame, payload),
            DecodeOutcome::NeedMore => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn round_trips_small_payload() {
        round_trip(b"hello");
    }

    #[test]
    fn round_trips_empty_payload() {
        round_trip(b"");
    }

    #[test]
    fn round_trips_payload_larger_than_one_chunk() {
        let payload = vec![0x42u8; MAX_CHUNK_LEN * 3 + 17];
        round_trip(&payload);
    }

    #[test]
    fn exact_frame_size_emits_zero_length_terminator() {
        let payload = vec![1u8; MAX_CHUNK_LEN];
        let mut out = BytesMut::new();
        encode_frame(&payload, &mut out);
        // first chunk: more=1, len=MAX_CHUNK_LEN; second chunk: more=0, len=0
        assert_eq!(out.len(), 2 + MAX_CHUNK_LEN + 2);
        let terminator = u16::from_be_bytes([out[out.len() - 2], out[out.len() - 1]]);
        assert_eq!(terminator, 0);
    }

    #[test]
    fn decoder_handles_bytes_arriving_in_arbitrary_splits() {
        let payload = vec![7u8; MAX_CHUNK_LEN + 50];
        let mut out = BytesMut::new();
        encode_frame(&payload, &mut out);
        let mut decoder = FrameDecoder::new();
        for byte in out.iter() {
            decoder.feed(&[*byte]);
            if let DecodeOutcome::Frame(frame) = decoder.poll() {
                assert_eq!(frame, payload);
                return;
            }
        }
        panic!("frame never completed");
    }

    #[test]
    fn decoder_assembles_multiple_queued_frames() {
        let mut out = BytesMut::new();
        encode_frame(b"first", &mut out);
        encode_frame(b"second", &mut out);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&out);
        assert_eq!(decoder.poll(), DecodeOutcome::Frame(b"first".to_vec()));
        assert_eq!(decoder.poll(), DecodeOutcome::Frame(b"second".to_vec()));
        assert_eq!(decoder.poll(), DecodeOutcome::NeedMore);
    }
}
