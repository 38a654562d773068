//! Packet framing for OSC over TCP.
//!
//! TCP is a byte stream, so OSC packets need to be delimited explicitly. There are two framing
//!  protocols, and both peers of a connection must use the same one:
//!
//! *Length prefix* (OSC 1.0, default)
//!
//! ```ascii
//! 0: payload length (u32 BE)
//! 4: payload
//! ```
//!
//! *SLIP* (OSC 1.1, RFC 1055, double-ended)
//!
//! ```ascii
//! END (0xC0), payload with END escaped as ESC ESC_END (0xDB 0xDC) and ESC escaped as ESC ESC_ESC (0xDB 0xDD), END
//! ```
//!
//! Framing violations affect only the frame they occur in: the decoder discards that frame and
//!  continues with the next one. Frames exceeding the configured maximum length are skipped
//!  without being buffered.

use std::cmp::min;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum FramingMode {
    #[default]
    LengthPrefixed,
    Slip,
}

pub fn encode_frame(framing: FramingMode, payload: &[u8], buf: &mut BytesMut) -> anyhow::Result<()> {
    match framing {
        FramingMode::LengthPrefixed => {
            let len: u32 = match payload.len().try_into() {
                Ok(len) => len,
                Err(_) => bail!("packet of {} bytes is too long for a length prefixed frame", payload.len()),
            };
            buf.reserve(LENGTH_PREFIX_LEN + payload.len());
            buf.put_u32(len);
            buf.put_slice(payload);
        }
        FramingMode::Slip => {
            buf.reserve(payload.len() + 2);
            buf.put_u8(SLIP_END);
            for &b in payload {
                match b {
                    SLIP_END => buf.put_slice(&[SLIP_ESC, SLIP_ESC_END]),
                    SLIP_ESC => buf.put_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
                    _ => buf.put_u8(b),
                }
            }
            buf.put_u8(SLIP_END);
        }
    }
    Ok(())
}

/// Reassembles frames from a byte stream that arrives in arbitrary chunks
pub struct FrameDecoder {
    framing: FramingMode,
    max_frame_len: usize,
    buf: BytesMut,

    /// remaining payload bytes of an over-long length prefixed frame
    num_bytes_to_skip: usize,
    /// discarding an over-long SLIP frame up to the next END
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(framing: FramingMode, max_frame_len: usize) -> FrameDecoder {
        FrameDecoder {
            framing,
            max_frame_len,
            buf: BytesMut::new(),
            num_bytes_to_skip: 0,
            discarding: false,
        }
    }

    pub fn framing(&self) -> FramingMode {
        self.framing
    }

    /// number of bytes received but not yet returned as (part of) a frame
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, mut data: &[u8]) {
        if self.num_bytes_to_skip > 0 {
            let n = min(self.num_bytes_to_skip, data.len());
            self.num_bytes_to_skip -= n;
            data = &data[n..];
        }
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete frame's payload, or `None` if more data is needed. An `Err`
    ///  means that a frame was discarded; the caller should keep calling to get the frames after
    ///  it.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self.framing {
            FramingMode::LengthPrefixed => self.next_length_prefixed_frame(),
            FramingMode::Slip => self.next_slip_frame(),
        }
    }

    fn next_length_prefixed_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.num_bytes_to_skip > 0 {
            let n = min(self.num_bytes_to_skip, self.buf.len());
            self.buf.advance(n);
            self.num_bytes_to_skip -= n;
            if self.num_bytes_to_skip > 0 {
                return Ok(None);
            }
        }

        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
        len_buf.copy_from_slice(&self.buf[..LENGTH_PREFIX_LEN]);
        let frame_len = usize::try_from(u32::from_be_bytes(len_buf)).unwrap_or(usize::MAX);

        if frame_len > self.max_frame_len {
            self.buf.advance(LENGTH_PREFIX_LEN);
            let n = min(frame_len, self.buf.len());
            self.buf.advance(n);
            self.num_bytes_to_skip = frame_len - n;
            bail!("frame of {} bytes exceeds the maximum of {} bytes - skipping", frame_len, self.max_frame_len);
        }

        if self.buf.len() < LENGTH_PREFIX_LEN + frame_len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_LEN);
        Ok(Some(self.buf.split_to(frame_len).freeze()))
    }

    fn next_slip_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            let end_pos = match self.buf.iter().position(|&b| b == SLIP_END) {
                Some(pos) => pos,
                None => {
                    if self.discarding {
                        self.buf.clear();
                    }
                    else if self.buf.len() > 2 * self.max_frame_len {
                        // even fully escaped, this can not be a valid frame
                        self.buf.clear();
                        self.discarding = true;
                        bail!("SLIP frame exceeds the maximum of {} bytes - skipping", self.max_frame_len);
                    }
                    return Ok(None);
                }
            };

            let raw = self.buf.split_to(end_pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let raw = &raw[..end_pos];
            if raw.is_empty() {
                // between the END delimiters of consecutive frames
                continue;
            }

            let payload = unescape_slip(raw)?;
            if payload.len() > self.max_frame_len {
                bail!("SLIP frame of {} bytes exceeds the maximum of {} bytes - skipping", payload.len(), self.max_frame_len);
            }
            return Ok(Some(payload));
        }
    }
}

fn unescape_slip(raw: &[u8]) -> anyhow::Result<Bytes> {
    let mut result = BytesMut::with_capacity(raw.len());

    let mut iter = raw.iter();
    while let Some(&b) = iter.next() {
        if b != SLIP_ESC {
            result.put_u8(b);
            continue;
        }
        match iter.next() {
            Some(&SLIP_ESC_END) => result.put_u8(SLIP_END),
            Some(&SLIP_ESC_ESC) => result.put_u8(SLIP_ESC),
            Some(&other) => bail!("invalid SLIP escape sequence 0x{:02X} 0x{:02X} - discarding frame", SLIP_ESC, other),
            None => bail!("SLIP frame ends with an incomplete escape sequence - discarding frame"),
        }
    }
    Ok(result.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_packet, encode_packet};
    use crate::test_util::{bundle, message_packet};
    use crate::time_tag::TimeTag;
    use rstest::rstest;

    fn decode_all(decoder: &mut FrameDecoder) -> (Vec<Vec<u8>>, usize) {
        let mut frames = Vec::new();
        let mut num_errors = 0;
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => frames.push(frame.to_vec()),
                Ok(None) => return (frames, num_errors),
                Err(_) => num_errors += 1,
            }
        }
    }

    #[rstest]
    #[case::empty(FramingMode::LengthPrefixed, vec![], vec![0,0,0,0])]
    #[case::simple(FramingMode::LengthPrefixed, vec![1,2,3], vec![0,0,0,3, 1,2,3])]
    #[case::slip_empty(FramingMode::Slip, vec![], vec![0xC0, 0xC0])]
    #[case::slip_simple(FramingMode::Slip, vec![1,2,3], vec![0xC0, 1,2,3, 0xC0])]
    #[case::slip_escaped(FramingMode::Slip, vec![0xC0, 1, 0xDB, 0xDC, 0xDD], vec![0xC0, 0xDB,0xDC, 1, 0xDB,0xDD, 0xDC, 0xDD, 0xC0])]
    fn test_encode_frame(#[case] framing: FramingMode, #[case] payload: Vec<u8>, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        encode_frame(framing, &payload, &mut buf).unwrap();
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::length_prefixed(FramingMode::LengthPrefixed)]
    #[case::slip(FramingMode::Slip)]
    fn test_packet_survives_arbitrary_chunking(#[case] framing: FramingMode) {
        let packet = bundle(TimeTag::new(3_900_000_000, 0xC0DB_C0DB), vec![
            message_packet("/a"),
            bundle(TimeTag::IMMEDIATE, vec![message_packet("/b/c")]),
        ]);
        let payload = encode_packet(&packet).unwrap();
        let mut framed = BytesMut::new();
        encode_frame(framing, &payload, &mut framed).unwrap();
        encode_frame(framing, &payload, &mut framed).unwrap();

        for split in 0..=framed.len() {
            let mut decoder = FrameDecoder::new(framing, 1024);
            decoder.push(&framed[..split]);
            let (mut frames, num_errors) = decode_all(&mut decoder);
            decoder.push(&framed[split..]);
            let (more_frames, more_errors) = decode_all(&mut decoder);
            frames.extend(more_frames);

            assert_eq!(num_errors + more_errors, 0, "split at {}", split);
            assert_eq!(frames.len(), 2, "split at {}", split);
            for frame in frames {
                assert_eq!(decode_packet(&frame).unwrap(), packet);
            }
            assert_eq!(decoder.buffered_len(), 0);
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let mut framed = BytesMut::new();
        encode_frame(FramingMode::LengthPrefixed, &[9, 8, 7], &mut framed).unwrap();
        encode_frame(FramingMode::LengthPrefixed, &[], &mut framed).unwrap();
        encode_frame(FramingMode::LengthPrefixed, &[6], &mut framed).unwrap();

        let mut decoder = FrameDecoder::new(FramingMode::LengthPrefixed, 1024);
        let mut frames = Vec::new();
        for b in framed.iter() {
            decoder.push(&[*b]);
            let (f, num_errors) = decode_all(&mut decoder);
            assert_eq!(num_errors, 0);
            frames.extend(f);
        }
        assert_eq!(frames, vec![vec![9, 8, 7], vec![], vec![6]]);
    }

    #[rstest]
    #[case::single_chunk(100)]
    #[case::small_chunks(3)]
    #[case::byte_by_byte(1)]
    fn test_length_prefixed_skips_oversized_frame(#[case] chunk_size: usize) {
        let mut framed = BytesMut::new();
        encode_frame(FramingMode::LengthPrefixed, &[1; 20], &mut framed).unwrap();
        encode_frame(FramingMode::LengthPrefixed, &[2; 8], &mut framed).unwrap();

        let mut decoder = FrameDecoder::new(FramingMode::LengthPrefixed, 10);
        let mut frames = Vec::new();
        let mut num_errors = 0;
        for chunk in framed.chunks(chunk_size) {
            decoder.push(chunk);
            let (f, e) = decode_all(&mut decoder);
            frames.extend(f);
            num_errors += e;
        }

        assert_eq!(frames, vec![vec![2; 8]]);
        assert_eq!(num_errors, 1);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[rstest]
    #[case::invalid_escape(vec![0xC0, 1, 0xDB, 0x01, 2, 0xC0, 0xC0, 3, 0xC0], vec![vec![3]], 1)]
    #[case::trailing_escape(vec![0xC0, 1, 0xDB, 0xC0, 0xC0, 3, 0xC0], vec![vec![3]], 1)]
    #[case::single_ended(vec![1, 2, 0xC0, 3, 0xC0], vec![vec![1, 2], vec![3]], 0)]
    #[case::many_ends(vec![0xC0, 0xC0, 0xC0, 4, 0xC0, 0xC0], vec![vec![4]], 0)]
    #[case::oversized(vec![0xC0, 1,1,1,1,1,1,1,1,1,1,1,1, 0xC0, 0xC0, 5, 0xC0], vec![vec![5]], 1)]
    #[case::incomplete(vec![0xC0, 1, 2], vec![], 0)]
    fn test_slip_decoding(#[case] data: Vec<u8>, #[case] expected: Vec<Vec<u8>>, #[case] expected_errors: usize) {
        let mut decoder = FrameDecoder::new(FramingMode::Slip, 10);
        decoder.push(&data);
        let (frames, num_errors) = decode_all(&mut decoder);

        assert_eq!(frames, expected);
        assert_eq!(num_errors, expected_errors);
    }

    #[test]
    fn test_slip_discards_unterminated_oversized_frame() {
        let mut decoder = FrameDecoder::new(FramingMode::Slip, 4);
        decoder.push(&[0xC0]);
        decoder.push(&[1; 9]);
        let (frames, num_errors) = decode_all(&mut decoder);
        assert!(frames.is_empty());
        assert_eq!(num_errors, 1);

        decoder.push(&[1; 100]);
        assert_eq!(decode_all(&mut decoder), (vec![], 0));
        assert_eq!(decoder.buffered_len(), 0);

        decoder.push(&[1, 0xC0, 0xC0, 7, 0xC0]);
        assert_eq!(decode_all(&mut decoder), (vec![vec![7]], 0));
    }

    #[test]
    fn test_slip_payload_with_boundary_bytes() {
        let payload: Vec<u8> = vec![0xC0, 0xDB, 0xDC, 0xDD, 0xC0, 0xC0, 0xDB, 0xDB, 0, 255];
        let mut framed = BytesMut::new();
        encode_frame(FramingMode::Slip, &payload, &mut framed).unwrap();

        let mut decoder = FrameDecoder::new(FramingMode::Slip, 1024);
        decoder.push(&framed);
        assert_eq!(decode_all(&mut decoder), (vec![payload], 0));
    }
}
