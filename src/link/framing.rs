//! Wire framing for the peer control sockets.
//!
//! The backend control servers speak one JSON document per message and rely
//! on the transport to preserve message boundaries. Over a stream socket
//! that guarantee comes from a length prefix:
//!
//! ```text
//! [u32 LE length] [payload: length bytes]
//! ```
//!
//! The payload is an opaque byte slice at this layer; JSON parsing happens
//! in the link's read loop so that a malformed document can be logged and
//! dropped without desynchronizing the stream. A framing-level error (zero
//! or oversized length) *does* desync the stream and is fatal to the
//! connection.

use anyhow::{bail, Result};

/// Maximum frame payload size (1 MiB, matching the peers' input buffers).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Encode a payload into a wire-format frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete payloads.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame header is malformed or the frame exceeds
    /// the size limit. The stream is unrecoverable after that.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length == 0 {
                bail!("invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            payloads.push(self.buf[4..total].to_vec());
            self.buf.drain(..total);
        }

        Ok(payloads)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let payload = br#"{"cmd":"config","dir":"request","params":{}}"#;
        let encoded = encode_frame(payload);
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&encoded).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], payload);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_frame(b"one"));
        buf.extend_from_slice(&encode_frame(b"two"));
        buf.extend_from_slice(&encode_frame(b"three"));

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&buf).unwrap();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let encoded = encode_frame(b"split me");
        let mut decoder = FrameDecoder::new();

        let mid = encoded.len() / 2;
        let payloads = decoder.feed(&encoded[..mid]).unwrap();
        assert!(payloads.is_empty());
        assert!(decoder.has_partial());

        let payloads = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(payloads, vec![b"split me".to_vec()]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = encode_frame(b"x");
        let mut decoder = FrameDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let payloads = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert!(payloads.is_empty());
            } else {
                assert_eq!(payloads, vec![b"x".to_vec()]);
            }
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let buf = [0u8; 4];
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let length = MAX_FRAME_SIZE + 1;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&length.to_le_bytes()).is_err());
    }

    #[test]
    fn test_large_frame_accepted() {
        let payload = vec![0x42u8; 256 * 1024];
        let encoded = encode_frame(&payload);
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&encoded).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].len(), payload.len());
    }
}
