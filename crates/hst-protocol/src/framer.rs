//! Receive buffer that turns a raw byte stream into payloads

use crate::frame::{scan_and_extract, ScanOutcome};

/// Frame decoder for incoming bytes
///
/// Bytes are accumulated until at least one complete frame is present.
/// A single read from the port may hold several frames, or only part of one.
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Feed bytes into the decoder and extract complete payloads
    ///
    /// Returns payloads (command + data) in the order their frames completed
    /// in the stream; empty if no frame is complete yet.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        loop {
            match scan_and_extract(&mut self.buffer) {
                ScanOutcome::Frame(payload) => payloads.push(payload),
                ScanOutcome::Incomplete => break,
                ScanOutcome::Desync { discarded } => {
                    if discarded > 0 {
                        tracing::warn!("No start marker in buffer, discarded {} bytes", discarded);
                    }
                    break;
                }
            }
        }

        if !self.buffer.is_empty() {
            tracing::trace!("{} bytes pending in receive buffer", self.buffer.len());
        }

        payloads
    }

    /// Number of bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the decoder state
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode;

    #[test]
    fn test_decode_simple() {
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&[0xAA, 0xBB, 0x02, 0x01, 0xAA, 0xCC, 0xDD]);
        assert_eq!(payloads, vec![vec![0x01, 0xAA]]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_partial() {
        let mut decoder = FrameDecoder::new();

        // First part
        let payloads = decoder.feed(&[0xAA, 0xBB, 0x02, 0x06]);
        assert!(payloads.is_empty());
        assert_eq!(decoder.buffered(), 4);

        // Second part
        let payloads = decoder.feed(&[0xAA, 0xCC, 0xDD]);
        assert_eq!(payloads, vec![vec![0x06, 0xAA]]);
    }

    #[test]
    fn test_decode_multiple_in_one_read() {
        let mut stream = encode(0x06, &[0xAA]).unwrap();
        stream.extend_from_slice(&encode(0x04, &[1, 0, 2, 0]).unwrap());
        stream.extend_from_slice(&encode(0x07, &[0xAB]).unwrap());

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&stream);
        assert_eq!(
            payloads,
            vec![vec![0x06, 0xAA], vec![0x04, 1, 0, 2, 0], vec![0x07, 0xAB]]
        );
    }

    #[test]
    fn test_decode_frame_split_across_reads() {
        let stream = encode(0x0A, &[0x00, 0x19, 0x00, 0x00]).unwrap();
        let mut decoder = FrameDecoder::new();

        let mut payloads = Vec::new();
        for chunk in stream.chunks(3) {
            payloads.extend(decoder.feed(chunk));
        }
        assert_eq!(payloads, vec![vec![0x0A, 0x00, 0x19, 0x00, 0x00]]);
    }

    #[test]
    fn test_noise_is_discarded() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&[0x10, 0x20, 0x30]).is_empty());
        assert_eq!(decoder.buffered(), 0);

        let payloads = decoder.feed(&encode(0x06, &[0xAA]).unwrap());
        assert_eq!(payloads, vec![vec![0x06, 0xAA]]);
    }

    #[test]
    fn test_clear() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0xAA, 0xBB, 0x05]);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }
}
