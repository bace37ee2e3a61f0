//! Stream framing for DNS over TCP/TLS (RFC 1035 section 4.2.2).
//!
//! Every DNS message on a stream transport is preceded by its length as a
//! 2-byte big-endian integer. This module provides the framing helpers used
//! by the engine without performing any I/O: [`frame_packet`] for outbound
//! messages and [`TcpFrameDecoder`] for reassembling inbound messages from
//! arbitrarily chunked stream reads.
//!
//! A declared frame length shorter than a DNS message header is treated as a
//! protocol error; the caller is expected to tear the connection down.

/// Length of the framing header (2 bytes for length prefix).
pub const FRAMING_HEADER_LEN: usize = 2;

/// Smallest frame the decoder will accept: a bare DNS message header.
pub const MIN_FRAME_LEN: usize = 12;

/// Maximum message size that can be framed (u16::MAX = 65535 bytes).
pub const MAX_FRAMED_PACKET_SIZE: usize = u16::MAX as usize;

use crate::error::{Error, Result};

/// Prepends the 2-byte big-endian length header to a DNS message.
///
/// # Panics
///
/// Panics if `buf.len() > 65535`; callers never build messages that large.
pub fn frame_packet(buf: &[u8]) -> Vec<u8> {
    assert!(
        buf.len() <= MAX_FRAMED_PACKET_SIZE,
        "message length {} exceeds maximum {}",
        buf.len(),
        MAX_FRAMED_PACKET_SIZE
    );

    let mut framed = Vec::with_capacity(FRAMING_HEADER_LEN + buf.len());
    framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
    framed.extend_from_slice(buf);
    framed
}

/// A stateful decoder for length-prefixed DNS stream messages.
///
/// Buffers incoming stream data and extracts complete messages. Partial
/// reads are handled gracefully; data can be fed in any chunk size.
#[derive(Debug, Default)]
pub struct TcpFrameDecoder {
    buffer: Vec<u8>,
}

impl TcpFrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends data read from the stream to the internal buffer.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to extract the next complete message from the buffer.
    ///
    /// Returns `Ok(Some(message))` when a full message is available (without
    /// the length header), `Ok(None)` when more data is needed, and
    /// `Err(Error::ErrFrameTooShort)` when the peer declared a length too
    /// small to hold a DNS message header.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < FRAMING_HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if length < MIN_FRAME_LEN {
            return Err(Error::ErrFrameTooShort);
        }

        let total_len = FRAMING_HEADER_LEN + length;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let packet = self.buffer[FRAMING_HEADER_LEN..total_len].to_vec();
        self.buffer.drain(..total_len);
        Ok(Some(packet))
    }

    /// Returns the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(len: usize) -> Vec<u8> {
        vec![0xAB; len]
    }

    #[test]
    fn test_frame_packet() {
        let m = msg(20);
        let framed = frame_packet(&m);
        assert_eq!(framed.len(), FRAMING_HEADER_LEN + m.len());
        assert_eq!(u16::from_be_bytes([framed[0], framed[1]]) as usize, m.len());
        assert_eq!(&framed[FRAMING_HEADER_LEN..], &m[..]);
    }

    #[test]
    fn test_decoder_complete_message() {
        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&frame_packet(&msg(16)));
        assert_eq!(decoder.next_packet().unwrap(), Some(msg(16)));
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decoder_partial_reads() {
        let mut decoder = TcpFrameDecoder::new();
        let framed = frame_packet(&msg(16));

        // One byte of the length header only.
        decoder.extend_from_slice(&framed[..1]);
        assert_eq!(decoder.next_packet().unwrap(), None);

        // Header complete, payload partial.
        decoder.extend_from_slice(&framed[1..10]);
        assert_eq!(decoder.next_packet().unwrap(), None);
        assert_eq!(decoder.buffered_len(), 10);

        decoder.extend_from_slice(&framed[10..]);
        assert_eq!(decoder.next_packet().unwrap(), Some(msg(16)));
    }

    #[test]
    fn test_decoder_multiple_messages() {
        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&frame_packet(&msg(12)));
        decoder.extend_from_slice(&frame_packet(&msg(33)));
        assert_eq!(decoder.next_packet().unwrap(), Some(msg(12)));
        assert_eq!(decoder.next_packet().unwrap(), Some(msg(33)));
        assert_eq!(decoder.next_packet().unwrap(), None);
    }

    #[test]
    fn test_decoder_short_length_is_error() {
        let mut decoder = TcpFrameDecoder::new();
        // Declared length 4 cannot hold a DNS header.
        decoder.extend_from_slice(&[0, 4, 1, 2, 3, 4]);
        assert_eq!(decoder.next_packet(), Err(Error::ErrFrameTooShort));
    }
}
