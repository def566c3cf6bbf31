//! Message framing for the PostgreSQL v3 protocol.
//!
//! Every message on the wire is `[tag] [i32 length] [payload]`, where the tag
//! byte is absent for the startup and SSL request packets and the length
//! counts itself but not the tag.
//!
//! - [`MessageWriter`] accumulates any number of frontend messages into one
//!   buffer so a whole request goes out in a single write.
//! - [`FrameDecoder`] slices complete backend frames out of the bytes read
//!   from the socket, however the reads happen to be chunked.
//! - [`PayloadReader`] parses the fields of a single frame with bounds checks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};

/// Size of the tag byte plus the length field.
const HEADER_LEN: usize = 5;

// ============================================================================
// Writer
// ============================================================================

/// Buffer of encoded frontend messages.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: BytesMut,
    /// Offset of the length field of the message being written.
    start: Option<usize>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a message: write the tag (if any) and reserve the length field.
    pub fn begin_message(&mut self, tag: Option<u8>) {
        debug_assert!(self.start.is_none(), "previous message not ended");
        if let Some(tag) = tag {
            self.buf.put_u8(tag);
        }
        self.start = Some(self.buf.len());
        self.buf.put_i32(0);
    }

    /// Finish the current message by back-patching its length.
    pub fn end_message(&mut self) {
        let start = self
            .start
            .take()
            .expect("end_message called without begin_message");
        let len = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    #[inline]
    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    #[inline]
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Write a null-terminated string.
    #[inline]
    pub fn put_cstr(&mut self, v: &str) {
        self.buf.put_slice(v.as_bytes());
        self.buf.put_u8(0);
    }

    /// Append everything buffered in another writer.
    pub fn append(&mut self, other: &mut MessageWriter) {
        debug_assert!(other.start.is_none());
        self.buf.extend_from_slice(&other.buf);
        other.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Take the buffered bytes, leaving the writer empty.
    pub fn take(&mut self) -> Bytes {
        debug_assert!(self.start.is_none(), "message still open");
        self.buf.split().freeze()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = None;
    }
}

// ============================================================================
// Frame decoder
// ============================================================================

/// One complete backend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

/// Accumulating receive buffer that yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Append bytes received from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Receive buffer, for reading directly into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes waiting to form a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Slice off the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> PgResult<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 {
            return Err(PgError::Protocol(format!(
                "Invalid message length {} for tag '{}'",
                len, self.buf[0] as char
            )));
        }

        let total = 1 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        let tag = frame[0];
        frame.advance(HEADER_LEN);
        Ok(Some(Frame {
            tag,
            payload: frame.freeze(),
        }))
    }
}

// ============================================================================
// Payload reader
// ============================================================================

/// Bounds-checked reader over a frame payload.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Protocol(format!(
                "Truncated message while reading {}",
                what
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> PgResult<u8> {
        self.need(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_i16(&mut self) -> PgResult<i16> {
        self.need(2, "int16")?;
        Ok(self.buf.get_i16())
    }

    pub fn get_i32(&mut self) -> PgResult<i32> {
        self.need(4, "int32")?;
        Ok(self.buf.get_i32())
    }

    /// Take `n` raw bytes without copying.
    pub fn get_bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n, "bytes")?;
        Ok(self.buf.split_to(n))
    }

    /// Take everything left.
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Read a null-terminated string.
    pub fn get_cstr(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

        // Direct UTF-8 first; lossy only for the rare invalid case
        let s = std::str::from_utf8(&self.buf[..end])
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.buf[..end]).into_owned());

        self.buf.advance(end + 1);
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_end_back_patches_length() {
        let mut w = MessageWriter::new();
        w.begin_message(Some(b'Q'));
        w.put_cstr("SELECT 1");
        w.end_message();

        let bytes = w.take();
        assert_eq!(bytes[0], b'Q');
        assert_eq!(&bytes[1..5], &13i32.to_be_bytes());
        assert_eq!(bytes.len(), 14);
    }

    #[test]
    fn test_untagged_message_length_covers_whole_packet() {
        let mut w = MessageWriter::new();
        w.begin_message(None);
        w.put_i32(80877103);
        w.end_message();

        assert_eq!(&w.take()[..], &[0, 0, 0, 8, 4, 210, 22, 47]);
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let mut d = FrameDecoder::new();
        d.extend(&[b'Z', 0, 0]);
        assert!(d.next_frame().unwrap().is_none());
        d.extend(&[0, 5]);
        assert!(d.next_frame().unwrap().is_none());
        d.extend(&[b'I']);

        let frame = d.next_frame().unwrap().unwrap();
        assert_eq!(frame.tag, b'Z');
        assert_eq!(&frame.payload[..], b"I");
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_bad_length() {
        let mut d = FrameDecoder::new();
        d.extend(&[b'Z', 0, 0, 0, 2]);
        assert!(d.next_frame().is_err());
    }

    #[test]
    fn test_payload_reader_truncation_is_an_error() {
        let mut r = PayloadReader::new(Bytes::from_static(&[0, 1]));
        assert_eq!(r.get_i16().unwrap(), 1);
        assert!(r.get_i32().is_err());
        assert!(PayloadReader::new(Bytes::from_static(b"abc")).get_cstr().is_err());
    }
}
