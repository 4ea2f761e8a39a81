//! Incremental decoder for ETX-delimited JSON frames.
//!
//! There is no length prefix: a frame ends at the first `0x03` byte. A single
//! read may carry several frames and a frame may span many reads, so bytes
//! are buffered until a delimiter shows up.
//!
//! [`FrameDecoder`] is the push-style core (feed bytes, pull frames).
//! [`FrameStream`] wraps any [`Read`] into the lazy frame sequence consumed by
//! the reader thread and by subscriptions.

use std::io::{ErrorKind, Read};

use crate::error::{Result, RpcError};
use crate::frame::{Frame, DELIMITER};

/// Bytes requested per `read` call.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Largest frame accepted from the peer (16 MiB), delimiter excluded.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Incremental frame decoder that handles partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to contain no delimiter.
    scanned: usize,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes without decoding anything yet.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Split off and decode the first complete frame in the buffer.
    ///
    /// Returns `Ok(None)` when no delimiter is buffered. Empty segments
    /// (back-to-back delimiters) are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] if the segment is not UTF-8 or not JSON,
    /// or if it grows past [`MAX_FRAME_SIZE`]. The offending bytes are
    /// consumed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == DELIMITER) else {
                if self.buf.len() > MAX_FRAME_SIZE {
                    let buffered = self.buf.len();
                    self.buf.clear();
                    self.scanned = 0;
                    return Err(RpcError::Protocol(format!(
                        "frame too large: {buffered} bytes without delimiter (max {MAX_FRAME_SIZE})"
                    )));
                }
                self.scanned = self.buf.len();
                return Ok(None);
            };
            let end = self.scanned + offset;
            if end > MAX_FRAME_SIZE {
                self.buf.drain(..=end);
                self.scanned = 0;
                return Err(RpcError::Protocol(format!("frame too large: {end} bytes (max {MAX_FRAME_SIZE})")));
            }
            let segment: Vec<u8> = self.buf.drain(..=end).take(end).collect();
            self.scanned = 0;

            if segment.is_empty() {
                continue;
            }
            return decode_segment(&segment).map(Some);
        }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error on the first malformed frame. Frames decoded before it
    /// are discarded along with the error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

fn decode_segment(segment: &[u8]) -> Result<Frame> {
    let text = std::str::from_utf8(segment)
        .map_err(|e| RpcError::Protocol(format!("frame is not valid UTF-8: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RpcError::Protocol(format!("invalid JSON frame: {e}")))?;
    Ok(Frame::new(value))
}

/// Lazy sequence of frames read from a byte source.
///
/// Yields `Ok(frame)` for each decoded frame in arrival order. The sequence
/// ends (`None`) after the source reports end-of-stream. A decode or read
/// failure is yielded once as `Err` and then the sequence ends. Once the
/// sequence has ended the source is dropped.
#[derive(Debug)]
pub struct FrameStream<R> {
    reader: Option<R>,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: Read> FrameStream<R> {
    /// Wrap a byte source.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            decoder: FrameDecoder::new(),
            buf: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Returns `true` once the sequence has ended and the source is released.
    pub fn is_finished(&self) -> bool {
        self.reader.is_none()
    }

    /// Stop the sequence and drop the source.
    pub fn finish(&mut self) {
        if let Some(reader) = self.reader.take() {
            if self.decoder.has_partial() {
                log::debug!("[Codec] Discarding partial frame at end of stream");
            }
            drop(reader);
        }
    }
}

impl<R: Read> Iterator for FrameStream<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.reader.is_none() {
                return None;
            }

            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }

            let reader = self.reader.as_mut()?;
            match reader.read(&mut self.buf) {
                Ok(0) => {
                    self.finish();
                    return None;
                }
                Ok(n) => self.decoder.push(&self.buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.finish();
                    return Some(Err(RpcError::Io(e)));
                }
            }
        }
    }
}
