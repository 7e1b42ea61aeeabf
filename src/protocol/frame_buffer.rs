//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 8 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//! - `Corrupted`: A header failed validation; the stream cannot be resynchronized
//!
//! # Example
//!
//! ```
//! use muxwire::protocol::{build_frame, FrameBuffer, Header, types};
//!
//! let bytes = build_frame(&Header::new(1, types::RES_DATA, 2), b"hi");
//!
//! let mut buffer = FrameBuffer::new();
//! assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[5..]).unwrap();
//! assert_eq!(frames[0].payload(), b"hi");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{ClientError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 8 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header },
    /// A framing error was reported; every later push fails.
    Corrupted { reason: String },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Uses a state machine to handle partial reads efficiently.
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 64MB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the frames completed by this push (possibly none). Partial
    /// data is kept for the next push.
    ///
    /// Frames that completed ahead of a bad header in the same push are
    /// still returned; the buffer is then corrupted and [`error`](Self::error)
    /// reports why.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Framing`] on a checkbit mismatch or oversized
    /// length when no frame precedes it. The buffer stays corrupted afterwards
    /// and rejects every later push with the same error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        if let Some(e) = self.error() {
            return Err(e);
        }

        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        loop {
            match self.try_extract_one() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) if frames.is_empty() => return Err(e),
                Err(_) => break,
            }
        }

        Ok(frames)
    }

    /// The framing error that corrupted this buffer, if any.
    pub fn error(&self) -> Option<ClientError> {
        match &self.state {
            State::Corrupted { reason } => Some(ClientError::Framing(reason.clone())),
            _ => None,
        }
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a framing violation
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer) {
                        Some(h) => h,
                        None => return Ok(None),
                    };

                    if let Err(e) = header.validate(self.max_payload_size) {
                        self.state = State::Corrupted {
                            reason: match &e {
                                ClientError::Framing(reason) => reason.clone(),
                                other => other.to_string(),
                            },
                        };
                        return Err(e);
                    }

                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.length == 0 {
                        return Ok(Some(Frame::new(header, Bytes::new())));
                    }

                    self.state = State::WaitingForPayload { header };
                }

                State::WaitingForPayload { header } => {
                    let remaining = header.length as usize;

                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let header = *header;
                    let payload = self.buffer.split_to(remaining).freeze();

                    self.state = State::WaitingForHeader;

                    return Ok(Some(Frame::new(header, payload)));
                }

                State::Corrupted { reason } => {
                    return Err(ClientError::Framing(reason.clone()));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if a framing error has been reported.
    pub fn is_corrupted(&self) -> bool {
        matches!(self.state, State::Corrupted { .. })
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::Corrupted { .. } => "Corrupted",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
