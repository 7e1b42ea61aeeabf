//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use muxwire::protocol::{Frame, Header, types};
//! use bytes::Bytes;
//!
//! let header = Header::new(42, types::RES_DATA, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{types, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a frame for `payload`, deriving the length field from it.
    pub fn with_payload(id: u16, frame_type: u8, payload: Bytes) -> Self {
        Self {
            header: Header::new(id, frame_type, payload.len() as u32),
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the correlation id.
    #[inline]
    pub fn id(&self) -> u16 {
        self.header.id
    }

    /// Get the frame type.
    #[inline]
    pub fn frame_type(&self) -> u8 {
        self.header.frame_type
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        types::is_response(self.header.frame_type)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.frame_type == types::RES_ERROR
    }

    /// Check if this is a server push.
    #[inline]
    pub fn is_push(&self) -> bool {
        types::is_push(self.header.frame_type)
    }

    /// Encode the complete frame into a contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        build_frame(&self.header, &self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes header and appends payload into a contiguous buffer of exactly
/// `HEADER_SIZE + payload.len()` bytes.
///
/// # Example
///
/// ```
/// use muxwire::protocol::{build_frame, Header, types};
///
/// let header = Header::new(42, types::RES_DATA, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), 8 + 5); // header + payload
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.length as usize, payload.len());
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
