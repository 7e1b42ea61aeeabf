//! Wire format encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌──────────┬──────────┬───────┬──────────┐
//! │ Length   │ Id       │ Type  │ Checkbit │
//! │ 4 bytes  │ 2 bytes  │ 1 byte│ 1 byte   │
//! │ uint32 LE│ uint16 LE│       │ type^0xFF│
//! └──────────┴──────────┴───────┴──────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. `Length` counts payload bytes
//! only; the header itself is never included.

use crate::error::{ClientError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Frame type codes.
///
/// Pushes (0-15) carry no correlation id, responses (16-31) answer a
/// request by id, requests (32-63) are sent by the client.
pub mod types {
    /// Node status changed.
    pub const ON_NODE_STATUS: u8 = 0;
    /// Server warning.
    pub const ON_WARN: u8 = 5;
    /// Joined a room.
    pub const ON_ROOM_JOIN: u8 = 6;
    /// Left a room.
    pub const ON_ROOM_LEAVE: u8 = 7;
    /// Event emitted in a room.
    pub const ON_ROOM_EMIT: u8 = 8;
    /// Room was deleted.
    pub const ON_ROOM_DELETE: u8 = 9;

    /// Ping answer (empty).
    pub const RES_PING: u8 = 16;
    /// Success without data.
    pub const RES_OK: u8 = 17;
    /// Success with a payload.
    pub const RES_DATA: u8 = 18;
    /// Error payload `{error_code, error_msg}`.
    pub const RES_ERROR: u8 = 19;

    /// Ping.
    pub const REQ_PING: u8 = 32;
    /// Authentication handshake.
    pub const REQ_AUTH: u8 = 33;
    /// Query `[scope, code, args?]`.
    pub const REQ_QUERY: u8 = 34;
    /// Run a procedure `[scope, name, args?]`.
    pub const REQ_RUN: u8 = 37;
    /// Join rooms `[scope, id...]`.
    pub const REQ_JOIN: u8 = 38;
    /// Leave rooms `[scope, id...]`.
    pub const REQ_LEAVE: u8 = 39;
    /// Emit in a room `[scope, id, event, args...]`.
    pub const REQ_EMIT: u8 = 40;

    /// Check if a type code is a server push.
    #[inline]
    pub fn is_push(frame_type: u8) -> bool {
        matches!(
            frame_type,
            ON_NODE_STATUS | ON_WARN | ON_ROOM_JOIN | ON_ROOM_LEAVE | ON_ROOM_EMIT | ON_ROOM_DELETE
        )
    }

    /// Check if a type code is a response.
    #[inline]
    pub fn is_response(frame_type: u8) -> bool {
        matches!(frame_type, RES_PING | RES_OK | RES_DATA | RES_ERROR)
    }

    /// Check if a type code is a client request.
    #[inline]
    pub fn is_request(frame_type: u8) -> bool {
        matches!(
            frame_type,
            REQ_PING | REQ_AUTH | REQ_QUERY | REQ_RUN | REQ_JOIN | REQ_LEAVE | REQ_EMIT
        )
    }

    /// Human readable name for logging.
    pub fn name(frame_type: u8) -> &'static str {
        match frame_type {
            ON_NODE_STATUS => "ON_NODE_STATUS",
            ON_WARN => "ON_WARN",
            ON_ROOM_JOIN => "ON_ROOM_JOIN",
            ON_ROOM_LEAVE => "ON_ROOM_LEAVE",
            ON_ROOM_EMIT => "ON_ROOM_EMIT",
            ON_ROOM_DELETE => "ON_ROOM_DELETE",
            RES_PING => "RES_PING",
            RES_OK => "RES_OK",
            RES_DATA => "RES_DATA",
            RES_ERROR => "RES_ERROR",
            REQ_PING => "REQ_PING",
            REQ_AUTH => "REQ_AUTH",
            REQ_QUERY => "REQ_QUERY",
            REQ_RUN => "REQ_RUN",
            REQ_JOIN => "REQ_JOIN",
            REQ_LEAVE => "REQ_LEAVE",
            REQ_EMIT => "REQ_EMIT",
            _ => "UNKNOWN",
        }
    }
}

/// Compute the checkbit for a type code.
#[inline]
pub const fn checkbit(frame_type: u8) -> u8 {
    frame_type ^ 0xFF
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub length: u32,
    /// Request identifier (0 for pushes).
    pub id: u16,
    /// Frame type (see `types` module).
    pub frame_type: u8,
    /// Integrity byte, `frame_type ^ 0xFF` on a valid frame.
    pub checkbit: u8,
}

impl Header {
    /// Create a new header with a correct checkbit.
    pub fn new(id: u16, frame_type: u8, length: u32) -> Self {
        Self {
            length,
            id,
            frame_type,
            checkbit: checkbit(frame_type),
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use muxwire::protocol::{Header, types};
    ///
    /// let header = Header::new(0, types::REQ_QUERY, 11);
    /// assert_eq!(header.encode(), [11, 0, 0, 0, 0, 0, 0x22, 0xDD]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..6].copy_from_slice(&self.id.to_le_bytes());
        buf[6] = self.frame_type;
        buf[7] = self.checkbit;
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short. The checkbit is not verified
    /// here, see [`Header::validate`].
    ///
    /// # Example
    ///
    /// ```
    /// use muxwire::protocol::Header;
    ///
    /// let bytes = [5, 0, 0, 0, 42, 0, 18, 0xED];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.length, 5);
    /// assert_eq!(header.id, 42);
    /// assert_eq!(header.frame_type, 18);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            id: u16::from_le_bytes([buf[4], buf[5]]),
            frame_type: buf[6],
            checkbit: buf[7],
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Checkbit equals `frame_type ^ 0xFF`
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.checkbit != checkbit(self.frame_type) {
            return Err(ClientError::Framing(format!(
                "checkbit mismatch for type {}: expected 0x{:02X}, got 0x{:02X}",
                self.frame_type,
                checkbit(self.frame_type),
                self.checkbit
            )));
        }

        if self.length > max_payload_size {
            return Err(ClientError::Framing(format!(
                "Payload size {} exceeds maximum {}",
                self.length, max_payload_size
            )));
        }

        Ok(())
    }

    /// Check if this is a server push.
    #[inline]
    pub fn is_push(&self) -> bool {
        types::is_push(self.frame_type)
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        types::is_response(self.frame_type)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.frame_type == types::RES_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(42, types::RES_DATA, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = Header::new(0x0102, 0x22, 0x0A0B0C0D);
        let bytes = header.encode();

        // Length: 0x0A0B0C0D in LE
        assert_eq!(&bytes[0..4], &[0x0D, 0x0C, 0x0B, 0x0A]);

        // Id: 0x0102 in LE
        assert_eq!(&bytes[4..6], &[0x02, 0x01]);

        assert_eq!(bytes[6], 0x22);
        assert_eq!(bytes[7], 0xDD);
    }

    #[test]
    fn test_header_size_is_exactly_8() {
        assert_eq!(HEADER_SIZE, 8);
        assert_eq!(Header::new(1, types::REQ_PING, 0).encode().len(), 8);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 7]; // One byte short
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_checkbit_computed() {
        for t in 0..=u8::MAX {
            let header = Header::new(0, t, 0);
            assert_eq!(header.checkbit ^ header.frame_type, 0xFF);
            assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
        }
    }

    #[test]
    fn test_validate_checkbit_mismatch() {
        let mut header = Header::new(1, types::RES_DATA, 0);
        header.checkbit = 0x00;
        let result = header.validate(DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(matches!(result, Err(ClientError::Framing(_))));
        assert!(result.unwrap_err().to_string().contains("checkbit"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(1, types::RES_DATA, 1_000_000);
        let result = header.validate(100);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_type_classes_are_disjoint() {
        for t in 0..=u8::MAX {
            let classes = [types::is_push(t), types::is_response(t), types::is_request(t)];
            assert!(classes.iter().filter(|c| **c).count() <= 1, "type {}", t);
        }
        assert!(types::is_push(types::ON_ROOM_EMIT));
        assert!(types::is_response(types::RES_ERROR));
        assert!(types::is_request(types::REQ_QUERY));
        assert_eq!(types::name(types::REQ_AUTH), "REQ_AUTH");
        assert_eq!(types::name(200), "UNKNOWN");
    }

    #[test]
    fn test_header_accessors() {
        let header = Header::new(7, types::RES_ERROR, 0);
        assert!(header.is_response());
        assert!(header.is_error());
        assert!(!header.is_push());

        let push = Header::new(0, types::ON_WARN, 0);
        assert!(push.is_push());
        assert!(!push.is_response());
    }
}
