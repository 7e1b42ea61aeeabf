//! MsgPack codec using `rmp-serde`.
//!
//! Always use `to_vec_named`, never `to_vec`: structs must travel as maps
//! (`{"error_code": .., "error_msg": ..}`), the server does not understand
//! positional structs.
//!
//! # Example
//!
//! ```
//! use muxwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Status {
//!     id: u32,
//!     status: String,
//! }
//!
//! let msg = Status { id: 42, status: "READY".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Status = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// Uses `to_vec_named` for struct-as-map format.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// An empty slice decodes as nil, so `RES_OK` frames (no payload) can be
    /// read as `()` or `Option<T>`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            return Ok(rmp_serde::from_slice(&[NIL])?);
        }
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// MsgPack nil marker.
const NIL: u8 = 0xc0;
