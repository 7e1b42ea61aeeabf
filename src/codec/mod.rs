//! Codec module - serialization/deserialization for payloads.
//!
//! Every payload on the wire is a single MessagePack value. Structs are
//! always written as maps so the server sees field names, and binary data
//! goes out as MessagePack `bin` (wrap it in `serde_bytes`).
//!
//! # Example
//!
//! ```
//! use muxwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&("//stuff", "1 + 1;")).unwrap();
//! let decoded: (String, String) = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded.0, "//stuff");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
