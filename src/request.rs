//! Request payload encoding.
//!
//! A query travels as `[scope, code]`, or `[scope, code, {name: value}]`
//! when it has named arguments. Binary arguments are never inlined into the
//! code text: [`Query::blob`] registers the bytes as an argument named
//! `blob0`, `blob1`, ... (in insertion order) and returns that name so the
//! caller can reference it from the code.
//!
//! # Example
//!
//! ```
//! use muxwire::request::Query;
//!
//! let mut query = Query::new("//stuff", "").arg("name", "alice");
//! let placeholder = query.blob(vec![0xde, 0xad]);
//! let query = query.with_code(format!(".avatar = {};", placeholder));
//!
//! assert_eq!(placeholder, "blob0");
//! assert_eq!(query.code(), ".avatar = blob0;");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Prefix of generated blob argument names.
pub const BLOB_PREFIX: &str = "blob";

/// A single argument value.
///
/// Structured values go through `serde_json::Value`; binary data is kept
/// separate so it is written as MessagePack `bin` instead of a number array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    /// Structured value (null, bool, number, string, list, map).
    Value(serde_json::Value),
    /// Raw bytes.
    Blob(ByteBuf),
}

impl Arg {
    /// Build an argument from any serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Arg::Value(serde_json::to_value(value)?))
    }

    /// The bytes of a blob argument.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Arg::Blob(b) => Some(b.as_ref()),
            Arg::Value(_) => None,
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Value(value.into())
                }
            }
        )*
    };
}

impl_from_value!(
    serde_json::Value,
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
    &str,
);

/// A query against a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    scope: String,
    code: String,
    args: BTreeMap<String, Arg>,
    blobs: usize,
    timeout: Option<Duration>,
}

impl Query {
    /// Create a query without arguments.
    pub fn new(scope: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            code: code.into(),
            args: BTreeMap::new(),
            blobs: 0,
            timeout: None,
        }
    }

    /// Add a named argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Arg>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Add a named argument from any serializable value.
    pub fn try_arg<T: Serialize>(self, name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(self.arg(name, Arg::from_serialize(value)?))
    }

    /// Register a binary argument and return its placeholder name.
    ///
    /// Placeholders are numbered in call order. An explicit argument with
    /// the same name is replaced.
    pub fn blob(&mut self, data: impl Into<Vec<u8>>) -> String {
        let name = format!("{}{}", BLOB_PREFIX, self.blobs);
        self.blobs += 1;
        self.args.insert(name.clone(), Arg::Blob(ByteBuf::from(data.into())));
        name
    }

    /// Replace the code text.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Set a per-request deadline, overriding the client default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Target scope.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Code text.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Named arguments, blobs included.
    pub fn args(&self) -> &BTreeMap<String, Arg> {
        &self.args
    }

    /// Number of blobs registered so far.
    pub fn blob_count(&self) -> usize {
        self.blobs
    }

    /// Per-request deadline, if set.
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout
    }

    /// Encode the request payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.args.is_empty() {
            MsgPackCodec::encode(&(&self.scope, &self.code))
        } else {
            MsgPackCodec::encode(&(&self.scope, &self.code, &self.args))
        }
    }

    /// Decode a request payload produced by [`Query::encode`].
    pub fn decode(payload: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(payload)
    }
}

impl<'de> Deserialize<'de> for Query {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct QueryVisitor;

        impl<'de> Visitor<'de> for QueryVisitor {
            type Value = Query;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an array [scope, code, args?]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Query, A::Error> {
                let scope: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let code: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let args: BTreeMap<String, Arg> = seq.next_element()?.unwrap_or_default();

                let blobs = args.values().filter(|a| a.as_blob().is_some()).count();
                Ok(Query {
                    scope,
                    code,
                    args,
                    blobs,
                    timeout: None,
                })
            }
        }

        deserializer.deserialize_seq(QueryVisitor)
    }
}

/// Credentials sent in the authentication handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `[username, password]`.
    Password {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// Bare token string.
    Token(String),
}

impl Credentials {
    /// Username/password credentials.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Token credentials.
    pub fn token(token: impl Into<String>) -> Self {
        Credentials::Token(token.into())
    }

    /// Encode the auth payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Credentials::Password { username, password } => {
                MsgPackCodec::encode(&(username, password))
            }
            Credentials::Token(token) => MsgPackCodec::encode(token),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credentials::Token(_) => f.debug_tuple("Token").field(&"***").finish(),
        }
    }
}

/// Encode `[scope, procedure]` or `[scope, procedure, [args...]]`.
pub fn encode_run(scope: &str, procedure: &str, args: &[Arg]) -> Result<Vec<u8>> {
    if args.is_empty() {
        MsgPackCodec::encode(&(scope, procedure))
    } else {
        MsgPackCodec::encode(&(scope, procedure, args))
    }
}

/// Encode `[scope, room_id...]` for join and leave requests.
pub fn encode_rooms(scope: &str, room_ids: &[u64]) -> Result<Vec<u8>> {
    let mut items: Vec<Arg> = Vec::with_capacity(room_ids.len() + 1);
    items.push(Arg::from(scope));
    items.extend(room_ids.iter().map(|id| Arg::from(*id)));
    MsgPackCodec::encode(&items)
}

/// Encode `[scope, room_id, event, args...]`.
pub fn encode_emit(scope: &str, room_id: u64, event: &str, args: &[Arg]) -> Result<Vec<u8>> {
    let mut items: Vec<Arg> = Vec::with_capacity(args.len() + 3);
    items.push(Arg::from(scope));
    items.push(Arg::from(room_id));
    items.push(Arg::from(event));
    items.extend(args.iter().cloned());
    MsgPackCodec::encode(&items)
}
