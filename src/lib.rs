//! # muxwire
//!
//! Async client for a binary, multiplexed request/response protocol with
//! server-pushed events, spoken over a single TCP or Unix socket connection.
//!
//! ## Architecture
//!
//! - **Framing**: 8-byte little-endian header (`length`, `id`, `type`,
//!   `checkbit`) followed by a MessagePack payload
//! - **Correlation**: every request carries a 16-bit id; responses may come
//!   back in any order and are matched by id
//! - **Events**: push frames are routed to subscribers by scope, off the
//!   read loop
//!
//! ## Example
//!
//! ```ignore
//! use muxwire::{Client, Credentials, EventScope, Query};
//!
//! #[tokio::main]
//! async fn main() -> muxwire::Result<()> {
//!     let client = Client::builder().build();
//!     client
//!         .connect_and_authenticate("127.0.0.1:9200", &Credentials::password("admin", "pass"))
//!         .await?;
//!
//!     client.subscribe(EventScope::Room(17), |event| async move {
//!         println!("{:?}", event.kind);
//!     });
//!
//!     let mut query = Query::new("//stuff", "");
//!     let blob = query.blob(b"\x00\x01".to_vec());
//!     let query = query.with_code(format!(".data = {};", blob));
//!     client.query::<()>(query).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod pending;
pub mod protocol;
pub mod request;
pub mod transport;
pub mod writer;

mod client;

pub use client::{Client, ClientBuilder, ConnectionState};
pub use config::ClientConfig;
pub use error::{ClientError, ErrorKind, Result};
pub use events::{Event, EventKind, EventScope, SubscriptionId};
pub use request::{Arg, Credentials, Query};
