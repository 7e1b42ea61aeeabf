//! Transport module - stream connections to the server.
//!
//! Provides:
//! - TCP connections (all platforms)
//! - Unix Domain Sockets (Unix only)
//!
//! Both connect with a deadline and report failures as
//! [`ClientError::Connect`](crate::error::ClientError::Connect).

mod socket;

#[cfg(unix)]
pub use socket::connect_unix;
pub use socket::connect_tcp;
