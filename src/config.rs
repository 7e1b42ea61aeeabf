//! Client configuration.
//!
//! Every field has a documented default; [`ClientBuilder`](crate::ClientBuilder)
//! exposes a setter for each one.

use std::time::Duration;

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Default time allowed to open the transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for the authentication round trip.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for requests that do not set their own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time `close()` waits for queued frames to be flushed.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Size of the socket read buffer.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time allowed to open the transport.
    pub connect_timeout: Duration,
    /// Time allowed for the authentication round trip.
    pub auth_timeout: Duration,
    /// Deadline for requests without their own. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Time `close()` waits for queued frames to be flushed.
    pub close_timeout: Duration,
    /// Largest payload accepted from the server.
    pub max_payload_size: u32,
    /// Outbound queue settings.
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig {
                max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
                channel_capacity: DEFAULT_CHANNEL_CAPACITY,
                backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            },
        }
    }
}
