//! Socket connect helpers.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use muxwire::transport::connect_tcp;
//!
//! let stream = connect_tcp("127.0.0.1:9200", Duration::from_secs(5)).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{ClientError, Result};

/// Open a TCP connection to `addr`, giving up after `timeout`.
///
/// Nagle's algorithm is disabled: requests are small and latency bound.
pub async fn connect_tcp<A>(addr: A, timeout: Duration) -> Result<TcpStream>
where
    A: ToSocketAddrs + Display,
{
    let target = addr.to_string();
    let stream = with_deadline(&target, timeout, TcpStream::connect(addr)).await?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr = %target, "failed to set TCP_NODELAY: {}", e);
    }
    tracing::debug!(addr = %target, "tcp connected");
    Ok(stream)
}

/// Open a Unix Domain Socket connection, giving up after `timeout`.
#[cfg(unix)]
pub async fn connect_unix<P>(path: P, timeout: Duration) -> Result<tokio::net::UnixStream>
where
    P: AsRef<std::path::Path>,
{
    let path = path.as_ref();
    let target = path.display().to_string();
    let stream = with_deadline(&target, timeout, tokio::net::UnixStream::connect(path)).await?;
    tracing::debug!(path = %target, "unix socket connected");
    Ok(stream)
}

async fn with_deadline<T, F>(target: &str, timeout: Duration, connect: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ClientError::Connect(format!("{}: {}", target, e))),
        Err(_) => Err(ClientError::Connect(format!(
            "{}: timed out after {:?}",
            target, timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(
            connect_tcp(addr, Duration::from_secs(1)),
            listener.accept()
        );
        let client = client.unwrap();
        assert!(accepted.is_ok());
        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = connect_tcp(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let never = std::future::pending::<std::io::Result<()>>();
        let err = with_deadline("nowhere", Duration::from_millis(10), never)
            .await
            .unwrap_err();
        match err {
            ClientError::Connect(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_unix_missing_path() {
        let err = connect_unix("/nonexistent/muxwire-test.sock", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
    }
}
