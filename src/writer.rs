//! Dedicated writer task for outbound request frames.
//!
//! Every request goes through one mpsc channel into a single task that owns
//! the write half of the connection. Frames are therefore never interleaved
//! on the wire, and a burst of concurrent requests is flushed with one
//! vectored write.
//!
//! ```text
//! query() ─┐
//! run()   ─┼─► mpsc::Sender<OutboundFrame> ─► writer task ─► socket
//! ping()  ─┘
//! ```
//!
//! Dropping every [`WriterHandle`] closes the channel: the task drains what
//! is already queued, shuts the write half down and exits.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum queued frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded 8-byte header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for ping).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Build a frame for `payload`, deriving the header length from it.
    pub fn request(id: u16, frame_type: u8, payload: Bytes) -> Self {
        let header = Header::new(id, frame_type, payload.len() as u32);
        Self::new(&header, payload)
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum queued frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued but not yet written.
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame for writing.
    ///
    /// Waits while backpressure is active, up to the configured timeout.
    /// Fails with `ConnectionClosed` once the writer task has exited.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            ClientError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                tracing::warn!(
                    pending = self.pending.load(Ordering::Acquire),
                    "write queue still full after {:?}",
                    self.timeout
                );
                return Err(ClientError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The returned `JoinHandle` resolves once the channel is closed and the
/// write half has been shut down, or on the first write error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::debug!("writer stopped: {}", e);
            return Err(e);
        }
        tracing::trace!(frames = batch_size, "flushed batch");

        pending.fetch_sub(batch_size, Ordering::Release);
    }

    // Channel closed: everything queued has been written.
    writer.shutdown().await?;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let mut total_written = writer.write_vectored(&slices).await?;
    if total_written == 0 {
        return Err(write_zero());
    }

    // Partial write: rebuild the slices for whatever is left.
    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> ClientError {
    ClientError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// Slices covering the bytes of `batch` after the first `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{types, FrameBuffer};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_outbound_frame_request() {
        let frame = OutboundFrame::request(42, types::REQ_QUERY, Bytes::from_static(b"hello"));

        assert_eq!(frame.size(), HEADER_SIZE + 5);
        let header = Header::decode(&frame.header).unwrap();
        assert_eq!(header.id, 42);
        assert_eq!(header.frame_type, types::REQ_QUERY);
        assert_eq!(header.length, 5);
    }

    #[test]
    fn test_outbound_frame_empty_payload() {
        let frame = OutboundFrame::request(1, types::REQ_PING, Bytes::new());
        assert!(frame.payload.is_empty());
        assert_eq!(frame.size(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let frame = OutboundFrame::request(42, types::REQ_QUERY, Bytes::from_static(b"hello"));
        handle.send(frame).await.unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();

        let frames = FrameBuffer::new().push(&buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), 42);
        assert_eq!(frames[0].payload(), b"hello");
    }

    #[tokio::test]
    async fn test_writer_frames_not_interleaved() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let mut senders = Vec::new();
        for i in 0..20u16 {
            let handle = handle.clone();
            senders.push(tokio::spawn(async move {
                let payload = Bytes::from(vec![i as u8; 100 + i as usize]);
                handle
                    .send(OutboundFrame::request(i, types::REQ_QUERY, payload))
                    .await
            }));
        }
        for s in senders {
            s.await.unwrap().unwrap();
        }

        let expected: usize = (0..20).map(|i| HEADER_SIZE + 100 + i).sum();
        let mut buf = vec![0u8; expected];
        server.read_exact(&mut buf).await.unwrap();

        let mut frames = FrameBuffer::new().push(&buf).unwrap();
        assert_eq!(frames.len(), 20);
        frames.sort_by_key(|f| f.id());
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.payload_len(), 100 + i);
            assert!(frame.payload().iter().all(|b| *b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_send_after_writer_exit_is_connection_closed() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        // First write hits the closed pipe and ends the task.
        let _ = handle
            .send(OutboundFrame::request(1, types::REQ_PING, Bytes::new()))
            .await;
        assert!(task.await.unwrap().is_err());

        let result = handle
            .send(OutboundFrame::request(2, types::REQ_PING, Bytes::new()))
            .await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_backpressure_timeout() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(4));
        let handle = WriterHandle::new(tx, pending, 4, Duration::from_millis(5));

        assert!(handle.is_backpressure_active());
        let result = handle
            .send(OutboundFrame::request(1, types::REQ_PING, Bytes::new()))
            .await;
        assert!(matches!(result, Err(ClientError::BackpressureTimeout)));
        assert_eq!(handle.pending_count(), 4);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![OutboundFrame::request(
            1,
            types::REQ_QUERY,
            Bytes::from_static(b"hello"),
        )];

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());

        let batch: Vec<_> = (0..5)
            .map(|i| OutboundFrame::request(i, types::REQ_QUERY, Bytes::from_static(b"abc")))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_writer_shuts_down_on_channel_close() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle
            .send(OutboundFrame::request(3, types::REQ_PING, Bytes::new()))
            .await
            .unwrap();
        drop(handle);

        assert!(task.await.unwrap().is_ok());

        // Queued frame is delivered, then EOF.
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
    }
}
