//! Connection manager.
//!
//! A [`Client`] owns at most one live connection at a time. Each connection
//! is a `Session`: the writer task, the read loop and the table of pending
//! requests. The lifecycle is:
//! 1. `connect()` opens the transport and spawns both tasks (`Authenticating`)
//! 2. `authenticate()` performs the handshake (`Ready`)
//! 3. requests are written with a fresh id and resolved by the read loop
//! 4. `close()`, EOF or a framing error tears the session down (`Closed`)
//!
//! There is no automatic reconnect. After `Closed`, calling `connect()`
//! again starts a new session; event subscriptions are kept.
//!
//! # Example
//!
//! ```ignore
//! use muxwire::{Client, Credentials, Query};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .request_timeout(std::time::Duration::from_secs(5))
//!         .build();
//!
//!     client
//!         .connect_and_authenticate("127.0.0.1:9200", &Credentials::password("admin", "pass"))
//!         .await?;
//!
//!     let two: i64 = client.query(Query::new("//stuff", "1 + 1;")).await?;
//!     assert_eq!(two, 2);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::ToSocketAddrs;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec::MsgPackCodec;
use crate::config::{ClientConfig, READ_BUFFER_SIZE};
use crate::error::{map_error_payload, ClientError, Result};
use crate::events::{EventDispatcher, EventHandler, EventScope, SubscriptionId};
use crate::pending::{Completion, PendingTable};
use crate::protocol::{types, Frame, FrameBuffer};
use crate::request::{encode_emit, encode_rooms, encode_run, Arg, Credentials, Query};
use crate::transport;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection has been opened yet.
    Disconnected,
    /// Transport is being opened.
    Connecting,
    /// Transport is open, handshake not done.
    Authenticating,
    /// Accepting requests.
    Ready,
    /// `close()` in progress.
    Closing,
    /// Torn down.
    Closed,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Time allowed to open the transport in `connect_and_authenticate`.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Time allowed for the authentication round trip.
    ///
    /// Default: 10 seconds
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    /// Deadline for requests that do not set their own.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Let requests without their own deadline wait indefinitely.
    pub fn no_request_timeout(mut self) -> Self {
        self.config.request_timeout = None;
        self
    }

    /// Time `close()` waits for queued frames to be flushed.
    ///
    /// Default: 2 seconds
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Largest payload accepted from the server.
    ///
    /// Default: 64 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the maximum queued frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Build the client. No connection is opened yet.
    pub fn build(self) -> Client {
        Client::new(self.config)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a connection manager. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    session: Mutex<Option<Arc<Session>>>,
    events: Arc<EventDispatcher>,
}

impl Client {
    /// Create a client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                session: Mutex::new(None),
                events: Arc::new(EventDispatcher::new()),
            }),
        }
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        match self.inner.session.lock().as_ref() {
            Some(session) => session.shared.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(0, |s| s.shared.pending.len())
    }

    /// Open a TCP connection. The client ends up in `Authenticating`.
    pub async fn connect<A>(&self, addr: A, timeout: Duration) -> Result<()>
    where
        A: ToSocketAddrs + Display,
    {
        let session = self.begin()?;
        match transport::connect_tcp(addr, timeout).await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                session.start(reader, writer, &self.inner)
            }
            Err(e) => {
                session.shared.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// Open a Unix Domain Socket connection. The client ends up in
    /// `Authenticating`.
    #[cfg(unix)]
    pub async fn connect_unix<P>(&self, path: P, timeout: Duration) -> Result<()>
    where
        P: AsRef<std::path::Path>,
    {
        let session = self.begin()?;
        match transport::connect_unix(path, timeout).await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                session.start(reader, writer, &self.inner)
            }
            Err(e) => {
                session.shared.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// Drive an already established stream. The client ends up in
    /// `Authenticating`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = self.begin()?;
        let (reader, writer) = tokio::io::split(stream);
        session.start(reader, writer, &self.inner)
    }

    /// Perform the authentication handshake.
    ///
    /// On rejection the connection is closed and `ClientError::Auth` is
    /// returned with the server's message.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let session = self.session()?;
        let payload = credentials.encode()?;
        let timeout = Some(self.inner.config.auth_timeout);

        match session.request(types::REQ_AUTH, payload, timeout).await {
            Ok(_) => {
                if session
                    .shared
                    .advance(ConnectionState::Authenticating, ConnectionState::Ready)
                {
                    tracing::debug!("authenticated");
                    Ok(())
                } else {
                    Err(ClientError::ConnectionClosed)
                }
            }
            Err(ClientError::Server { message, code, .. }) => {
                tracing::warn!(code, "authentication rejected: {}", message);
                session.close(self.inner.config.close_timeout).await;
                Err(ClientError::Auth(message))
            }
            Err(e @ ClientError::Timeout(_)) => {
                session.close(self.inner.config.close_timeout).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// `connect` with the configured timeout followed by `authenticate`.
    pub async fn connect_and_authenticate<A>(&self, addr: A, credentials: &Credentials) -> Result<()>
    where
        A: ToSocketAddrs + Display,
    {
        self.connect(addr, self.inner.config.connect_timeout).await?;
        self.authenticate(credentials).await
    }

    /// Run a query and decode its result.
    pub async fn query<T: DeserializeOwned>(&self, query: Query) -> Result<T> {
        let payload = self.query_raw(query).await?;
        MsgPackCodec::decode(&payload)
    }

    /// Run a query and return the raw MessagePack result.
    pub async fn query_raw(&self, query: Query) -> Result<Bytes> {
        let timeout = query.deadline().or(self.inner.config.request_timeout);
        let payload = query.encode()?;
        self.send(types::REQ_QUERY, payload, timeout).await
    }

    /// Run a stored procedure with positional arguments.
    pub async fn run<T: DeserializeOwned>(
        &self,
        scope: &str,
        procedure: &str,
        args: &[Arg],
    ) -> Result<T> {
        let payload = encode_run(scope, procedure, args)?;
        let result = self
            .send(types::REQ_RUN, payload, self.inner.config.request_timeout)
            .await?;
        MsgPackCodec::decode(&result)
    }

    /// Join rooms. The result holds the room id for each joined room and
    /// `None` for rooms that do not exist.
    pub async fn join(&self, scope: &str, room_ids: &[u64]) -> Result<Vec<Option<u64>>> {
        let payload = encode_rooms(scope, room_ids)?;
        let result = self
            .send(types::REQ_JOIN, payload, self.inner.config.request_timeout)
            .await?;
        MsgPackCodec::decode(&result)
    }

    /// Leave rooms. Same result shape as [`join`](Self::join).
    pub async fn leave(&self, scope: &str, room_ids: &[u64]) -> Result<Vec<Option<u64>>> {
        let payload = encode_rooms(scope, room_ids)?;
        let result = self
            .send(types::REQ_LEAVE, payload, self.inner.config.request_timeout)
            .await?;
        MsgPackCodec::decode(&result)
    }

    /// Emit an event in a room.
    pub async fn emit(&self, scope: &str, room_id: u64, event: &str, args: &[Arg]) -> Result<()> {
        let payload = encode_emit(scope, room_id, event, args)?;
        self.send(types::REQ_EMIT, payload, self.inner.config.request_timeout)
            .await?;
        Ok(())
    }

    /// Round trip without payload.
    pub async fn ping(&self) -> Result<()> {
        self.send(types::REQ_PING, Vec::new(), self.inner.config.request_timeout)
            .await?;
        Ok(())
    }

    /// Subscribe to pushed events. Subscriptions outlive reconnects.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<H: EventHandler>(&self, scope: EventScope, handler: H) -> SubscriptionId {
        self.inner.events.subscribe(scope, handler)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Close the connection.
    ///
    /// Queued frames are flushed (bounded by the close timeout) and the
    /// transport is shut down. The state then becomes `Closed`, and only
    /// after that does every pending request fail with `ConnectionClosed`,
    /// so a woken caller already sees `Closed`. Does nothing when no
    /// connection is open.
    pub async fn close(&self) {
        let session = self.inner.session.lock().clone();
        if let Some(session) = session {
            session.close(self.inner.config.close_timeout).await;
        }
    }

    async fn send(&self, frame_type: u8, payload: Vec<u8>, timeout: Option<Duration>) -> Result<Bytes> {
        self.session()?.request(frame_type, payload, timeout).await
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.inner
            .session
            .lock()
            .clone()
            .ok_or(ClientError::NotReady(ConnectionState::Disconnected))
    }

    /// Install a fresh session in `Connecting`, unless one is still open.
    fn begin(&self) -> Result<Arc<Session>> {
        let mut slot = self.inner.session.lock();
        if let Some(current) = slot.as_ref() {
            let state = current.shared.state();
            if state != ConnectionState::Closed {
                return Err(ClientError::Connect(format!(
                    "connection already open (state: {:?})",
                    state
                )));
            }
        }
        let session = Arc::new(Session::new());
        *slot = Some(session.clone());
        Ok(session)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

/// State shared between a session and its read loop.
struct Shared {
    state: Mutex<ConnectionState>,
    pending: PendingTable,
    writer: Mutex<Option<WriterHandle>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Drop the session's writer handle. Once in-flight sends finish, the
    /// writer task drains its queue and shuts the write half down.
    fn release_writer(&self) {
        drop(self.writer.lock().take());
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "connection state");
            *state = next;
        }
    }

    /// Move from `from` to `to`; fails if the state changed in between.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        tracing::debug!(?from, ?to, "connection state");
        *state = to;
        true
    }
}

/// One connection: writer task, read loop and pending table.
struct Session {
    shared: Arc<Shared>,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Connecting),
                pending: PendingTable::new(),
                writer: Mutex::new(None),
            }),
            writer_task: Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    fn start<R, W>(&self, reader: R, writer: W, client: &ClientInner) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // Before the read loop exists, so an immediate EOF cannot be
        // overwritten.
        if !self
            .shared
            .advance(ConnectionState::Connecting, ConnectionState::Authenticating)
        {
            return Err(ClientError::ConnectionClosed);
        }

        let (handle, writer_task) = spawn_writer_task(writer, client.config.writer.clone());
        *self.shared.writer.lock() = Some(handle);
        *self.writer_task.lock() = Some(writer_task);

        let reader_task = tokio::spawn(read_loop(
            reader,
            self.shared.clone(),
            client.events.clone(),
            client.config.max_payload_size,
        ));
        *self.reader_task.lock() = Some(reader_task);
        Ok(())
    }

    async fn request(
        &self,
        frame_type: u8,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let state = self.shared.state();
        let accepted = match frame_type {
            types::REQ_AUTH => state == ConnectionState::Authenticating,
            _ => state == ConnectionState::Ready,
        };
        if !accepted {
            return Err(ClientError::NotReady(state));
        }
        let writer = self
            .shared
            .writer
            .lock()
            .clone()
            .ok_or(ClientError::NotReady(state))?;

        // Registered before the write, so the response cannot beat it.
        let handle = self.shared.pending.register(timeout)?;
        let mut in_flight = InFlight {
            table: &self.shared.pending,
            id: handle.id,
            rx: handle.rx,
        };
        tracing::trace!(
            id = handle.id,
            frame_type = types::name(frame_type),
            len = payload.len(),
            "sending request"
        );

        let sent = writer
            .send(OutboundFrame::request(handle.id, frame_type, Bytes::from(payload)))
            .await;
        // The clone must not outlive the send, or close() cannot end the writer.
        drop(writer);
        sent?;

        match handle.deadline {
            Some(deadline) => in_flight.wait_until(deadline).await,
            None => in_flight.wait().await,
        }
    }

    async fn close(&self, flush_timeout: Duration) {
        {
            let mut state = self.shared.state.lock();
            if *state == ConnectionState::Closing {
                return;
            }
            if *state != ConnectionState::Closed {
                tracing::debug!(from = ?*state, "closing connection");
                *state = ConnectionState::Closing;
            }
        }

        self.shared.release_writer();
        let writer_task = self.writer_task.lock().take();
        if let Some(mut task) = writer_task {
            match tokio::time::timeout(flush_timeout, &mut task).await {
                Ok(Ok(Err(e))) => tracing::debug!("writer ended with error: {}", e),
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("writer did not flush within {:?}", flush_timeout);
                    task.abort();
                }
            }
        }

        let reader_task = self.reader_task.lock().take();
        if let Some(task) = reader_task {
            task.abort();
            let _ = task.await;
        }

        // Closed first: a caller woken by the cancellation must observe it.
        self.shared.set_state(ConnectionState::Closed);
        self.shared.pending.cancel_all(&ClientError::ConnectionClosed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
        self.shared.set_state(ConnectionState::Closed);
        self.shared.pending.cancel_all(&ClientError::ConnectionClosed);
        self.shared.release_writer();
    }
}

/// Caller side of one request. Dropping it before resolution removes the
/// table entry.
struct InFlight<'a> {
    table: &'a PendingTable,
    id: u16,
    rx: oneshot::Receiver<Completion>,
}

impl InFlight<'_> {
    async fn wait(&mut self) -> Result<Bytes> {
        flatten((&mut self.rx).await)
    }

    async fn wait_until(&mut self, deadline: tokio::time::Instant) -> Result<Bytes> {
        tokio::select! {
            result = &mut self.rx => flatten(result),
            _ = tokio::time::sleep_until(deadline) => {
                // Either this resolves the entry with a timeout or a response
                // got there first; the receiver reports whichever won.
                self.table.expire(self.id);
                flatten((&mut self.rx).await)
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.rx.close();
        self.table.forget(self.id);
    }
}

fn flatten(result: std::result::Result<Completion, oneshot::error::RecvError>) -> Result<Bytes> {
    result.unwrap_or(Err(ClientError::ConnectionClosed))
}

/// Read frames until EOF or error, then cancel everything still pending.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, events: Arc<EventDispatcher>, max_payload: u32)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let outcome: Result<()> = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e.into()),
        };

        match frame_buffer.push(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    route(&shared, &events, frame);
                }
            }
            Err(e) => break Err(e),
        }
        // Frames ahead of a bad header were routed above.
        if let Some(e) = frame_buffer.error() {
            break Err(e);
        }
    };

    match outcome {
        Ok(()) => tracing::debug!("server closed the connection"),
        Err(e) => tracing::error!("Read loop error: {}", e),
    }

    shared.set_state(ConnectionState::Closed);
    shared.pending.cancel_all(&ClientError::ConnectionClosed);
    shared.release_writer();
}

fn route(shared: &Shared, events: &EventDispatcher, frame: Frame) {
    let id = frame.id();
    match frame.frame_type() {
        types::RES_OK | types::RES_PING => {
            shared.pending.complete(id, Ok(Bytes::new()));
        }
        types::RES_DATA => {
            shared.pending.complete(id, Ok(frame.payload));
        }
        types::RES_ERROR => {
            let err = map_error_payload(&frame.payload);
            tracing::debug!(id, "request failed: {}", err);
            shared.pending.complete(id, Err(err));
        }
        t if types::is_push(t) => {
            events.dispatch(&frame);
        }
        t => {
            tracing::warn!(id, frame_type = t, "dropping frame with unknown type");
        }
    }
}
