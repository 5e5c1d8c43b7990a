//! Single multiplexed connection to a Hot Rod server.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use hotrod_core::protocol::{
    next_message_id, ClientIntelligence, Codec, DataFormat, ListenerParams, OpCode, PingResponse,
    ProtocolVersion, RequestHeader, Status, WireReader,
};
use hotrod_core::protocol::wire::write_array;
use hotrod_core::{HotRodError, Result};

use crate::cluster::RoutingTable;
use crate::config::{ClientConfig, StreamingConfig};
use crate::listener::{ListenerHandle, ListenerId, ListenerRegistry};
use crate::stream::{ChunkSink, ChunkedWriter};

use super::decoder::{Inbound, ResponseDecoder};
use super::holder::CodecHolder;
use super::pending::{Pending, PendingResponse, StreamPending, StreamedValue};

/// Frames queued for the writer task before callers wait.
const OUTBOUND_CAPACITY: usize = 1024;
/// Initial capacity of the inbound buffer.
const READ_BUFFER_CAPACITY: usize = 8192;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State shared by a connection handle and its I/O tasks.
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) server: String,
    pub(crate) codec: CodecHolder,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pending: Mutex<VecDeque<Box<dyn PendingResponse>>>,
    valid: AtomicBool,
}

impl Shared {
    pub(crate) fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Box<dyn PendingResponse>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Queues `pending` unless the connection is already invalid.
    fn enqueue(&self, pending: Box<dyn PendingResponse>) -> std::result::Result<(), Box<dyn PendingResponse>> {
        let mut queue = self.lock_pending();
        if !self.is_valid() {
            return Err(pending);
        }
        queue.push_back(pending);
        Ok(())
    }

    /// Marks the connection unusable and fails everything still pending.
    fn invalidate(&self, reason: &str) {
        let drained: Vec<Box<dyn PendingResponse>> = {
            let mut queue = self.lock_pending();
            if !self.valid.swap(false, Ordering::AcqRel) && queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };

        if drained.is_empty() {
            info!(connection = %self.id, server = %self.server, reason = reason, "connection closed");
        } else {
            warn!(
                connection = %self.id,
                server = %self.server,
                reason = reason,
                pending = drained.len(),
                "connection closed with requests in flight"
            );
        }
        for pending in drained {
            pending.fail(self.closed_error(reason));
        }
    }

    fn closed_error(&self, reason: &str) -> HotRodError {
        HotRodError::Connection(format!("{} ({}): {}", self.server, self.id, reason))
    }
}

/// A frame handed to the writer task.
struct Outbound {
    frame: Bytes,
    pending: Option<Box<dyn PendingResponse>>,
    written: Option<oneshot::Sender<Result<()>>>,
}

impl Outbound {
    fn fail(self, shared: &Shared, reason: &str) {
        if let Some(pending) = self.pending {
            pending.fail(shared.closed_error(reason));
        }
        if let Some(written) = self.written {
            let _ = written.send(Err(shared.closed_error(reason)));
        }
    }
}

/// A connection to a single Hot Rod server.
///
/// Requests may be issued concurrently from any task. They are written in
/// submission order and their responses are decoded by one reader task,
/// which also delivers push events to registered listeners.
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    write_gate: Arc<Semaphore>,
    socket_timeout: Duration,
    max_version: ProtocolVersion,
    intelligence: ClientIntelligence,
    streaming: StreamingConfig,
    created_at: Instant,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("server", &self.shared.server)
            .field("version", &self.shared.codec.current().version())
            .field("valid", &self.shared.is_valid())
            .finish()
    }
}

impl Connection {
    /// Establishes a new connection to `address`.
    pub async fn connect(
        address: SocketAddr,
        config: &ClientConfig,
        routing: Arc<RoutingTable>,
        listeners: Arc<ListenerRegistry>,
    ) -> Result<Self> {
        let connect_timeout = config.network().connection_timeout();
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                HotRodError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    address, connect_timeout
                ))
            })?
            .map_err(|e| HotRodError::Connection(format!("failed to connect to {}: {}", address, e)))?;

        if config.network().tcp_nodelay() {
            stream.set_nodelay(true).map_err(|e| {
                HotRodError::Connection(format!("failed to set TCP_NODELAY: {}", e))
            })?;
        }

        let connection = Self::from_stream(stream, address.to_string(), config, routing, listeners);
        info!(connection = %connection.id(), address = %address, "established connection");
        Ok(connection)
    }

    /// Wraps an established byte stream.
    ///
    /// Must be called within a Tokio runtime; the connection spawns its
    /// reader and writer tasks here.
    pub fn from_stream<S>(
        stream: S,
        server: impl Into<String>,
        config: &ClientConfig,
        routing: Arc<RoutingTable>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            id: ConnectionId::new(),
            server: server.into(),
            codec: CodecHolder::new(Codec::new(config.max_protocol_version())),
            routing,
            listeners,
            pending: Mutex::new(VecDeque::new()),
            valid: AtomicBool::new(true),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        let frames = FramedRead::with_capacity(
            read_half,
            ResponseDecoder::new(Arc::clone(&shared)),
            READ_BUFFER_CAPACITY,
        );
        let reader = tokio::spawn(read_loop(frames, Arc::clone(&shared)));
        let writer = tokio::spawn(write_loop(write_half, receiver, Arc::clone(&shared)));

        Self {
            shared,
            outbound,
            write_gate: Arc::new(Semaphore::new(1)),
            socket_timeout: config.network().socket_timeout(),
            max_version: config.max_protocol_version(),
            intelligence: config.intelligence(),
            streaming: *config.streaming(),
            created_at: Instant::now(),
            reader,
            writer,
        }
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Returns the server this connection talks to.
    pub fn server(&self) -> &str {
        &self.shared.server
    }

    /// Returns when this connection was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns the codec currently in use.
    pub fn codec(&self) -> Codec {
        self.shared.codec.current()
    }

    /// Returns false once the connection has failed or been closed.
    pub fn is_valid(&self) -> bool {
        self.shared.is_valid()
    }

    /// Returns the number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Builds a request header for `cache_name`, stamped with this
    /// connection's intelligence and the cache's current topology.
    pub fn request(&self, opcode: OpCode, cache_name: &[u8]) -> RequestHeader {
        let header = RequestHeader::new(opcode, Bytes::copy_from_slice(cache_name))
            .with_intelligence(self.intelligence);
        self.shared.routing.prepare(header)
    }

    fn encode<W>(&self, codec: &Codec, header: &RequestHeader, write_body: W) -> Result<Bytes>
    where
        W: FnOnce(&Codec, &mut BytesMut) -> Result<()>,
    {
        let mut buf = BytesMut::with_capacity(64);
        codec.write_header(&mut buf, header);
        write_body(codec, &mut buf)?;
        Ok(buf.freeze())
    }

    async fn submit(&self, frame: Bytes, pending: Box<dyn PendingResponse>) -> Result<()> {
        if !self.is_valid() {
            return Err(self.shared.closed_error("connection is closed"));
        }
        let _gate = self
            .write_gate
            .acquire()
            .await
            .map_err(|_| self.shared.closed_error("connection is closed"))?;
        self.outbound
            .send(Outbound {
                frame,
                pending: Some(pending),
                written: None,
            })
            .await
            .map_err(|_| self.shared.closed_error("writer stopped"))
    }

    async fn await_response<T>(&self, message_id: u64, receiver: oneshot::Receiver<Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.socket_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.shared.closed_error("response channel closed")),
            Err(_) => {
                debug!(
                    connection = %self.shared.id,
                    message_id = message_id,
                    "request timed out, response will be discarded"
                );
                Err(HotRodError::Timeout(format!(
                    "no response to message {} from {} within {:?}",
                    message_id, self.shared.server, self.socket_timeout
                )))
            }
        }
    }

    /// Sends a request and waits for its decoded response.
    ///
    /// `write_body` appends the operation body after the header; `read_body`
    /// decodes the body of a successful response. Server error statuses are
    /// returned as errors without calling `read_body`. Dropping the returned
    /// future abandons the wait but not the request: its response is still
    /// read and then discarded.
    pub async fn execute<T, W, F>(&self, mut header: RequestHeader, write_body: W, read_body: F) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&Codec, &mut BytesMut) -> Result<()>,
        F: Fn(&Codec, Status, &mut WireReader<'_>) -> Result<T> + Send + 'static,
    {
        header.message_id = next_message_id();
        let codec = self.codec();
        let frame = self.encode(&codec, &header, write_body)?;
        let message_id = header.message_id;

        let (sender, receiver) = oneshot::channel();
        self.submit(frame, Box::new(Pending::new(codec, header, read_body, sender)))
            .await?;
        self.await_response(message_id, receiver).await
    }

    /// Sends a request whose successful response is followed by a raw
    /// payload, and returns a reader over that payload.
    ///
    /// `read_body` returns the value's metadata and payload length, or
    /// `None` when there is no value. The payload occupies the connection
    /// until it has been read in full.
    pub async fn execute_get_stream<T, W, F>(
        &self,
        mut header: RequestHeader,
        write_body: W,
        read_body: F,
    ) -> Result<Option<StreamedValue<T>>>
    where
        T: Send + 'static,
        W: FnOnce(&Codec, &mut BytesMut) -> Result<()>,
        F: Fn(&Codec, Status, &mut WireReader<'_>) -> Result<Option<(T, u64)>> + Send + 'static,
    {
        header.message_id = next_message_id();
        let codec = self.codec();
        let frame = self.encode(&codec, &header, write_body)?;
        let message_id = header.message_id;

        let (sender, receiver) = oneshot::channel();
        self.submit(frame, Box::new(StreamPending::new(codec, header, read_body, sender)))
            .await?;
        self.await_response(message_id, receiver).await
    }

    /// Sends a request whose body continues with a chunked value.
    ///
    /// Other requests on this connection wait until the returned upload is
    /// finished or dropped. Dropping an unfinished upload closes the
    /// connection.
    pub async fn execute_put_stream<T, W, F>(
        &self,
        mut header: RequestHeader,
        write_body: W,
        read_body: F,
    ) -> Result<PutStream<T>>
    where
        T: Send + 'static,
        W: FnOnce(&Codec, &mut BytesMut) -> Result<()>,
        F: Fn(&Codec, Status, &mut WireReader<'_>) -> Result<T> + Send + 'static,
    {
        if !self.is_valid() {
            return Err(self.shared.closed_error("connection is closed"));
        }
        header.message_id = next_message_id();
        let codec = self.codec();
        let frame = self.encode(&codec, &header, write_body)?;
        let message_id = header.message_id;

        let gate = Arc::clone(&self.write_gate)
            .acquire_owned()
            .await
            .map_err(|_| self.shared.closed_error("connection is closed"))?;
        let (sender, receiver) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame,
                pending: Some(Box::new(Pending::new(codec, header, read_body, sender))),
                written: None,
            })
            .await
            .map_err(|_| self.shared.closed_error("writer stopped"))?;

        let sink = Arc::new(ConnectionSink {
            outbound: self.outbound.clone(),
            _gate: gate,
        });
        Ok(PutStream {
            writer: ChunkedWriter::new(sink, &self.streaming),
            response: Some(receiver),
            shared: Arc::clone(&self.shared),
            message_id,
            socket_timeout: self.socket_timeout,
        })
    }

    /// Pings the server and switches to the newest protocol version both
    /// sides speak, up to the configured maximum.
    pub async fn probe(&self) -> Result<PingResponse> {
        let header = self.request(OpCode::Ping, &[]);
        let ping = self
            .execute(header, |_, _| Ok(()), |codec, status, reader| codec.read_ping(status, reader))
            .await?;

        let negotiated = Codec::new(ping.negotiate(self.max_version));
        let installed = self.shared.codec.negotiate(negotiated);
        debug!(
            connection = %self.shared.id,
            server_version = ?ping.server_version,
            version = %installed.version(),
            operations = ping.operations.len(),
            "probed server capabilities"
        );
        Ok(ping)
    }

    /// Registers a client listener on `cache_name`.
    ///
    /// The listener is registered locally before the request is sent, so
    /// events replayed during registration are not lost.
    pub async fn add_listener(
        &self,
        cache_name: &[u8],
        params: ListenerParams,
        data_format: Option<DataFormat>,
    ) -> Result<ListenerHandle> {
        let id = ListenerId::new();
        let receiver = self.shared.listeners.register(&id);
        let handle = ListenerHandle::new(id.clone(), Arc::clone(&self.shared.listeners), receiver);

        let mut header = self.request(OpCode::AddClientListener, cache_name);
        if let Some(format) = data_format {
            header = header.with_data_format(format);
        }
        let listener_id = id.as_bytes().clone();
        self.execute(
            header,
            move |codec, buf| {
                write_array(buf, &listener_id);
                codec.write_listener_params(buf, &params);
                codec.write_listener_interests(buf, params.interests);
                Ok(())
            },
            |_, _, _| Ok(()),
        )
        .await?;

        debug!(connection = %self.shared.id, listener = %id, "added client listener");
        Ok(handle)
    }

    /// Removes a client listener. Returns false if the server did not know
    /// it.
    pub async fn remove_listener(&self, cache_name: &[u8], listener: &ListenerHandle) -> Result<bool> {
        let header = self.request(OpCode::RemoveClientListener, cache_name);
        let listener_id = listener.id().as_bytes().clone();
        let removed = self
            .execute(
                header,
                move |_, buf| {
                    write_array(buf, &listener_id);
                    Ok(())
                },
                |_, status, _| Ok(status.is_success()),
            )
            .await?;
        self.shared.listeners.remove(listener.id().as_bytes());
        Ok(removed)
    }

    /// Closes the connection, failing every request still in flight.
    pub fn close(&self) {
        self.shared.invalidate("closed by client");
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writes upload chunks through a connection's writer task.
struct ConnectionSink {
    outbound: mpsc::Sender<Outbound>,
    _gate: OwnedSemaphorePermit,
}

#[async_trait]
impl ChunkSink for ConnectionSink {
    async fn write_frame(&self, frame: Bytes) -> Result<()> {
        let (written, done) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame,
                pending: None,
                written: Some(written),
            })
            .await
            .map_err(|_| HotRodError::Connection("writer stopped".to_string()))?;
        done.await
            .map_err(|_| HotRodError::Connection("writer stopped".to_string()))?
    }
}

/// An upload in progress on a connection.
pub struct PutStream<T> {
    writer: ChunkedWriter,
    response: Option<oneshot::Receiver<Result<T>>>,
    shared: Arc<Shared>,
    message_id: u64,
    socket_timeout: Duration,
}

impl<T> std::fmt::Debug for PutStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutStream")
            .field("message_id", &self.message_id)
            .field("writer", &self.writer)
            .finish()
    }
}

impl<T> PutStream<T> {
    /// Appends bytes to the value.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    /// Returns the number of value bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Ends the value and waits for the server's response.
    pub async fn finish(mut self) -> Result<T> {
        self.writer.close().await?;
        let receiver = self
            .response
            .take()
            .ok_or_else(|| HotRodError::Stream("upload already finished".to_string()))?;
        match tokio::time::timeout(self.socket_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.shared.closed_error("response channel closed")),
            Err(_) => Err(HotRodError::Timeout(format!(
                "no response to upload {} within {:?}",
                self.message_id, self.socket_timeout
            ))),
        }
    }
}

impl<T> Drop for PutStream<T> {
    fn drop(&mut self) {
        if !self.writer.is_closed() {
            // The server is still waiting for chunks.
            self.shared.invalidate("upload abandoned");
        }
    }
}

async fn read_loop<R>(mut frames: FramedRead<R, ResponseDecoder>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match frames.next().await {
            Some(Ok(Inbound::Response { message_id, fatal })) => {
                trace!(connection = %shared.id, message_id = message_id, "delivered response");
                if let Some(reason) = fatal {
                    break reason;
                }
            }
            Some(Ok(Inbound::Event(Ok(event)))) => {
                shared.listeners.dispatch(event);
            }
            Some(Ok(Inbound::Event(Err(e)))) => {
                shared.listeners.stats().record_unexpected();
                warn!(connection = %shared.id, error = %e, "discarded event");
            }
            Some(Ok(Inbound::StreamData { data, sender })) => {
                // A dropped reader only discards the payload.
                let _ = sender.send(Ok(data)).await;
            }
            Some(Err(e)) => {
                warn!(connection = %shared.id, server = %shared.server, error = %e, "failed to decode response");
                break e.to_string();
            }
            None => break "closed by server".to_string(),
        }
    };

    if let Some(sender) = frames.decoder_mut().take_stream() {
        let _ = sender.send(Err(shared.closed_error(&reason))).await;
    }
    shared.invalidate(&reason);
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Outbound>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let Outbound {
            frame,
            pending,
            written,
        } = item;

        if let Some(pending) = pending {
            if let Err(pending) = shared.enqueue(pending) {
                pending.fail(shared.closed_error("connection is closed"));
                if let Some(written) = written {
                    let _ = written.send(Err(shared.closed_error("connection is closed")));
                }
                continue;
            }
        } else if !shared.is_valid() {
            Outbound {
                frame,
                pending: None,
                written,
            }
            .fail(&shared, "connection is closed");
            continue;
        }

        let result = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                if let Some(written) = written {
                    let _ = written.send(Ok(()));
                }
            }
            Err(e) => {
                let reason = format!("write failed: {}", e);
                shared.invalidate(&reason);
                if let Some(written) = written {
                    let _ = written.send(Err(shared.closed_error(&reason)));
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
