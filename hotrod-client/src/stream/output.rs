//! Chunked value upload.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use hotrod_core::protocol::wire::{vint_size, write_vint};
use hotrod_core::{HotRodError, Result};

use crate::config::StreamingConfig;

/// Largest payload carried by one frame.
const MAX_FRAME_PAYLOAD: usize = i32::MAX as usize;

/// Destination of length-prefixed chunk frames.
#[async_trait]
pub trait ChunkSink: Send + Sync + 'static {
    /// Writes one encoded frame, returning once it reached the network.
    async fn write_frame(&self, frame: Bytes) -> Result<()>;
}

type Queued = (Bytes, OwnedSemaphorePermit);

/// Latched fault shared between a stream and its background writer.
#[derive(Debug, Default, Clone)]
pub(crate) struct Latch(Arc<Mutex<Option<String>>>);

impl Latch {
    pub(crate) fn set(&self, message: String) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.0.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(message) => Err(HotRodError::Stream(message.clone())),
            None => Ok(()),
        }
    }
}

/// Buffers writes into fixed-size chunks and sends each as a
/// `[vint length][payload]` frame, ending with a zero-length frame.
///
/// At most `chunks_in_flight` frames are queued or being written at once;
/// [`write`](Self::write) waits for a permit when the limit is reached.
pub struct ChunkedWriter {
    chunk: BytesMut,
    chunk_size: usize,
    permits: Arc<Semaphore>,
    queue: Option<mpsc::UnboundedSender<Queued>>,
    pump: Option<JoinHandle<()>>,
    latch: Latch,
    written: u64,
    frames: u64,
    closed: bool,
}

impl std::fmt::Debug for ChunkedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedWriter")
            .field("chunk_size", &self.chunk_size)
            .field("buffered", &self.chunk.len())
            .field("written", &self.written)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ChunkedWriter {
    /// Creates a writer using the configured chunk size and in-flight limit.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new<S: ChunkSink>(sink: Arc<S>, config: &StreamingConfig) -> Self {
        Self::with_limits(sink, config.chunk_size(), config.chunks_in_flight())
    }

    /// Creates a writer with explicit limits. Zero values are raised to 1.
    ///
    /// Must be called within a Tokio runtime: frames are handed to the sink
    /// by a spawned task.
    pub fn with_limits<S: ChunkSink>(sink: Arc<S>, chunk_size: usize, chunks_in_flight: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let latch = Latch::default();
        let (queue, receiver) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_frames(sink, receiver, latch.clone()));
        Self {
            chunk: BytesMut::with_capacity(chunk_size),
            chunk_size,
            permits: Arc::new(Semaphore::new(chunks_in_flight.max(1))),
            queue: Some(queue),
            pump: Some(pump),
            latch,
            written: 0,
            frames: 0,
            closed: false,
        }
    }

    /// Returns the number of payload bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Returns the number of frames sent so far, including the terminator
    /// once closed.
    pub fn frames_sent(&self) -> u64 {
        self.frames
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        self.latch.check()?;
        if self.closed {
            return Err(HotRodError::Stream("write to a closed stream".to_string()));
        }
        Ok(())
    }

    /// Appends `data` to the stream.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }

        if data.len() > self.chunk_size - self.chunk.len() {
            self.flush_chunk().await?;
            if data.len() > self.chunk_size {
                for piece in data.chunks(MAX_FRAME_PAYLOAD) {
                    self.send_frame(piece).await?;
                }
                self.written += data.len() as u64;
                return Ok(());
            }
        }

        self.chunk.extend_from_slice(data);
        self.written += data.len() as u64;
        if self.chunk.len() == self.chunk_size {
            self.flush_chunk().await?;
        }
        Ok(())
    }

    /// Sends the buffered partial chunk, if any.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_chunk().await
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let payload = self.chunk.split().freeze();
        self.send_frame(&payload).await
    }

    async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| HotRodError::Stream("stream writer shut down".to_string()))?;
        self.latch.check()?;

        let mut frame = BytesMut::with_capacity(vint_size(payload.len() as u32) + payload.len());
        write_vint(&mut frame, payload.len() as u32);
        frame.extend_from_slice(payload);

        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| HotRodError::Stream("stream writer shut down".to_string()))?;
        queue
            .send((frame.freeze(), permit))
            .map_err(|_| HotRodError::Stream("stream writer shut down".to_string()))?;
        self.frames += 1;
        trace!(len = payload.len(), "queued stream chunk");
        Ok(())
    }

    /// Flushes the partial chunk, sends the terminating zero-length frame
    /// and waits until every frame has been written.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return self.latch.check();
        }
        self.latch.check()?;
        self.flush_chunk().await?;
        self.send_frame(&[]).await?;
        self.closed = true;

        self.queue = None;
        if let Some(pump) = self.pump.take() {
            pump.await
                .map_err(|e| HotRodError::Stream(format!("stream writer task failed: {}", e)))?;
        }
        self.latch.check()?;
        debug!(bytes = self.written, frames = self.frames, "closed upload stream");
        Ok(())
    }
}

impl Drop for ChunkedWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
        }
    }
}

async fn pump_frames<S: ChunkSink>(
    sink: Arc<S>,
    mut receiver: mpsc::UnboundedReceiver<Queued>,
    latch: Latch,
) {
    while let Some((frame, permit)) = receiver.recv().await {
        if latch.check().is_err() {
            drop(permit);
            continue;
        }
        if let Err(e) = sink.write_frame(frame).await {
            debug!(error = %e, "stream chunk write failed");
            latch.set(e.to_string());
        }
        drop(permit);
    }
}
