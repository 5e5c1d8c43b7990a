//! Chunked value download.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::trace;

use hotrod_core::protocol::WireReader;
use hotrod_core::{HotRodError, Result};

/// A source of raw stream bytes, in arbitrary pieces.
#[async_trait]
pub trait ChunkSource: Send {
    /// Returns the next piece, or `None` when the source is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Receives bytes forwarded by a connection's decode loop.
#[derive(Debug)]
pub struct ReceiverSource(mpsc::Receiver<Result<Bytes>>);

impl ReceiverSource {
    /// Wraps a channel receiver.
    pub fn new(receiver: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self(receiver)
    }
}

#[async_trait]
impl ChunkSource for ReceiverSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.0.recv().await.transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// The payload length was declared up front.
    Length { total: u64 },
    /// `[vint length][payload]` frames ending with a zero-length frame.
    Framed { frame_remaining: usize },
}

/// Reads a stream value on demand, pulling from its source only when the
/// buffered bytes run out.
///
/// The reader never hands out bytes past the end of its value; anything
/// the source delivered beyond it is kept for
/// [`into_remainder`](Self::into_remainder).
pub struct ChunkedReader<S> {
    source: S,
    buffer: BytesMut,
    mode: Mode,
    consumed: u64,
    finished: bool,
    fault: Option<String>,
}

impl<S> std::fmt::Debug for ChunkedReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedReader")
            .field("mode", &self.mode)
            .field("consumed", &self.consumed)
            .field("buffered", &self.buffer.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<S: ChunkSource> ChunkedReader<S> {
    /// Creates a reader for a value of `total` bytes.
    pub fn with_length(total: u64, source: S) -> Self {
        Self {
            source,
            buffer: BytesMut::new(),
            mode: Mode::Length { total },
            consumed: 0,
            finished: total == 0,
            fault: None,
        }
    }

    /// Creates a reader whose length is read as a leading vint.
    pub async fn length_prefixed(mut source: S) -> Result<Self> {
        let mut buffer = BytesMut::new();
        let total = loop {
            let mut reader = WireReader::new(&buffer);
            match reader.read_vint() {
                Ok(total) => {
                    let used = reader.position();
                    buffer.advance(used);
                    break u64::from(total);
                }
                Err(HotRodError::Incomplete) => match source.next_chunk().await? {
                    Some(bytes) => buffer.extend_from_slice(&bytes),
                    None => {
                        return Err(HotRodError::Stream(
                            "stream ended before its length".to_string(),
                        ))
                    }
                },
                Err(e) => return Err(e),
            }
        };
        let mut reader = Self::with_length(total, source);
        reader.buffer = buffer;
        Ok(reader)
    }

    /// Creates a reader for chunk frames as produced by
    /// [`ChunkedWriter`](super::ChunkedWriter).
    pub fn framed(source: S) -> Self {
        Self {
            source,
            buffer: BytesMut::new(),
            mode: Mode::Framed { frame_remaining: 0 },
            consumed: 0,
            finished: false,
            fault: None,
        }
    }

    /// Returns the number of payload bytes handed out so far.
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// Returns the declared total length, if known.
    pub fn total_length(&self) -> Option<u64> {
        match self.mode {
            Mode::Length { total } => Some(total),
            Mode::Framed { .. } => None,
        }
    }

    /// Returns true once the whole value has been read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn fail(&mut self, message: String) -> HotRodError {
        self.fault = Some(message.clone());
        HotRodError::Stream(message)
    }

    async fn fill(&mut self) -> Result<()> {
        match self.source.next_chunk().await {
            Ok(Some(bytes)) => {
                self.buffer.extend_from_slice(&bytes);
                Ok(())
            }
            Ok(None) => {
                let message = match self.mode {
                    Mode::Length { total } => format!(
                        "stream ended after {} of {} bytes",
                        self.consumed, total
                    ),
                    Mode::Framed { .. } => {
                        format!("stream ended after {} bytes without a terminator", self.consumed)
                    }
                };
                Err(self.fail(message))
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Returns the next piece of the value, or `None` at its end.
    pub async fn next_bytes(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(message) = &self.fault {
                return Err(HotRodError::Stream(message.clone()));
            }
            if self.finished {
                return Ok(None);
            }

            match self.mode {
                Mode::Length { total } => {
                    if self.buffer.is_empty() {
                        self.fill().await?;
                        continue;
                    }
                    let wanted = total - self.consumed;
                    let take = (self.buffer.len() as u64).min(wanted) as usize;
                    self.consumed += take as u64;
                    if self.consumed == total {
                        self.finished = true;
                        trace!(total = total, "finished reading stream");
                    }
                    return Ok(Some(self.buffer.split_to(take).freeze()));
                }
                Mode::Framed { frame_remaining: 0 } => {
                    let mut reader = WireReader::new(&self.buffer);
                    match reader.read_vint() {
                        Ok(len) => {
                            let used = reader.position();
                            self.buffer.advance(used);
                            if len == 0 {
                                self.finished = true;
                                trace!(total = self.consumed, "reached stream terminator");
                            } else {
                                self.mode = Mode::Framed {
                                    frame_remaining: len as usize,
                                };
                            }
                        }
                        Err(HotRodError::Incomplete) => self.fill().await?,
                        Err(e) => return Err(self.fail(e.to_string())),
                    }
                }
                Mode::Framed { frame_remaining } => {
                    if self.buffer.is_empty() {
                        self.fill().await?;
                        continue;
                    }
                    let take = self.buffer.len().min(frame_remaining);
                    self.mode = Mode::Framed {
                        frame_remaining: frame_remaining - take,
                    };
                    self.consumed += take as u64;
                    return Ok(Some(self.buffer.split_to(take).freeze()));
                }
            }
        }
    }

    /// Reads into `buf`, returning 0 at the end of the value.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.next_bytes_limited(buf.len()).await? {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Ok(0),
        }
    }

    async fn next_bytes_limited(&mut self, limit: usize) -> Result<Option<Bytes>> {
        let bytes = match self.next_bytes().await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        if bytes.len() <= limit {
            return Ok(Some(bytes));
        }
        // Give back what does not fit.
        let extra = bytes.len() - limit;
        let mut rest = BytesMut::with_capacity(extra + self.buffer.len());
        rest.extend_from_slice(&bytes[limit..]);
        rest.extend_from_slice(&self.buffer);
        self.buffer = rest;
        self.consumed -= extra as u64;
        match &mut self.mode {
            Mode::Length { .. } => self.finished = false,
            Mode::Framed { frame_remaining } => *frame_remaining += extra,
        }
        Ok(Some(bytes.slice(..limit)))
    }

    /// Reads the rest of the value into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(bytes) = self.next_bytes().await? {
            out.extend_from_slice(&bytes);
        }
        Ok(out.freeze())
    }

    /// Returns bytes the source delivered beyond the end of the value.
    pub fn into_remainder(self) -> Bytes {
        self.buffer.freeze()
    }
}
