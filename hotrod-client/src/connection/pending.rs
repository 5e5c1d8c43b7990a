//! Requests waiting for their response on a connection.

use std::cell::Cell;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use hotrod_core::protocol::{Codec, DecodeProgress, RequestHeader, Status, TopologySink, WireReader};
use hotrod_core::{HotRodError, Result};

use crate::stream::{ChunkedReader, ReceiverSource};

/// Stream pieces buffered between the decode loop and a download.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// A streamed value: the metadata the body reader produced and a reader
/// over the payload.
pub type StreamedValue<T> = (T, ChunkedReader<ReceiverSource>);

/// What decoding the head of the stream for a pending request produced.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// More bytes are needed.
    Incomplete,
    /// The response was consumed and delivered.
    Done {
        consumed: usize,
        /// Set when the response makes the connection unusable.
        fatal: Option<String>,
    },
    /// The response header was consumed and `length` raw payload bytes
    /// follow for `sender`.
    Stream {
        consumed: usize,
        length: u64,
        sender: mpsc::Sender<Result<Bytes>>,
    },
}

/// A request whose response has not been decoded yet.
pub(crate) trait PendingResponse: Send {
    /// Returns the request's message id.
    fn message_id(&self) -> u64;

    /// Decodes the response from the front of `buf`. An error means the
    /// stream can no longer be read.
    fn decode(&mut self, buf: &[u8], sink: &dyn TopologySink, server: &str) -> Result<Decoded>;

    /// Fails the request without a response.
    fn fail(self: Box<Self>, error: HotRodError);
}

/// A body reader that failed left the rest of the frame unread, so the
/// stream is out of step whatever the error was.
fn fatal_reason<T>(result: &Result<T>, body_failed: bool) -> Option<String> {
    match result {
        Err(e) if body_failed => Some(format!("response body not fully decoded: {}", e)),
        Err(e) if e.is_fatal_to_connection() => Some(e.to_string()),
        _ => None,
    }
}

/// An ordinary request.
///
/// Its waiter may go away, e.g. on timeout; the response is then still
/// decoded so the stream stays in sync, and dropped.
pub(crate) struct Pending<T, F> {
    codec: Codec,
    header: RequestHeader,
    body: F,
    sender: Option<oneshot::Sender<Result<T>>>,
}

impl<T, F> Pending<T, F> {
    pub(crate) fn new(
        codec: Codec,
        header: RequestHeader,
        body: F,
        sender: oneshot::Sender<Result<T>>,
    ) -> Self {
        Self {
            codec,
            header,
            body,
            sender: Some(sender),
        }
    }

    fn complete(&mut self, result: Result<T>) {
        if let Some(sender) = self.sender.take() {
            if sender.send(result).is_err() {
                trace!(
                    message_id = self.header.message_id,
                    "discarded response to cancelled request"
                );
            }
        }
    }
}

impl<T, F> PendingResponse for Pending<T, F>
where
    T: Send + 'static,
    F: Fn(&Codec, Status, &mut WireReader<'_>) -> Result<T> + Send + 'static,
{
    fn message_id(&self) -> u64 {
        self.header.message_id
    }

    fn decode(&mut self, buf: &[u8], sink: &dyn TopologySink, server: &str) -> Result<Decoded> {
        let body_failed = Cell::new(false);
        let body = &self.body;
        let progress = self.codec.decode_response(
            buf,
            &self.header,
            sink,
            server,
            |codec: &Codec, status: Status, reader: &mut WireReader<'_>| {
                let result = body(codec, status, reader);
                if matches!(&result, Err(e) if !e.is_incomplete()) {
                    body_failed.set(true);
                }
                result
            },
        )?;
        match progress {
            DecodeProgress::Incomplete => Ok(Decoded::Incomplete),
            DecodeProgress::Complete { consumed, result } => {
                let fatal = fatal_reason(&result, body_failed.get());
                self.complete(result);
                Ok(Decoded::Done { consumed, fatal })
            }
        }
    }

    fn fail(mut self: Box<Self>, error: HotRodError) {
        self.complete(Err(error));
    }
}

/// A request whose successful response is followed by a raw payload.
///
/// The body reader returns the value's metadata and payload length, or
/// `None` when there is no value.
pub(crate) struct StreamPending<T, F> {
    codec: Codec,
    header: RequestHeader,
    body: F,
    sender: Option<oneshot::Sender<Result<Option<StreamedValue<T>>>>>,
}

impl<T, F> StreamPending<T, F> {
    pub(crate) fn new(
        codec: Codec,
        header: RequestHeader,
        body: F,
        sender: oneshot::Sender<Result<Option<StreamedValue<T>>>>,
    ) -> Self {
        Self {
            codec,
            header,
            body,
            sender: Some(sender),
        }
    }

    fn complete(&mut self, result: Result<Option<StreamedValue<T>>>) {
        if let Some(sender) = self.sender.take() {
            if sender.send(result).is_err() {
                trace!(
                    message_id = self.header.message_id,
                    "discarded stream response to cancelled request"
                );
            }
        }
    }
}

impl<T, F> PendingResponse for StreamPending<T, F>
where
    T: Send + 'static,
    F: Fn(&Codec, Status, &mut WireReader<'_>) -> Result<Option<(T, u64)>> + Send + 'static,
{
    fn message_id(&self) -> u64 {
        self.header.message_id
    }

    fn decode(&mut self, buf: &[u8], sink: &dyn TopologySink, server: &str) -> Result<Decoded> {
        let body_failed = Cell::new(false);
        let body = &self.body;
        let progress = self.codec.decode_response(
            buf,
            &self.header,
            sink,
            server,
            |codec: &Codec, status: Status, reader: &mut WireReader<'_>| {
                let result = body(codec, status, reader);
                if matches!(&result, Err(e) if !e.is_incomplete()) {
                    body_failed.set(true);
                }
                result
            },
        )?;
        let (consumed, result) = match progress {
            DecodeProgress::Incomplete => return Ok(Decoded::Incomplete),
            DecodeProgress::Complete { consumed, result } => (consumed, result),
        };

        match result {
            Ok(Some((metadata, length))) => {
                let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
                let reader = ChunkedReader::with_length(length, ReceiverSource::new(receiver));
                self.complete(Ok(Some((metadata, reader))));
                if length == 0 {
                    Ok(Decoded::Done { consumed, fatal: None })
                } else {
                    Ok(Decoded::Stream {
                        consumed,
                        length,
                        sender,
                    })
                }
            }
            other => {
                let fatal = fatal_reason(&other, body_failed.get());
                self.complete(other.map(|_| None));
                Ok(Decoded::Done { consumed, fatal })
            }
        }
    }

    fn fail(mut self: Box<Self>, error: HotRodError) {
        self.complete(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use hotrod_core::protocol::wire::{write_array, write_string, write_vint, write_vlong};
    use hotrod_core::protocol::{DiscardTopology, OpCode, ProtocolVersion, RESPONSE_MAGIC};

    fn response(message_id: u64, opcode: u8, status: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(RESPONSE_MAGIC);
        write_vlong(&mut buf, message_id);
        buf.put_u8(opcode);
        buf.put_u8(status);
        buf.put_u8(0);
        buf.extend_from_slice(body);
        buf
    }

    fn get_header() -> RequestHeader {
        let mut header = RequestHeader::new(OpCode::Get, "c");
        header.message_id = 9;
        header
    }

    fn read_value(_: &Codec, _: Status, r: &mut WireReader<'_>) -> Result<Bytes> {
        r.read_bytes_owned()
    }

    #[test]
    fn test_pending_delivers_value() {
        let (tx, mut rx) = oneshot::channel();
        let mut pending = Pending::new(Codec::new(ProtocolVersion::V3_0), get_header(), read_value, tx);

        let mut body = BytesMut::new();
        write_array(&mut body, b"v");
        let frame = response(9, 0x04, 0x00, &body);

        assert!(matches!(
            pending.decode(&frame[..frame.len() - 1], &DiscardTopology, "s").unwrap(),
            Decoded::Incomplete
        ));
        match pending.decode(&frame, &DiscardTopology, "s").unwrap() {
            Decoded::Done { consumed, fatal } => {
                assert_eq!(consumed, frame.len());
                assert!(fatal.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from_static(b"v"));
    }

    #[test]
    fn test_cancelled_pending_still_consumes() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let mut pending = Pending::new(Codec::new(ProtocolVersion::V3_0), get_header(), read_value, tx);
        let mut body = BytesMut::new();
        write_array(&mut body, b"v");
        let frame = response(9, 0x04, 0x00, &body);
        assert!(matches!(
            pending.decode(&frame, &DiscardTopology, "s").unwrap(),
            Decoded::Done { consumed, .. } if consumed == frame.len()
        ));
    }

    #[test]
    fn test_fatal_server_error_is_reported() {
        let (tx, mut rx) = oneshot::channel::<Result<Bytes>>();
        let mut pending = Pending::new(Codec::new(ProtocolVersion::V3_0), get_header(), read_value, tx);
        let mut body = BytesMut::new();
        write_string(&mut body, "bad request");
        let frame = response(9, 0x50, 0x81, &body);

        match pending.decode(&frame, &DiscardTopology, "s").unwrap() {
            Decoded::Done { fatal, .. } => assert!(fatal.is_some()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), Err(HotRodError::Server { status: 0x81, .. })));
    }

    #[test]
    fn test_body_reader_error_is_fatal() {
        let (tx, mut rx) = oneshot::channel::<Result<Bytes>>();
        let mut pending = Pending::new(
            Codec::new(ProtocolVersion::V3_0),
            get_header(),
            |_: &Codec, _: Status, _: &mut WireReader<'_>| -> Result<Bytes> {
                Err(HotRodError::Unsupported("value format".to_string()))
            },
            tx,
        );
        let mut body = BytesMut::new();
        write_array(&mut body, b"unread");
        let frame = response(9, 0x04, 0x00, &body);

        match pending.decode(&frame, &DiscardTopology, "s").unwrap() {
            Decoded::Done { fatal: Some(reason), .. } => {
                assert!(reason.contains("response body not fully decoded"));
                assert!(reason.contains("value format"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), Err(HotRodError::Unsupported(_))));
    }

    #[test]
    fn test_recoverable_server_error_is_not_fatal() {
        let (tx, mut rx) = oneshot::channel::<Result<Bytes>>();
        let mut pending = Pending::new(Codec::new(ProtocolVersion::V3_0), get_header(), read_value, tx);
        let mut body = BytesMut::new();
        write_string(&mut body, "cache is busy");
        let frame = response(9, 0x50, 0x85, &body);

        assert!(matches!(
            pending.decode(&frame, &DiscardTopology, "s").unwrap(),
            Decoded::Done { fatal: None, .. }
        ));
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_stream_pending_hands_over_payload() {
        let (tx, mut rx) = oneshot::channel();
        let mut header = RequestHeader::new(OpCode::GetStream, "c");
        header.message_id = 9;
        let mut pending = StreamPending::new(
            Codec::new(ProtocolVersion::V3_0),
            header,
            |_: &Codec, _: Status, r: &mut WireReader<'_>| {
                let version = r.read_i64()?;
                let length = r.read_vint()?;
                Ok(Some((version, u64::from(length))))
            },
            tx,
        );

        let mut body = BytesMut::new();
        body.put_i64(42);
        write_vint(&mut body, 5);
        let frame = response(9, OpCode::GetStream.response_code(), 0x00, &body);
        match pending.decode(&frame, &DiscardTopology, "s").unwrap() {
            Decoded::Stream { consumed, length, .. } => {
                assert_eq!(consumed, frame.len());
                assert_eq!(length, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        let (version, reader) = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(version, 42);
        assert_eq!(reader.total_length(), Some(5));
    }

    #[test]
    fn test_stream_pending_without_value() {
        let (tx, mut rx) = oneshot::channel::<Result<Option<StreamedValue<i64>>>>();
        let mut header = RequestHeader::new(OpCode::GetStream, "c");
        header.message_id = 9;
        let mut pending = StreamPending::new(
            Codec::new(ProtocolVersion::V3_0),
            header,
            |_: &Codec, status: Status, _: &mut WireReader<'_>| {
                assert_eq!(status, Status::KeyDoesNotExist);
                Ok(None)
            },
            tx,
        );
        let frame = response(9, OpCode::GetStream.response_code(), 0x02, &[]);
        assert!(matches!(
            pending.decode(&frame, &DiscardTopology, "s").unwrap(),
            Decoded::Done { fatal: None, .. }
        ));
        assert!(rx.try_recv().unwrap().unwrap().is_none());
    }
}
