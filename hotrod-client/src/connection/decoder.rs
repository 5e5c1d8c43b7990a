//! Frame decoder for the inbound half of a connection.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use hotrod_core::protocol::{is_event, ClientEvent, Codec, DecodeProgress};
use hotrod_core::{HotRodError, Result};

use super::connection::Shared;
use super::pending::Decoded;

/// One unit of inbound traffic.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// The response to the oldest pending request was delivered.
    Response {
        message_id: u64,
        /// Set when the response makes the connection unusable.
        fatal: Option<String>,
    },
    /// A push event, or why it could not be delivered.
    Event(Result<ClientEvent>),
    /// Raw payload bytes of a streamed value.
    StreamData {
        data: Bytes,
        sender: mpsc::Sender<Result<Bytes>>,
    },
}

struct Forward {
    remaining: u64,
    sender: mpsc::Sender<Result<Bytes>>,
}

/// Splits the inbound byte stream into responses and events.
///
/// Responses are matched to pending requests in submission order; events
/// may arrive between them.
pub(crate) struct ResponseDecoder {
    shared: Arc<Shared>,
    forward: Option<Forward>,
}

impl ResponseDecoder {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            forward: None,
        }
    }

    /// Takes the download still receiving payload bytes, if any.
    pub(crate) fn take_stream(&mut self) -> Option<mpsc::Sender<Result<Bytes>>> {
        self.forward.take().map(|f| f.sender)
    }
}

impl Decoder for ResponseDecoder {
    type Item = Inbound;
    type Error = HotRodError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        if let Some(forward) = &mut self.forward {
            if src.is_empty() {
                return Ok(None);
            }
            let take = (src.len() as u64).min(forward.remaining) as usize;
            let data = src.split_to(take).freeze();
            forward.remaining -= take as u64;
            let sender = forward.sender.clone();
            if forward.remaining == 0 {
                self.forward = None;
            }
            return Ok(Some(Inbound::StreamData { data, sender }));
        }

        let (message_id, opcode) = match Codec::peek_opcode(src)? {
            Some(found) => found,
            None => return Ok(None),
        };

        if is_event(opcode) {
            let codec = self.shared.codec.current();
            let listeners = &self.shared.listeners;
            return match codec.decode_event(src, |id| listeners.is_registered(id))? {
                DecodeProgress::Incomplete => Ok(None),
                DecodeProgress::Complete { consumed, result } => {
                    src.advance(consumed);
                    Ok(Some(Inbound::Event(result)))
                }
            };
        }

        let mut pending = self.shared.lock_pending();
        let front = pending.front_mut().ok_or_else(|| {
            HotRodError::InvalidResponse(format!(
                "response {:#04x} with message id {} but no request is pending",
                opcode, message_id
            ))
        })?;

        match front.decode(src, &*self.shared.routing, &self.shared.server)? {
            Decoded::Incomplete => Ok(None),
            Decoded::Done { consumed, fatal } => {
                let message_id = front.message_id();
                pending.pop_front();
                src.advance(consumed);
                Ok(Some(Inbound::Response { message_id, fatal }))
            }
            Decoded::Stream {
                consumed,
                length,
                sender,
            } => {
                let message_id = front.message_id();
                pending.pop_front();
                src.advance(consumed);
                self.forward = Some(Forward {
                    remaining: length,
                    sender,
                });
                Ok(Some(Inbound::Response {
                    message_id,
                    fatal: None,
                }))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.forward.is_none() => Ok(None),
            None => Err(HotRodError::Connection(format!(
                "connection closed with {} unread bytes",
                src.len()
            ))),
        }
    }
}
