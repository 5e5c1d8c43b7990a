//! The versioned Hot Rod codec.
//!
//! A [`Codec`] is an immutable value parameterized by the negotiated
//! [`ProtocolVersion`]. Every version-dependent field is gated through
//! [`ProtocolVersion::supports`], so the whole compatibility chain is one
//! encode path and one decode path.
//!
//! Decoding is pure: it parses from a borrowed buffer and reports
//! [`DecodeProgress::Incomplete`] when bytes are missing, without side
//! effects. A topology update is handed to the [`TopologySink`] only once
//! the whole response (header, error text or body) has been parsed.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::constants::*;
use super::event::ClientEvent;
use super::expiration::Expiration;
use super::media_type::MediaType;
use super::opcode::{is_event, ERROR_RESPONSE};
use super::params::{IterationStart, ListenerParams, NamedFactory};
use super::request::{ClientIntelligence, RequestHeader};
use super::status::Status;
use super::topology::{TopologyOutcome, TopologySink, TopologyUpdate};
use super::version::{Feature, ProtocolVersion};
use super::wire::{
    limited_hex_dump, write_array, write_optional_array, write_optional_string,
    write_signed_vint, write_string, write_vint, write_vlong, WireReader,
};
use crate::error::{HotRodError, Result};

/// A response header, read up to and including the topology block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Message id echoed by the server; 0 on some error paths.
    pub message_id: u64,
    /// Response opcode.
    pub opcode: u8,
    /// Raw status byte.
    pub status: u8,
    /// Topology update, if the server sent one.
    pub topology: Option<TopologyUpdate>,
}

/// Result of attempting to decode one frame from a buffer.
#[derive(Debug)]
pub enum DecodeProgress<T> {
    /// The buffer does not yet hold the whole frame.
    Incomplete,
    /// A whole frame was parsed.
    Complete {
        /// Bytes the frame occupied.
        consumed: usize,
        /// The decoded value or the error the frame carried.
        result: Result<T>,
    },
}

impl<T> DecodeProgress<T> {
    /// Returns true if more bytes are needed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeProgress::Incomplete)
    }
}

/// The body of a successful ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResponse {
    /// Ping status.
    pub status: Status,
    /// Server key media type (3.0 and later).
    pub key_type: Option<MediaType>,
    /// Server value media type (3.0 and later).
    pub value_type: Option<MediaType>,
    /// Highest version byte the server speaks (3.0 and later).
    pub server_version: Option<u8>,
    /// Opcodes the server supports (3.0 and later).
    pub operations: Vec<u16>,
}

impl PingResponse {
    /// Returns the version to speak: the older of `max` and what the
    /// server reported.
    pub fn negotiate(&self, max: ProtocolVersion) -> ProtocolVersion {
        match self.server_version {
            Some(server) => ProtocolVersion::at_most(server.min(max.as_byte())).unwrap_or(max),
            None => max,
        }
    }

    /// Returns true if the server hinted that it stores objects.
    pub fn is_object_storage(&self) -> bool {
        self.status.is_object_storage()
    }

    /// Returns true if the server reported support for `opcode`.
    pub fn supports_operation(&self, opcode: u16) -> bool {
        self.operations.contains(&opcode)
    }
}

/// Encoder and decoder for one protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    version: ProtocolVersion,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(ProtocolVersion::LATEST)
    }
}

impl Codec {
    /// Creates a codec for `version`.
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    /// Returns the protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Writes a request header.
    pub fn write_header(&self, buf: &mut BytesMut, header: &RequestHeader) {
        buf.put_u8(REQUEST_MAGIC);
        write_vlong(buf, header.message_id);
        buf.put_u8(self.version.as_byte());
        buf.put_u8(header.opcode.code());
        write_array(buf, &header.cache_name);
        write_vint(buf, header.flags);
        buf.put_u8(header.intelligence.as_byte());
        write_vint(buf, header.topology_id as u32);
        if !self.version.supports(Feature::SegmentTopology) {
            // Transaction marker; 1.x clients never send transactional requests.
            buf.put_u8(0);
        }
        if self.version.supports(Feature::MediaTypeHeader) {
            match &header.data_format {
                Some(format) => format.write(buf),
                None => {
                    MediaType::write(buf, None);
                    MediaType::write(buf, None);
                }
            }
        }

        trace!(
            cache = %header.cache_display(),
            message_id = header.message_id,
            opcode = %header.opcode,
            flags = header.flags,
            topology_id = header.topology_id,
            version = %self.version,
            "wrote request header"
        );
    }

    /// Reads the magic byte, message id and opcode of the next frame
    /// without consuming it. Returns `None` if they are not all buffered.
    pub fn peek_opcode(buf: &[u8]) -> Result<Option<(u64, u8)>> {
        let mut reader = WireReader::new(buf);
        match Self::read_preamble(&mut reader) {
            Ok(found) => Ok(Some(found)),
            Err(HotRodError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_preamble(reader: &mut WireReader<'_>) -> Result<(u64, u8)> {
        let magic = reader.read_u8()?;
        if magic != RESPONSE_MAGIC {
            warn!(
                magic = magic,
                buffer = %limited_hex_dump(reader.rest(), MAX_HEX_DUMP_BYTES),
                "invalid magic in response"
            );
            return Err(HotRodError::InvalidMagic {
                expected: RESPONSE_MAGIC,
                actual: magic,
            });
        }
        let message_id = reader.read_vlong()?;
        let opcode = reader.read_u8()?;
        Ok((message_id, opcode))
    }

    /// Reads a response header through the topology block.
    pub fn read_header(
        &self,
        reader: &mut WireReader<'_>,
        intelligence: ClientIntelligence,
    ) -> Result<ResponseHeader> {
        let (message_id, opcode) = Self::read_preamble(reader)?;
        let status = reader.read_u8()?;
        let topology = match reader.read_u8()? {
            TOPOLOGY_CHANGED => Some(TopologyUpdate::read(reader, self.version, intelligence)?),
            _ => None,
        };
        Ok(ResponseHeader {
            message_id,
            opcode,
            status,
            topology,
        })
    }

    /// Validates a response header against its request and classifies the
    /// status. Error statuses consume the server's message from the body.
    pub fn check_status(
        &self,
        reader: &mut WireReader<'_>,
        request: &RequestHeader,
        header: &ResponseHeader,
        server: &str,
    ) -> Result<Status> {
        let expected = request.response_code();
        if header.opcode != expected && header.opcode != ERROR_RESPONSE {
            return Err(HotRodError::InvalidResponse(format!(
                "cache {}: expected opcode {:#04x}, got {:#04x}",
                request.cache_display(),
                expected,
                header.opcode
            )));
        }

        trace!(
            cache = %request.cache_display(),
            message_id = request.message_id,
            status = header.status,
            "received operation status"
        );

        match Status::from_code(header.status) {
            Some(status) if status.is_success_family() && header.opcode == expected => Ok(status),
            Some(status) if !status.is_success_family() => {
                let message = reader.read_string()?;
                Err(self.server_error(request, status, message, server))
            }
            _ => Err(HotRodError::UnknownStatus(header.status)),
        }
    }

    fn server_error(
        &self,
        request: &RequestHeader,
        status: Status,
        message: String,
        server: &str,
    ) -> HotRodError {
        let message_id = request.message_id;
        let code = status.code();
        match status {
            Status::NodeSuspected => {
                debug!(
                    cache = %request.cache_display(),
                    message_id = message_id,
                    message = %message,
                    "remote node suspected while executing request"
                );
                HotRodError::NodeSuspected {
                    message_id,
                    status: code,
                    message,
                }
            }
            Status::IllegalLifecycleState => {
                warn!(server = %server, message = %message, "server not in a running state");
                HotRodError::IllegalLifecycleState {
                    message_id,
                    status: code,
                    message,
                    address: server.to_string(),
                }
            }
            Status::CommandTimeout => {
                debug!(message_id = message_id, message = %message, "server-side timeout");
                HotRodError::Server {
                    message_id,
                    status: code,
                    message,
                }
            }
            _ => {
                warn!(message_id = message_id, status = code, message = %message, "error from server");
                HotRodError::Server {
                    message_id,
                    status: code,
                    message,
                }
            }
        }
    }

    /// Decodes one whole response to `request`.
    ///
    /// The outer error is a framing failure after which nothing more can be
    /// read from the stream. Otherwise the frame was fully consumed and the
    /// inner result carries either the body or the error the server sent.
    pub fn decode_response<T, F>(
        &self,
        buf: &[u8],
        request: &RequestHeader,
        sink: &dyn TopologySink,
        server: &str,
        body: F,
    ) -> Result<DecodeProgress<T>>
    where
        F: Fn(&Codec, Status, &mut WireReader<'_>) -> Result<T>,
    {
        let mut reader = WireReader::new(buf);
        let header = match self.read_header(&mut reader, request.intelligence) {
            Ok(header) => header,
            Err(HotRodError::Incomplete) => return Ok(DecodeProgress::Incomplete),
            Err(e) => return Err(e),
        };

        if header.message_id != 0 && header.message_id != request.message_id {
            return Ok(DecodeProgress::Complete {
                consumed: reader.position(),
                result: Err(HotRodError::InvalidResponse(format!(
                    "expected message id {}, got {}",
                    request.message_id, header.message_id
                ))),
            });
        }

        let result = self
            .check_status(&mut reader, request, &header, server)
            .and_then(|status| body(self, status, &mut reader));
        if matches!(result, Err(HotRodError::Incomplete)) {
            return Ok(DecodeProgress::Incomplete);
        }
        let consumed = reader.position();

        if let Some(update) = header.topology {
            let topology_id = update.topology_id;
            let outcome =
                sink.apply_topology(&request.cache_name, request.topology_age, update);
            match outcome {
                TopologyOutcome::Applied => debug!(
                    cache = %request.cache_display(),
                    topology_id = topology_id,
                    "applied topology update"
                ),
                TopologyOutcome::AgeMismatch => warn!(
                    cache = %request.cache_display(),
                    topology_id = topology_id,
                    outcome = ?outcome,
                    "ignored outdated topology update"
                ),
                _ => trace!(
                    cache = %request.cache_display(),
                    topology_id = topology_id,
                    outcome = ?outcome,
                    "topology update not applied"
                ),
            }
        }

        Ok(DecodeProgress::Complete { consumed, result })
    }

    /// Decodes one push event.
    ///
    /// The listener id is checked with `is_registered` only after the whole
    /// event is parsed, so an unexpected id leaves the stream in sync.
    pub fn decode_event<M>(&self, buf: &[u8], is_registered: M) -> Result<DecodeProgress<ClientEvent>>
    where
        M: Fn(&[u8]) -> bool,
    {
        let mut reader = WireReader::new(buf);
        let (_, opcode) = match Self::read_preamble(&mut reader) {
            Ok(found) => found,
            Err(HotRodError::Incomplete) => return Ok(DecodeProgress::Incomplete),
            Err(e) => return Err(e),
        };
        if !is_event(opcode) {
            return Err(HotRodError::UnknownEvent(opcode));
        }

        let event = match ClientEvent::read(&mut reader, opcode, self.version) {
            Ok(event) => event,
            Err(HotRodError::Incomplete) => return Ok(DecodeProgress::Incomplete),
            Err(e) => return Err(e),
        };
        let consumed = reader.position();
        let result = if is_registered(event.listener_id()) {
            Ok(event)
        } else {
            Err(HotRodError::UnexpectedListenerId(limited_hex_dump(
                event.listener_id(),
                MAX_HEX_DUMP_BYTES,
            )))
        };
        Ok(DecodeProgress::Complete { consumed, result })
    }

    /// Writes entry expiration.
    pub fn write_expiration(&self, buf: &mut impl BufMut, expiration: &Expiration) {
        expiration.write(buf, self.version);
    }

    /// Writes client listener registration parameters.
    pub fn write_listener_params(&self, buf: &mut impl BufMut, params: &ListenerParams) {
        buf.put_u8(params.include_current_state as u8);
        write_named_factory(buf, &params.filter);
        write_named_factory(buf, &params.converter);
        if self.version.supports(Feature::RawListenerData) {
            buf.put_u8(params.use_raw_data as u8);
        }
    }

    /// Writes the listener interest mask where the version carries one.
    pub fn write_listener_interests(&self, buf: &mut impl BufMut, interests: u32) {
        if self.version.supports(Feature::ListenerInterests) {
            write_vint(buf, interests & INTEREST_ALL);
        }
    }

    /// Writes the near-cache bloom filter size.
    pub fn write_bloom_filter(&self, buf: &mut impl BufMut, bits: u32) -> Result<()> {
        if self.version.supports(Feature::BloomFilter) {
            write_vint(buf, bits);
            Ok(())
        } else if bits > 0 {
            Err(HotRodError::Unsupported(format!(
                "bloom filter near cache requires protocol 3.1, negotiated {}",
                self.version
            )))
        } else {
            Ok(())
        }
    }

    /// Writes the body of an iteration start request.
    pub fn write_iteration_start(&self, buf: &mut impl BufMut, start: &IterationStart) -> Result<()> {
        if !self.version.supports(Feature::SegmentTopology) {
            return Err(HotRodError::Unsupported(format!(
                "iteration requires protocol 2.0, negotiated {}",
                self.version
            )));
        }
        match start.segment_bitset() {
            Some(bits) => write_optional_array(buf, Some(&bits)),
            None => write_signed_vint(buf, -1),
        }
        match &start.filter_converter {
            Some(factory) => {
                write_optional_string(buf, Some(&factory.name));
                buf.put_u8(factory.params.len() as u8);
                for param in &factory.params {
                    write_array(buf, param);
                }
            }
            None => write_optional_string(buf, None),
        }
        write_vint(buf, start.batch_size);
        buf.put_u8(start.metadata as u8);
        Ok(())
    }

    /// Reads the previous value of a write, if the response carries one.
    ///
    /// From 2.0 the status says whether a value follows; before that a
    /// value follows whenever the request asked for it, and an empty value
    /// means there was none.
    pub fn read_previous_value(
        &self,
        status: Status,
        reader: &mut WireReader<'_>,
        request_flags: u32,
    ) -> Result<Option<Bytes>> {
        if self.version.supports(Feature::PreviousValueByStatus) {
            if status.has_previous() {
                return reader.read_bytes_owned().map(Some);
            }
            return Ok(None);
        }
        if request_flags & FLAG_FORCE_RETURN_VALUE != 0 {
            let value = reader.read_bytes_owned()?;
            return Ok((!value.is_empty()).then_some(value));
        }
        Ok(None)
    }

    /// Reads a ping response body.
    pub fn read_ping(&self, status: Status, reader: &mut WireReader<'_>) -> Result<PingResponse> {
        let mut response = PingResponse {
            status,
            key_type: None,
            value_type: None,
            server_version: None,
            operations: Vec::new(),
        };
        if self.version.supports(Feature::PingCapabilities) && status.is_success() {
            response.key_type = MediaType::read(reader)?;
            response.value_type = MediaType::read(reader)?;
            response.server_version = Some(reader.read_u8()?);
            let count = reader.read_vint()?;
            for _ in 0..count {
                response.operations.push(reader.read_u16()?);
            }
        }
        Ok(response)
    }
}

fn write_named_factory(buf: &mut impl BufMut, factory: &NamedFactory) {
    write_string(buf, &factory.name);
    if !factory.is_empty() {
        buf.put_u8(factory.params.len() as u8);
        for param in &factory.params {
            write_array(buf, param);
        }
    }
}
