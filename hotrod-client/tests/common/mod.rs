//! Common test utilities for integration tests: a scripted in-process
//! server speaking the response side of the protocol.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use hotrod_client::protocol::wire::{write_array, write_string, write_vint, write_vlong};
use hotrod_client::protocol::{
    ProtocolVersion, CACHE_ENTRY_CREATED_EVENT, ERROR_RESPONSE, NO_TOPOLOGY_CHANGE, RESPONSE_MAGIC,
    TOPOLOGY_CHANGED,
};
use hotrod_client::{ClientConfig, Connection, ListenerRegistry, RoutingTable};

pub const MOCK_SERVER: &str = "mock:11222";

/// A decoded request header.
#[derive(Debug, Clone)]
pub struct Request {
    pub message_id: u64,
    pub version: u8,
    pub opcode: u8,
    pub cache_name: Bytes,
    pub flags: u32,
    pub intelligence: u8,
    pub topology_id: i32,
}

/// The server end of a connection.
pub struct MockServer<S = DuplexStream> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MockServer<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn fill(&mut self, needed: usize) {
        while self.buf.len() < needed {
            let read = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("mock server read failed");
            assert!(read > 0, "client closed the connection");
        }
    }

    pub async fn read_u8(&mut self) -> u8 {
        self.fill(1).await;
        let byte = self.buf[0];
        let _ = self.buf.split_to(1);
        byte
    }

    pub async fn read_vlong(&mut self) -> u64 {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8().await;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return value;
            }
            shift += 7;
        }
    }

    pub async fn read_vint(&mut self) -> u32 {
        self.read_vlong().await as u32
    }

    pub async fn read_exact(&mut self, len: usize) -> Bytes {
        self.fill(len).await;
        self.buf.split_to(len).freeze()
    }

    pub async fn read_array(&mut self) -> Bytes {
        let len = self.read_vint().await as usize;
        self.read_exact(len).await
    }

    pub async fn read_string(&mut self) -> String {
        let bytes = self.read_array().await;
        String::from_utf8(bytes.to_vec()).expect("request string is not UTF-8")
    }

    /// Reads a request header sent with a 2.x or later codec and no data
    /// format.
    pub async fn read_request(&mut self) -> Request {
        let magic = self.read_u8().await;
        assert_eq!(magic, 0xA0, "bad request magic");
        let message_id = self.read_vlong().await;
        let version = self.read_u8().await;
        let opcode = self.read_u8().await;
        let cache_name = self.read_array().await;
        let flags = self.read_vint().await;
        let intelligence = self.read_u8().await;
        let topology_id = self.read_vint().await as i32;
        if version >= ProtocolVersion::V2_8.as_byte() {
            assert_eq!(self.read_u8().await, 0, "unexpected key media type");
            assert_eq!(self.read_u8().await, 0, "unexpected value media type");
        }
        Request {
            message_id,
            version,
            opcode,
            cache_name,
            flags,
            intelligence,
            topology_id,
        }
    }

    /// Reads `[vint length][payload]` frames up to the zero-length
    /// terminator, returning the payload and the frame lengths.
    pub async fn read_chunked(&mut self) -> (Vec<u8>, Vec<usize>) {
        let mut value = Vec::new();
        let mut frames = Vec::new();
        loop {
            let len = self.read_vint().await as usize;
            frames.push(len);
            if len == 0 {
                return (value, frames);
            }
            value.extend_from_slice(&self.read_exact(len).await);
        }
    }

    pub async fn send(&mut self, frame: &[u8]) {
        self.stream
            .write_all(frame)
            .await
            .expect("mock server write failed");
        self.stream.flush().await.expect("mock server flush failed");
    }

    /// Returns true if the client closed its end.
    pub async fn is_closed_by_client(&mut self) -> bool {
        matches!(self.stream.read_buf(&mut self.buf).await, Ok(0))
    }
}

/// Builds a response frame without a topology update.
pub fn response(message_id: u64, opcode: u8, status: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(RESPONSE_MAGIC);
    write_vlong(&mut buf, message_id);
    buf.put_u8(opcode);
    buf.put_u8(status);
    buf.put_u8(NO_TOPOLOGY_CHANGE);
    buf.extend_from_slice(body);
    buf
}

/// Builds a response frame carrying a topology update block.
pub fn response_with_topology(
    message_id: u64,
    opcode: u8,
    status: u8,
    topology: &[u8],
    body: &[u8],
) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(RESPONSE_MAGIC);
    write_vlong(&mut buf, message_id);
    buf.put_u8(opcode);
    buf.put_u8(status);
    buf.put_u8(TOPOLOGY_CHANGED);
    buf.extend_from_slice(topology);
    buf.extend_from_slice(body);
    buf
}

/// Builds an error response carrying `message`.
pub fn error_response(message_id: u64, status: u8, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    write_string(&mut body, message);
    response(message_id, ERROR_RESPONSE, status, &body)
}

/// Encodes a segment-ownership topology block for hash-aware clients.
pub fn segment_topology(topology_id: i32, members: &[(&str, u16)], owners: &[&[u32]]) -> BytesMut {
    let mut buf = BytesMut::new();
    write_vint(&mut buf, topology_id as u32);
    write_vint(&mut buf, members.len() as u32);
    for (host, port) in members {
        write_string(&mut buf, host);
        buf.put_u16(*port);
    }
    buf.put_u8(3);
    write_vint(&mut buf, owners.len() as u32);
    for segment in owners {
        buf.put_u8(segment.len() as u8);
        for index in *segment {
            write_vint(&mut buf, *index);
        }
    }
    buf
}

/// Encodes a byte array body.
pub fn array(bytes: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    write_array(&mut buf, bytes);
    buf
}

/// Builds a structured entry-created event.
pub fn created_event(listener_id: &[u8], key: &[u8], version: i64) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(RESPONSE_MAGIC);
    write_vlong(&mut buf, 0);
    buf.put_u8(CACHE_ENTRY_CREATED_EVENT);
    buf.put_u8(0);
    buf.put_u8(NO_TOPOLOGY_CHANGE);
    write_array(&mut buf, listener_id);
    buf.put_u8(0);
    buf.put_u8(0);
    write_array(&mut buf, key);
    buf.put_i64(version);
    buf
}

/// Encodes a 3.0+ ping body advertising `server_version`.
pub fn ping_body(server_version: u8, operations: &[u16]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u8(server_version);
    write_vint(&mut buf, operations.len() as u32);
    for op in operations {
        buf.put_u16(*op);
    }
    buf
}

pub fn test_config() -> ClientConfig {
    ClientConfig::builder()
        .max_protocol_version(ProtocolVersion::V3_0)
        .socket_timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build config")
}

/// A connection wired to a mock server.
pub struct Harness {
    pub connection: Connection,
    pub server: MockServer,
    pub routing: Arc<RoutingTable>,
    pub listeners: Arc<ListenerRegistry>,
}

pub fn connect_mock(config: &ClientConfig) -> Harness {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let routing = Arc::new(RoutingTable::new(Vec::new()));
    let listeners = Arc::new(ListenerRegistry::new(config.event_capacity()));
    let connection = Connection::from_stream(
        client,
        MOCK_SERVER,
        config,
        Arc::clone(&routing),
        Arc::clone(&listeners),
    );
    Harness {
        connection,
        server: MockServer::new(server),
        routing,
        listeners,
    }
}
