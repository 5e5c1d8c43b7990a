//! Request descriptors.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use super::constants::DEFAULT_TOPOLOGY_ID;
use super::media_type::DataFormat;
use super::opcode::OpCode;
use crate::error::{HotRodError, Result};

static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns the next message id.
///
/// Ids are process-wide, so they never repeat on a connection while a
/// response is outstanding.
pub fn next_message_id() -> u64 {
    MESSAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// How much cluster knowledge the client declares to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ClientIntelligence {
    /// No topology updates.
    Basic = 0x01,
    /// Member list updates.
    TopologyAware = 0x02,
    /// Member list and segment ownership updates.
    #[default]
    HashDistributionAware = 0x03,
}

impl ClientIntelligence {
    /// Returns the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true if topology updates carry hash information.
    pub fn is_hash_aware(self) -> bool {
        self == ClientIntelligence::HashDistributionAware
    }
}

impl TryFrom<u8> for ClientIntelligence {
    type Error = HotRodError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ClientIntelligence::Basic),
            0x02 => Ok(ClientIntelligence::TopologyAware),
            0x03 => Ok(ClientIntelligence::HashDistributionAware),
            other => Err(HotRodError::Configuration(format!(
                "unknown client intelligence {}",
                other
            ))),
        }
    }
}

impl std::str::FromStr for ClientIntelligence {
    type Err = HotRodError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "basic" => Ok(ClientIntelligence::Basic),
            "topology-aware" => Ok(ClientIntelligence::TopologyAware),
            "hash-distribution-aware" => Ok(ClientIntelligence::HashDistributionAware),
            other => Err(HotRodError::Configuration(format!(
                "unknown client intelligence: {}",
                other
            ))),
        }
    }
}

/// Everything the codec needs to frame one request and validate its
/// response.
///
/// The topology id and age are snapshots taken from the routing table when
/// the request is prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// The request opcode.
    pub opcode: OpCode,
    /// Target cache; empty for the default cache.
    pub cache_name: Bytes,
    /// Request flags.
    pub flags: u32,
    /// Declared client intelligence.
    pub intelligence: ClientIntelligence,
    /// Last topology id the client has seen for this cache.
    pub topology_id: i32,
    /// Routing table age when the request was prepared.
    pub topology_age: u32,
    /// Message id, assigned at send time.
    pub message_id: u64,
    /// Key and value media types (2.8 and later).
    pub data_format: Option<DataFormat>,
}

impl RequestHeader {
    /// Creates a header for `opcode` against `cache_name`.
    pub fn new(opcode: OpCode, cache_name: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            cache_name: cache_name.into(),
            flags: 0,
            intelligence: ClientIntelligence::default(),
            topology_id: DEFAULT_TOPOLOGY_ID,
            topology_age: 0,
            message_id: 0,
            data_format: None,
        }
    }

    /// Creates a header from a raw opcode byte.
    pub fn for_code(code: u8, cache_name: impl Into<Bytes>) -> Result<Self> {
        Ok(Self::new(OpCode::try_from(code)?, cache_name))
    }

    /// Sets the request flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the declared client intelligence.
    pub fn with_intelligence(mut self, intelligence: ClientIntelligence) -> Self {
        self.intelligence = intelligence;
        self
    }

    /// Sets the topology snapshot.
    pub fn with_topology(mut self, topology_id: i32, topology_age: u32) -> Self {
        self.topology_id = topology_id;
        self.topology_age = topology_age;
        self
    }

    /// Sets the key and value media types.
    pub fn with_data_format(mut self, data_format: DataFormat) -> Self {
        self.data_format = Some(data_format);
        self
    }

    /// Returns the opcode the response must carry.
    pub fn response_code(&self) -> u8 {
        self.opcode.response_code()
    }

    /// Returns true if `flag` is set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Returns the cache name for logging.
    pub fn cache_display(&self) -> CacheName<'_> {
        CacheName(&self.cache_name)
    }
}

/// Displays a cache name, lossily decoding UTF-8.
pub struct CacheName<'a>(pub &'a [u8]);

impl fmt::Display for CacheName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<default>")
        } else {
            f.write_str(&String::from_utf8_lossy(self.0))
        }
    }
}
