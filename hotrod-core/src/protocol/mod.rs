//! Hot Rod binary protocol implementation.
//!
//! This module provides the wire primitives, opcode and status tables,
//! the per-version capability table and the versioned [`Codec`] used to
//! talk to Hot Rod servers.

mod codec;
pub mod constants;
mod event;
mod expiration;
mod media_type;
mod opcode;
mod params;
mod request;
mod status;
mod topology;
mod version;
pub mod wire;

pub use codec::{Codec, DecodeProgress, PingResponse, ResponseHeader};
pub use constants::*;
pub use event::{CacheEventType, ClientEvent, CounterEvent, CounterState};
pub use expiration::{Expiration, Lifetime, TimeUnit};
pub use media_type::{DataFormat, MediaType};
pub use opcode::{
    is_event, OpCode, CACHE_ENTRY_CREATED_EVENT, CACHE_ENTRY_EXPIRED_EVENT,
    CACHE_ENTRY_MODIFIED_EVENT, CACHE_ENTRY_REMOVED_EVENT, COUNTER_EVENT, ERROR_RESPONSE,
};
pub use params::{IterationStart, ListenerParams, NamedFactory};
pub use request::{next_message_id, CacheName, ClientIntelligence, RequestHeader};
pub use status::{Status, StatusCategory};
pub use topology::{
    DiscardTopology, HashInfo, ServerAddress, TopologyOutcome, TopologySink, TopologyUpdate,
};
pub use version::{Feature, ProtocolVersion, FEATURE_TABLE};
pub use wire::WireReader;
