//! Protocol constants for the Hot Rod binary protocol.

/// Magic byte that starts every request.
pub const REQUEST_MAGIC: u8 = 0xA0;

/// Magic byte that starts every response and event.
pub const RESPONSE_MAGIC: u8 = 0xA1;

/// Maximum encoded length of a variable-length 32-bit integer.
pub const MAX_VINT_BYTES: usize = 5;

/// Maximum encoded length of a variable-length 64-bit integer.
pub const MAX_VLONG_BYTES: usize = 10;

/// Topology id sent before the client has seen any topology.
pub const DEFAULT_TOPOLOGY_ID: i32 = -1;

/// Topology marker: no topology block follows the response header.
pub const NO_TOPOLOGY_CHANGE: u8 = 0;

/// Topology marker: a topology block follows the response header.
pub const TOPOLOGY_CHANGED: u8 = 1;

// Request flags.

/// Return the previous value of a modified entry.
pub const FLAG_FORCE_RETURN_VALUE: u32 = 0x0001;

/// The request carries a default lifespan.
pub const FLAG_DEFAULT_LIFESPAN: u32 = 0x0002;

/// The request carries a default max-idle.
pub const FLAG_DEFAULT_MAXIDLE: u32 = 0x0004;

/// Skip the cache loader.
pub const FLAG_SKIP_CACHE_LOAD: u32 = 0x0008;

/// Skip indexing.
pub const FLAG_SKIP_INDEXING: u32 = 0x0010;

/// Skip listener notification.
pub const FLAG_SKIP_LISTENER_NOTIFICATION: u32 = 0x0020;

// Event payload kinds.

/// Event carries key and version fields.
pub const EVENT_STRUCTURED: u8 = 0;

/// Event carries a marshalled application object.
pub const EVENT_CUSTOM_MARSHALLED: u8 = 1;

/// Event carries raw converter output.
pub const EVENT_CUSTOM_RAW: u8 = 2;

// Listener interest bits.

/// Listener receives entry-created events.
pub const INTEREST_CREATED: u32 = 0x01;

/// Listener receives entry-modified events.
pub const INTEREST_MODIFIED: u32 = 0x02;

/// Listener receives entry-removed events.
pub const INTEREST_REMOVED: u32 = 0x04;

/// Listener receives entry-expired events.
pub const INTEREST_EXPIRED: u32 = 0x08;

/// All listener interest bits.
pub const INTEREST_ALL: u32 =
    INTEREST_CREATED | INTEREST_MODIFIED | INTEREST_REMOVED | INTEREST_EXPIRED;

/// Number of hash positions in the legacy consistent-hash ring.
pub const LEGACY_HASH_SPACE: u64 = 1 << 31;

/// Multiplier used to synthesize virtual-node hashes.
pub const VIRTUAL_NODE_HASH_MULTIPLIER: i32 = 31;

/// Largest byte count that may be logged in a hex dump.
pub const MAX_HEX_DUMP_BYTES: usize = 64;
