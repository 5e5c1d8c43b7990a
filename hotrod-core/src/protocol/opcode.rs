//! Operation codes and the request to response mapping.

use std::fmt;

use crate::error::HotRodError;

/// Response opcode used for every server-reported error.
pub const ERROR_RESPONSE: u8 = 0x50;

/// Event opcode: an entry was created.
pub const CACHE_ENTRY_CREATED_EVENT: u8 = 0x60;
/// Event opcode: an entry was modified.
pub const CACHE_ENTRY_MODIFIED_EVENT: u8 = 0x61;
/// Event opcode: an entry was removed.
pub const CACHE_ENTRY_REMOVED_EVENT: u8 = 0x62;
/// Event opcode: an entry expired.
pub const CACHE_ENTRY_EXPIRED_EVENT: u8 = 0x63;
/// Event opcode: a counter value or state changed.
pub const COUNTER_EVENT: u8 = 0x66;

/// Returns true if `opcode` identifies a server-pushed event.
pub fn is_event(opcode: u8) -> bool {
    matches!(
        opcode,
        CACHE_ENTRY_CREATED_EVENT
            | CACHE_ENTRY_MODIFIED_EVENT
            | CACHE_ENTRY_REMOVED_EVENT
            | CACHE_ENTRY_EXPIRED_EVENT
            | COUNTER_EVENT
    )
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $request:literal => $response:literal,)+) => {
        /// A request operation code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $($(#[$doc])* $name = $request,)+
        }

        impl OpCode {
            /// Every known request opcode.
            pub const ALL: &'static [OpCode] = &[$(OpCode::$name,)+];

            /// Returns the opcode the server answers this request with.
            pub fn response_code(self) -> u8 {
                match self {
                    $(OpCode::$name => $response,)+
                }
            }
        }

        impl TryFrom<u8> for OpCode {
            type Error = HotRodError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($request => Ok(OpCode::$name),)+
                    other => Err(HotRodError::UnknownOpcode(other)),
                }
            }
        }
    };
}

opcodes! {
    /// Store an entry.
    Put = 0x01 => 0x02,
    /// Read an entry.
    Get = 0x03 => 0x04,
    /// Store an entry if the key is absent.
    PutIfAbsent = 0x05 => 0x06,
    /// Replace an existing entry.
    Replace = 0x07 => 0x08,
    /// Replace an entry at a given version.
    ReplaceIfUnmodified = 0x09 => 0x0A,
    /// Remove an entry.
    Remove = 0x0B => 0x0C,
    /// Remove an entry at a given version.
    RemoveIfUnmodified = 0x0D => 0x0E,
    /// Test whether a key exists.
    ContainsKey = 0x0F => 0x10,
    /// Read an entry with its version.
    GetWithVersion = 0x11 => 0x12,
    /// Remove every entry.
    Clear = 0x13 => 0x14,
    /// Read server statistics.
    Stats = 0x15 => 0x16,
    /// Liveness check and capability probe.
    Ping = 0x17 => 0x18,
    /// Read many entries.
    BulkGet = 0x19 => 0x1A,
    /// Read an entry with its metadata.
    GetWithMetadata = 0x1B => 0x1C,
    /// Read many keys.
    BulkGetKeys = 0x1D => 0x1E,
    /// Run a remote query.
    Query = 0x1F => 0x20,
    /// List authentication mechanisms.
    AuthMechList = 0x21 => 0x22,
    /// Authenticate.
    Auth = 0x23 => 0x24,
    /// Register a client listener.
    AddClientListener = 0x25 => 0x26,
    /// Unregister a client listener.
    RemoveClientListener = 0x27 => 0x28,
    /// Read the cache size.
    Size = 0x29 => 0x2A,
    /// Run a server task.
    Exec = 0x2B => 0x2C,
    /// Store many entries.
    PutAll = 0x2D => 0x2E,
    /// Read many entries by key.
    GetAll = 0x2F => 0x30,
    /// Open an entry iterator.
    IterationStart = 0x31 => 0x32,
    /// Fetch the next iterator batch.
    IterationNext = 0x33 => 0x34,
    /// Close an entry iterator.
    IterationEnd = 0x35 => 0x36,
    /// Read a value as a stream.
    GetStream = 0x37 => 0x38,
    /// Write a value as a stream.
    PutStream = 0x39 => 0x3A,
    /// Prepare a transaction.
    PrepareTx = 0x3B => 0x3C,
    /// Commit a transaction.
    CommitTx = 0x3D => 0x3E,
    /// Roll back a transaction.
    RollbackTx = 0x3F => 0x40,
    /// Register a near-cache bloom filter listener.
    AddBloomFilterNearCacheListener = 0x41 => 0x42,
    /// Push an updated bloom filter.
    UpdateBloomFilter = 0x43 => 0x44,
    /// Create a counter.
    CounterCreate = 0x4B => 0x4C,
    /// Read a counter's configuration.
    CounterGetConfiguration = 0x4D => 0x4E,
    /// Test whether a counter is defined.
    CounterIsDefined = 0x4F => 0x51,
    /// Add to a counter and read the result.
    CounterAddAndGet = 0x52 => 0x53,
    /// Reset a counter.
    CounterReset = 0x54 => 0x55,
    /// Read a counter.
    CounterGet = 0x56 => 0x57,
    /// Compare and swap a counter.
    CounterCas = 0x58 => 0x59,
    /// Register a counter listener.
    CounterAddListener = 0x5A => 0x5B,
    /// Unregister a counter listener.
    CounterRemoveListener = 0x5C => 0x5D,
    /// Remove a counter.
    CounterRemove = 0x5E => 0x5F,
    /// List counter names.
    CounterGetNames = 0x64 => 0x65,
    /// Forget a transaction.
    ForgetTx = 0x79 => 0x7A,
    /// Fetch in-doubt transactions.
    FetchTxRecovery = 0x7B => 0x7C,
    /// Prepare a transaction (second revision).
    PrepareTxV2 = 0x7D => 0x7E,
}

impl OpCode {
    /// Returns the raw opcode byte.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#04x})", self, self.code())
    }
}
