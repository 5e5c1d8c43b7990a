//! The negotiated codec of one connection.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, warn};

use hotrod_core::protocol::{Codec, ProtocolVersion};

/// Holds the codec a connection currently speaks.
///
/// Every operation reads the codec once when it starts. A capability
/// probe may replace it with compare-and-set; when probes race only the
/// first swap from a given codec succeeds.
#[derive(Debug)]
pub struct CodecHolder {
    version: AtomicU8,
}

impl CodecHolder {
    /// Creates a holder speaking `codec`.
    pub fn new(codec: Codec) -> Self {
        Self {
            version: AtomicU8::new(codec.version().as_byte()),
        }
    }

    /// Returns the current codec.
    pub fn current(&self) -> Codec {
        let byte = self.version.load(Ordering::Acquire);
        // Only valid version bytes are ever stored.
        Codec::new(ProtocolVersion::from_byte(byte).unwrap_or_default())
    }

    /// Replaces `expected` with `negotiated`. Returns false if another
    /// swap got there first.
    pub fn try_swap(&self, expected: Codec, negotiated: Codec) -> bool {
        let swapped = self
            .version
            .compare_exchange(
                expected.version().as_byte(),
                negotiated.version().as_byte(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            debug!(
                from = %expected.version(),
                to = %negotiated.version(),
                "switched protocol version"
            );
        }
        swapped
    }

    /// Installs the version a probe negotiated, unless it is already
    /// current. Returns the codec in effect afterwards.
    pub fn negotiate(&self, negotiated: Codec) -> Codec {
        let current = self.current();
        if current == negotiated || self.try_swap(current, negotiated) {
            return negotiated;
        }
        let winner = self.current();
        if winner != negotiated {
            warn!(
                negotiated = %negotiated.version(),
                installed = %winner.version(),
                "concurrent probes negotiated different protocol versions"
            );
        }
        winner
    }
}

impl Default for CodecHolder {
    fn default() -> Self {
        Self::new(Codec::default())
    }
}
