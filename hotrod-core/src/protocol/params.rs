//! Operation-specific request bodies shared across versions.

use bytes::Bytes;

use super::constants::INTEREST_ALL;

/// A named server-side factory and its parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedFactory {
    /// Factory name; empty for none.
    pub name: String,
    /// Marshalled factory parameters.
    pub params: Vec<Bytes>,
}

impl NamedFactory {
    /// Creates a factory reference without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, param: impl Into<Bytes>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Returns true if no factory is named.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// Parameters for registering a client listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerParams {
    /// Replay existing entries as created events on registration.
    pub include_current_state: bool,
    /// Event filter factory.
    pub filter: NamedFactory,
    /// Event converter factory.
    pub converter: NamedFactory,
    /// Deliver converter output as raw bytes (2.1 and later).
    pub use_raw_data: bool,
    /// Bitmask of `INTEREST_*` constants (2.6 and later).
    pub interests: u32,
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self {
            include_current_state: false,
            filter: NamedFactory::default(),
            converter: NamedFactory::default(),
            use_raw_data: false,
            interests: INTEREST_ALL,
        }
    }
}

/// Parameters for starting an entry iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationStart {
    /// Segments to iterate, or `None` for all of them.
    pub segments: Option<Vec<u32>>,
    /// Optional filter/converter factory.
    pub filter_converter: Option<NamedFactory>,
    /// Entries per batch.
    pub batch_size: u32,
    /// Return entry metadata with each entry.
    pub metadata: bool,
}

impl IterationStart {
    /// Creates an iteration over every segment.
    pub fn new(batch_size: u32) -> Self {
        Self {
            segments: None,
            filter_converter: None,
            batch_size,
            metadata: false,
        }
    }

    /// Encodes the segment set as a little-endian bitset, trailing zero
    /// bytes removed.
    pub fn segment_bitset(&self) -> Option<Vec<u8>> {
        let segments = self.segments.as_ref()?;
        let mut bits: Vec<u8> = Vec::new();
        for &segment in segments {
            let byte = (segment / 8) as usize;
            if bits.len() <= byte {
                bits.resize(byte + 1, 0);
            }
            bits[byte] |= 1 << (segment % 8);
        }
        while bits.last() == Some(&0) {
            bits.pop();
        }
        Some(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_bitset() {
        let mut start = IterationStart::new(100);
        assert_eq!(start.segment_bitset(), None);

        start.segments = Some(vec![0, 3, 9]);
        assert_eq!(start.segment_bitset(), Some(vec![0b0000_1001, 0b0000_0010]));

        start.segments = Some(Vec::new());
        assert_eq!(start.segment_bitset(), Some(Vec::new()));
    }

    #[test]
    fn test_listener_defaults_listen_to_everything() {
        let params = ListenerParams::default();
        assert_eq!(params.interests, INTEREST_ALL);
        assert!(params.filter.is_empty());
    }
}
