//! Protocol versions and the per-version capability table.
//!
//! Every version behaves like its predecessor plus the features whose
//! introduction version it has reached, so adding a version only means
//! adding a constant and, if it brings a wire change, a row in
//! [`FEATURE_TABLE`].

use std::fmt;
use std::str::FromStr;

use crate::error::HotRodError;

/// A wire-level behavior that depends on the negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Legacy hash-ring topology carries a virtual-node count.
    VirtualNodeCount,
    /// Topology carries segment ownership instead of a hash ring; the
    /// request header no longer carries a transaction marker.
    SegmentTopology,
    /// Client listeners and cache events.
    Events,
    /// Previous values are signalled by status instead of the request flag.
    PreviousValueByStatus,
    /// Custom events may carry raw converter output.
    RawCustomEvents,
    /// Listener registration carries a raw-data byte.
    RawListenerData,
    /// Entry-expired events.
    ExpiredEvents,
    /// Expiration is a time-unit byte followed by optional vlongs.
    TimeUnitExpiration,
    /// Listener registration carries an interest mask.
    ListenerInterests,
    /// Counter events.
    CounterEvents,
    /// Request headers carry key and value media types.
    MediaTypeHeader,
    /// Object-storage hint statuses.
    ObjectStorageStatus,
    /// Ping reports the server version and supported operations.
    PingCapabilities,
    /// Near-cache bloom filter hint on listener registration.
    BloomFilter,
    /// Nanosecond and microsecond expiration units.
    SubMillisecondUnits,
}

/// A negotiated Hot Rod protocol version, stored as its wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u8);

/// Each feature and the first version that carries it.
pub const FEATURE_TABLE: &[(Feature, ProtocolVersion)] = &[
    (Feature::VirtualNodeCount, ProtocolVersion::V1_1),
    (Feature::SegmentTopology, ProtocolVersion::V2_0),
    (Feature::Events, ProtocolVersion::V2_0),
    (Feature::PreviousValueByStatus, ProtocolVersion::V2_0),
    (Feature::RawCustomEvents, ProtocolVersion::V2_1),
    (Feature::RawListenerData, ProtocolVersion::V2_1),
    (Feature::ExpiredEvents, ProtocolVersion::V2_1),
    (Feature::TimeUnitExpiration, ProtocolVersion::V2_2),
    (Feature::ListenerInterests, ProtocolVersion::V2_6),
    (Feature::CounterEvents, ProtocolVersion::V2_7),
    (Feature::MediaTypeHeader, ProtocolVersion::V2_8),
    (Feature::ObjectStorageStatus, ProtocolVersion::V3_0),
    (Feature::PingCapabilities, ProtocolVersion::V3_0),
    (Feature::BloomFilter, ProtocolVersion::V3_1),
    (Feature::SubMillisecondUnits, ProtocolVersion::V4_0),
];

impl ProtocolVersion {
    /// Protocol 1.0.
    pub const V1_0: ProtocolVersion = ProtocolVersion(10);
    /// Protocol 1.1.
    pub const V1_1: ProtocolVersion = ProtocolVersion(11);
    /// Protocol 1.2.
    pub const V1_2: ProtocolVersion = ProtocolVersion(12);
    /// Protocol 1.3.
    pub const V1_3: ProtocolVersion = ProtocolVersion(13);
    /// Protocol 2.0.
    pub const V2_0: ProtocolVersion = ProtocolVersion(20);
    /// Protocol 2.1.
    pub const V2_1: ProtocolVersion = ProtocolVersion(21);
    /// Protocol 2.2.
    pub const V2_2: ProtocolVersion = ProtocolVersion(22);
    /// Protocol 2.3.
    pub const V2_3: ProtocolVersion = ProtocolVersion(23);
    /// Protocol 2.4.
    pub const V2_4: ProtocolVersion = ProtocolVersion(24);
    /// Protocol 2.5.
    pub const V2_5: ProtocolVersion = ProtocolVersion(25);
    /// Protocol 2.6.
    pub const V2_6: ProtocolVersion = ProtocolVersion(26);
    /// Protocol 2.7.
    pub const V2_7: ProtocolVersion = ProtocolVersion(27);
    /// Protocol 2.8.
    pub const V2_8: ProtocolVersion = ProtocolVersion(28);
    /// Protocol 2.9.
    pub const V2_9: ProtocolVersion = ProtocolVersion(29);
    /// Protocol 3.0.
    pub const V3_0: ProtocolVersion = ProtocolVersion(30);
    /// Protocol 3.1.
    pub const V3_1: ProtocolVersion = ProtocolVersion(31);
    /// Protocol 4.0.
    pub const V4_0: ProtocolVersion = ProtocolVersion(40);

    /// The newest version this client speaks.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V4_0;

    /// Every supported version, oldest first.
    pub const ALL: &'static [ProtocolVersion] = &[
        Self::V1_0,
        Self::V1_1,
        Self::V1_2,
        Self::V1_3,
        Self::V2_0,
        Self::V2_1,
        Self::V2_2,
        Self::V2_3,
        Self::V2_4,
        Self::V2_5,
        Self::V2_6,
        Self::V2_7,
        Self::V2_8,
        Self::V2_9,
        Self::V3_0,
        Self::V3_1,
        Self::V4_0,
    ];

    /// Validates a version byte.
    pub fn from_byte(byte: u8) -> Result<Self, HotRodError> {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.0 == byte)
            .ok_or_else(|| HotRodError::Unsupported(format!("protocol version byte {}", byte)))
    }

    /// Returns the newest supported version not newer than `byte`.
    ///
    /// Servers may advertise versions this client does not know; the
    /// client then speaks the closest older one.
    pub fn at_most(byte: u8) -> Option<Self> {
        Self::ALL.iter().rev().copied().find(|v| v.0 <= byte)
    }

    /// Returns the wire byte.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Returns the major version number.
    pub fn major(self) -> u8 {
        self.0 / 10
    }

    /// Returns the minor version number.
    pub fn minor(self) -> u8 {
        self.0 % 10
    }

    /// Returns true if this version carries `feature`.
    pub fn supports(self, feature: Feature) -> bool {
        FEATURE_TABLE
            .iter()
            .any(|(f, since)| *f == feature && self >= *since)
    }

    /// Returns the features this version carries.
    pub fn features(self) -> impl Iterator<Item = Feature> {
        FEATURE_TABLE
            .iter()
            .filter(move |(_, since)| self >= *since)
            .map(|(f, _)| *f)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

impl FromStr for ProtocolVersion {
    type Err = HotRodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HotRodError::Configuration(format!("invalid protocol version: {}", s));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        let major: u8 = major.parse().map_err(|_| invalid())?;
        let minor: u8 = minor.parse().map_err(|_| invalid())?;
        if minor > 9 {
            return Err(invalid());
        }
        let byte = major.checked_mul(10).and_then(|m| m.checked_add(minor));
        byte.and_then(|b| Self::from_byte(b).ok()).ok_or_else(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_ordered() {
        for pair in ProtocolVersion::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_from_byte() {
        assert_eq!(ProtocolVersion::from_byte(28).unwrap(), ProtocolVersion::V2_8);
        assert!(ProtocolVersion::from_byte(14).is_err());
        assert!(ProtocolVersion::from_byte(32).is_err());
    }

    #[test]
    fn test_at_most_picks_closest_older() {
        assert_eq!(ProtocolVersion::at_most(35), Some(ProtocolVersion::V3_1));
        assert_eq!(ProtocolVersion::at_most(99), Some(ProtocolVersion::V4_0));
        assert_eq!(ProtocolVersion::at_most(9), None);
    }

    #[test]
    fn test_feature_gates() {
        let v13 = ProtocolVersion::V1_3;
        assert!(v13.supports(Feature::VirtualNodeCount));
        assert!(!v13.supports(Feature::SegmentTopology));
        assert!(!ProtocolVersion::V1_0.supports(Feature::VirtualNodeCount));

        assert!(ProtocolVersion::V2_1.supports(Feature::ExpiredEvents));
        assert!(!ProtocolVersion::V2_0.supports(Feature::ExpiredEvents));
        assert!(!ProtocolVersion::V2_7.supports(Feature::MediaTypeHeader));
        assert!(ProtocolVersion::V2_8.supports(Feature::MediaTypeHeader));
        assert!(!ProtocolVersion::V3_0.supports(Feature::BloomFilter));
        assert!(ProtocolVersion::V3_1.supports(Feature::BloomFilter));
        assert!(!ProtocolVersion::V3_1.supports(Feature::SubMillisecondUnits));
        assert!(ProtocolVersion::V4_0.supports(Feature::SubMillisecondUnits));
    }

    #[test]
    fn test_features_grow_monotonically() {
        let mut previous = 0;
        for version in ProtocolVersion::ALL {
            let count = version.features().count();
            assert!(count >= previous, "{version}");
            previous = count;
        }
        assert_eq!(previous, FEATURE_TABLE.len());
    }

    #[test]
    fn test_display_and_parse() {
        assert_eq!(ProtocolVersion::V2_8.to_string(), "2.8");
        assert_eq!("3.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V3_1);
        assert!("3.5".parse::<ProtocolVersion>().is_err());
        assert!("four".parse::<ProtocolVersion>().is_err());
    }
}
