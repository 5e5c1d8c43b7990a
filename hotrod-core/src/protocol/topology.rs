//! Topology updates embedded in response headers.

use std::fmt;

use super::constants::VIRTUAL_NODE_HASH_MULTIPLIER;
use super::request::ClientIntelligence;
use super::version::{Feature, ProtocolVersion};
use super::wire::WireReader;
use crate::error::{HotRodError, Result};

/// An unresolved server address as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddress {
    /// Creates an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self> {
        let host = reader.read_string()?;
        let port = reader.read_u16()?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Key ownership carried by a topology update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashInfo {
    /// The client did not declare hash-distribution awareness.
    NotRequested,
    /// Segment ownership (2.0 and later).
    Segments {
        /// 0 means no consistent hash is in use.
        hash_function_version: u8,
        /// Number of segments in the key space.
        num_segments: u32,
        /// Owners per segment, primary first. Empty when the hash function
        /// version is 0.
        owners: Vec<Vec<ServerAddress>>,
    },
    /// Legacy consistent-hash ring (1.x).
    HashRing {
        /// Number of owners per key.
        num_owners: u16,
        /// Hash function version.
        hash_function_version: u8,
        /// Size of the hash space.
        hash_space: u32,
        /// Ring positions, including synthesized virtual nodes.
        positions: Vec<(ServerAddress, i32)>,
    },
}

/// A decoded topology block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyUpdate {
    /// The new topology id.
    pub topology_id: i32,
    /// Cluster members in server order.
    pub members: Vec<ServerAddress>,
    /// Key ownership.
    pub hash: HashInfo,
}

impl TopologyUpdate {
    /// Reads the block that follows a topology-changed marker.
    pub fn read(
        reader: &mut WireReader<'_>,
        version: ProtocolVersion,
        intelligence: ClientIntelligence,
    ) -> Result<Self> {
        if version.supports(Feature::SegmentTopology) {
            Self::read_segments(reader, intelligence)
        } else if intelligence.is_hash_aware() {
            Self::read_hash_ring(reader, version)
        } else {
            let topology_id = reader.read_vint()? as i32;
            let members = read_members(reader)?;
            Ok(Self {
                topology_id,
                members,
                hash: HashInfo::NotRequested,
            })
        }
    }

    fn read_segments(reader: &mut WireReader<'_>, intelligence: ClientIntelligence) -> Result<Self> {
        let topology_id = reader.read_vint()? as i32;
        let members = read_members(reader)?;
        if !intelligence.is_hash_aware() {
            return Ok(Self {
                topology_id,
                members,
                hash: HashInfo::NotRequested,
            });
        }

        let hash_function_version = reader.read_u8()?;
        let num_segments = reader.read_vint()?;
        let mut owners = Vec::new();
        if hash_function_version > 0 {
            owners.reserve(num_segments.min(u16::MAX as u32) as usize);
            for segment in 0..num_segments {
                let count = reader.read_u8()?;
                let mut segment_owners = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let index = reader.read_vint()? as usize;
                    let address = members.get(index).ok_or_else(|| {
                        HotRodError::InvalidResponse(format!(
                            "segment {} names member {} of {}",
                            segment,
                            index,
                            members.len()
                        ))
                    })?;
                    segment_owners.push(address.clone());
                }
                owners.push(segment_owners);
            }
        }

        Ok(Self {
            topology_id,
            members,
            hash: HashInfo::Segments {
                hash_function_version,
                num_segments,
                owners,
            },
        })
    }

    fn read_hash_ring(reader: &mut WireReader<'_>, version: ProtocolVersion) -> Result<Self> {
        let topology_id = reader.read_vint()? as i32;
        let num_owners = reader.read_u16()?;
        let hash_function_version = reader.read_u8()?;
        let hash_space = reader.read_vint()?;
        let num_servers = reader.read_vint()?;
        let virtual_nodes = if version.supports(Feature::VirtualNodeCount) {
            reader.read_vint()?
        } else {
            1
        };

        let mut members: Vec<ServerAddress> = Vec::new();
        let mut positions = Vec::new();
        for _ in 0..num_servers {
            let address = ServerAddress::read(reader)?;
            let hash = reader.read_i32()?;
            if !members.contains(&address) {
                members.push(address.clone());
            }
            if virtual_nodes > 1 {
                for j in 1..virtual_nodes as i32 {
                    let synthesized = VIRTUAL_NODE_HASH_MULTIPLIER
                        .wrapping_mul(j)
                        .wrapping_add(hash)
                        & i32::MAX;
                    positions.push((address.clone(), synthesized));
                }
            }
            positions.push((address, hash));
        }

        Ok(Self {
            topology_id,
            members,
            hash: HashInfo::HashRing {
                num_owners,
                hash_function_version,
                hash_space,
                positions,
            },
        })
    }
}

fn read_members(reader: &mut WireReader<'_>) -> Result<Vec<ServerAddress>> {
    let count = reader.read_vint()?;
    let mut members = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        members.push(ServerAddress::read(reader)?);
    }
    Ok(members)
}

/// What happened to a topology update offered to a [`TopologySink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyOutcome {
    /// The update replaced the routing table contents.
    Applied,
    /// The table already holds this topology id.
    Duplicate,
    /// The cluster view changed since the request was prepared.
    AgeMismatch,
    /// The response carried no topology update.
    NotRequested,
}

impl TopologyOutcome {
    /// Returns true if the update changed the routing table.
    pub fn is_applied(self) -> bool {
        self == TopologyOutcome::Applied
    }
}

/// Receives topology updates decoded from responses.
///
/// The codec calls this only after a whole response has been parsed, and
/// even when the response carries a server error.
pub trait TopologySink: Send + Sync {
    /// Offers an update for `cache_name`, observed by a request prepared at
    /// `topology_age`.
    fn apply_topology(
        &self,
        cache_name: &[u8],
        topology_age: u32,
        update: TopologyUpdate,
    ) -> TopologyOutcome;
}

/// A sink that drops every update, for clients with basic intelligence.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardTopology;

impl TopologySink for DiscardTopology {
    fn apply_topology(&self, _: &[u8], _: u32, _: TopologyUpdate) -> TopologyOutcome {
        TopologyOutcome::NotRequested
    }
}
