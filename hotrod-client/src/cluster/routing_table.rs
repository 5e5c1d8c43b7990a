//! Per-cache topology and segment ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, info};

use hotrod_core::protocol::{
    CacheName, HashInfo, RequestHeader, ServerAddress, TopologyOutcome, TopologySink,
    TopologyUpdate, DEFAULT_TOPOLOGY_ID, LEGACY_HASH_SPACE,
};

/// Capacity of the topology event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A consistent view of one cache's topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTopology {
    topology_id: i32,
    members: Vec<ServerAddress>,
    hash: HashInfo,
}

impl CacheTopology {
    fn initial(members: Vec<ServerAddress>, topology_id: i32) -> Self {
        Self {
            topology_id,
            members,
            hash: HashInfo::NotRequested,
        }
    }

    /// Returns the topology id.
    pub fn topology_id(&self) -> i32 {
        self.topology_id
    }

    /// Returns the member addresses.
    pub fn members(&self) -> &[ServerAddress] {
        &self.members
    }

    /// Returns the hash distribution, if any.
    pub fn hash(&self) -> &HashInfo {
        &self.hash
    }

    /// Returns the number of segments, or `None` without segment ownership.
    pub fn num_segments(&self) -> Option<u32> {
        match &self.hash {
            HashInfo::Segments { num_segments, .. } if *num_segments > 0 => Some(*num_segments),
            _ => None,
        }
    }

    /// Maps a key hash to its segment.
    ///
    /// Segments divide the non-negative half of the hash space into
    /// `ceil(2^31 / num_segments)`-sized ranges.
    pub fn segment_for_hash(&self, hash: i32) -> Option<u32> {
        let num_segments = u64::from(self.num_segments()?);
        let segment_size = LEGACY_HASH_SPACE.div_ceil(num_segments);
        let normalized = u64::from((hash & i32::MAX) as u32);
        Some((normalized / segment_size) as u32)
    }

    /// Returns the owners of `segment`, primary first.
    pub fn owners_for_segment(&self, segment: u32) -> Option<&[ServerAddress]> {
        match &self.hash {
            HashInfo::Segments { owners, .. } => owners.get(segment as usize).map(Vec::as_slice),
            _ => None,
        }
    }

    /// Returns the owners of a key hash, primary first. Empty when the
    /// topology carries no usable hash distribution.
    pub fn owners_for_hash(&self, hash: i32) -> Vec<ServerAddress> {
        match &self.hash {
            HashInfo::Segments {
                hash_function_version,
                ..
            } if *hash_function_version != 0 => self
                .segment_for_hash(hash)
                .and_then(|segment| self.owners_for_segment(segment))
                .map(<[ServerAddress]>::to_vec)
                .unwrap_or_default(),
            HashInfo::HashRing {
                num_owners,
                positions,
                ..
            } => ring_owners(positions, hash, *num_owners as usize),
            _ => Vec::new(),
        }
    }
}

/// Walks the legacy hash wheel clockwise from `hash`, collecting distinct
/// servers.
fn ring_owners(positions: &[(ServerAddress, i32)], hash: i32, num_owners: usize) -> Vec<ServerAddress> {
    if positions.is_empty() || num_owners == 0 {
        return Vec::new();
    }
    let mut ring: Vec<&(ServerAddress, i32)> = positions.iter().collect();
    ring.sort_by_key(|(_, position)| *position);

    let normalized = hash & i32::MAX;
    let start = ring.partition_point(|(_, position)| *position < normalized) % ring.len();

    let mut owners: Vec<ServerAddress> = Vec::with_capacity(num_owners);
    for (address, _) in ring.iter().cycle().skip(start).take(ring.len()) {
        if !owners.contains(address) {
            owners.push(address.clone());
            if owners.len() == num_owners {
                break;
            }
        }
    }
    owners
}

/// A change to the set of servers the client should talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// The members of a cache changed.
    MembersChanged {
        /// Cache the update arrived for.
        cache_name: Bytes,
        /// The new topology id.
        topology_id: i32,
        /// Servers that joined.
        added: Vec<ServerAddress>,
        /// Servers that left.
        removed: Vec<ServerAddress>,
    },
    /// The client moved to another cluster.
    ClusterSwitched {
        /// The new topology age.
        topology_age: u32,
        /// Servers of the new cluster.
        servers: Vec<ServerAddress>,
    },
}

/// Routing state shared by every connection of a client.
///
/// Readers receive an `Arc` snapshot, so a concurrent update never shows
/// them a partially replaced table.
#[derive(Debug)]
pub struct RoutingTable {
    caches: RwLock<HashMap<Bytes, Arc<CacheTopology>>>,
    initial_servers: RwLock<Vec<ServerAddress>>,
    topology_age: AtomicU32,
    event_sender: broadcast::Sender<TopologyEvent>,
}

impl RoutingTable {
    /// Creates a routing table seeded with configured servers.
    pub fn new(initial_servers: Vec<ServerAddress>) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            caches: RwLock::new(HashMap::new()),
            initial_servers: RwLock::new(initial_servers),
            topology_age: AtomicU32::new(0),
            event_sender,
        }
    }

    /// Subscribes to server-set changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.event_sender.subscribe()
    }

    /// Returns the current topology age.
    pub fn topology_age(&self) -> u32 {
        self.topology_age.load(Ordering::Acquire)
    }

    fn read_caches(&self) -> RwLockReadGuard<'_, HashMap<Bytes, Arc<CacheTopology>>> {
        self.caches.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_caches(&self) -> RwLockWriteGuard<'_, HashMap<Bytes, Arc<CacheTopology>>> {
        self.caches.write().unwrap_or_else(|e| e.into_inner())
    }

    fn initial_servers(&self) -> Vec<ServerAddress> {
        self.initial_servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Returns a snapshot of a cache's topology.
    pub fn snapshot(&self, cache_name: &[u8]) -> Option<Arc<CacheTopology>> {
        self.read_caches().get(cache_name).cloned()
    }

    /// Returns the topology id to send for `cache_name`.
    pub fn topology_id(&self, cache_name: &[u8]) -> i32 {
        self.snapshot(cache_name)
            .map(|t| t.topology_id)
            .unwrap_or(DEFAULT_TOPOLOGY_ID)
    }

    /// Stamps a request with the cache's current topology id and age.
    pub fn prepare(&self, header: RequestHeader) -> RequestHeader {
        let age = self.topology_age();
        let topology_id = self.topology_id(&header.cache_name);
        header.with_topology(topology_id, age)
    }

    /// Returns the servers known for `cache_name`, falling back to the
    /// configured servers.
    pub fn servers(&self, cache_name: &[u8]) -> Vec<ServerAddress> {
        match self.snapshot(cache_name) {
            Some(topology) if !topology.members.is_empty() => topology.members.clone(),
            _ => self.initial_servers(),
        }
    }

    /// Returns the owners of a segment, primary first.
    pub fn owners_for_segment(&self, cache_name: &[u8], segment: u32) -> Option<Vec<ServerAddress>> {
        self.snapshot(cache_name)?
            .owners_for_segment(segment)
            .map(<[ServerAddress]>::to_vec)
    }

    /// Maps a key hash to its segment.
    pub fn segment_for_hash(&self, cache_name: &[u8], hash: i32) -> Option<u32> {
        self.snapshot(cache_name)?.segment_for_hash(hash)
    }

    /// Returns the owners of a key hash, primary first.
    pub fn owners_for_hash(&self, cache_name: &[u8], hash: i32) -> Vec<ServerAddress> {
        self.snapshot(cache_name)
            .map(|topology| topology.owners_for_hash(hash))
            .unwrap_or_default()
    }

    /// Picks the server for a key: its primary owner when known, otherwise
    /// a random server.
    pub fn route(&self, cache_name: &[u8], hash: Option<i32>) -> Option<ServerAddress> {
        if let Some(primary) = hash.and_then(|h| self.owners_for_hash(cache_name, h).into_iter().next())
        {
            return Some(primary);
        }
        self.random_server(cache_name)
    }

    /// Picks a random server for `cache_name`.
    pub fn random_server(&self, cache_name: &[u8]) -> Option<ServerAddress> {
        self.servers(cache_name).choose(&mut rand::thread_rng()).cloned()
    }

    /// Forgets every cache topology and moves to another cluster.
    ///
    /// Responses to requests prepared before the switch carry the old age
    /// and no longer update the table.
    pub fn switch_cluster(&self, servers: Vec<ServerAddress>) -> u32 {
        let mut caches = self.write_caches();
        let age = self.topology_age.fetch_add(1, Ordering::AcqRel) + 1;
        caches.clear();
        *self.initial_servers.write().unwrap_or_else(|e| e.into_inner()) = servers.clone();
        drop(caches);

        info!(topology_age = age, servers = servers.len(), "switched cluster");
        let _ = self.event_sender.send(TopologyEvent::ClusterSwitched {
            topology_age: age,
            servers,
        });
        age
    }

    /// Resets a cache to the configured servers, e.g. after every member
    /// became unreachable.
    pub fn reset(&self, cache_name: &[u8]) {
        let initial = self.initial_servers();
        self.write_caches().insert(
            Bytes::copy_from_slice(cache_name),
            Arc::new(CacheTopology::initial(initial, DEFAULT_TOPOLOGY_ID)),
        );
        debug!(cache = %CacheName(cache_name), "reset cache topology");
    }
}

impl TopologySink for RoutingTable {
    fn apply_topology(
        &self,
        cache_name: &[u8],
        topology_age: u32,
        update: TopologyUpdate,
    ) -> TopologyOutcome {
        let mut caches = self.write_caches();
        if topology_age != self.topology_age() {
            return TopologyOutcome::AgeMismatch;
        }

        let previous = caches.get(cache_name).cloned();
        if let Some(current) = &previous {
            if update.topology_id == current.topology_id {
                return TopologyOutcome::Duplicate;
            }
            if update.topology_id < current.topology_id {
                // Servers restarted within the same cluster view.
                debug!(
                    cache = %CacheName(cache_name),
                    current = current.topology_id,
                    topology_id = update.topology_id,
                    "topology id went backwards"
                );
            }
        }

        let old_members = previous
            .map(|t| t.members.clone())
            .unwrap_or_else(|| self.initial_servers());
        let added: Vec<ServerAddress> = update
            .members
            .iter()
            .filter(|m| !old_members.contains(m))
            .cloned()
            .collect();
        let removed: Vec<ServerAddress> = old_members
            .iter()
            .filter(|m| !update.members.contains(m))
            .cloned()
            .collect();

        let topology_id = update.topology_id;
        let cache_key = Bytes::copy_from_slice(cache_name);
        caches.insert(
            cache_key.clone(),
            Arc::new(CacheTopology {
                topology_id,
                members: update.members,
                hash: update.hash,
            }),
        );
        drop(caches);

        if !added.is_empty() || !removed.is_empty() {
            info!(
                cache = %CacheName(cache_name),
                topology_id = topology_id,
                added = added.len(),
                removed = removed.len(),
                "cache members changed"
            );
            let _ = self.event_sender.send(TopologyEvent::MembersChanged {
                cache_name: cache_key,
                topology_id,
                added,
                removed,
            });
        }
        TopologyOutcome::Applied
    }
}
