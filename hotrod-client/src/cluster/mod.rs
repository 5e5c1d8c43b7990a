//! Cluster topology tracking and request routing.

mod routing_table;

pub use routing_table::{CacheTopology, RoutingTable, TopologyEvent};
