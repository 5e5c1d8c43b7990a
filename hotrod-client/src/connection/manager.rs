//! Connection pool keyed by server address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use hotrod_core::protocol::ServerAddress;
use hotrod_core::{HotRodError, Result};

use super::connection::{Connection, ConnectionId};
use crate::cluster::{RoutingTable, TopologyEvent};
use crate::config::ClientConfig;
use crate::listener::ListenerRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 64;

type ConnectionMap = Arc<RwLock<HashMap<ServerAddress, Arc<Connection>>>>;

/// Events emitted during connection lifecycle.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connected to a server.
    Connected {
        /// The connection identifier.
        id: ConnectionId,
        /// The server address.
        address: ServerAddress,
    },
    /// Disconnected from a server.
    Disconnected {
        /// The connection identifier.
        id: ConnectionId,
        /// The server address.
        address: ServerAddress,
        /// Why the connection was dropped.
        reason: String,
    },
}

/// Keeps one probed connection per server and follows server-set changes
/// published by the routing table.
#[derive(Debug)]
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    routing: Arc<RoutingTable>,
    listeners: Arc<ListenerRegistry>,
    connections: ConnectionMap,
    event_sender: broadcast::Sender<ConnectionEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

fn server_address(address: SocketAddr) -> ServerAddress {
    ServerAddress::new(address.ip().to_string(), address.port())
}

impl ConnectionManager {
    /// Creates a manager whose routing table is seeded with the configured
    /// addresses.
    pub fn new(config: ClientConfig) -> Self {
        let initial = config
            .network()
            .addresses()
            .iter()
            .copied()
            .map(server_address)
            .collect();
        let listeners = Arc::new(ListenerRegistry::new(config.event_capacity()));
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            routing: Arc::new(RoutingTable::new(initial)),
            listeners,
            connections: Arc::new(RwLock::new(HashMap::new())),
            event_sender,
            watcher: Mutex::new(None),
        }
    }

    /// Returns the shared routing table.
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Returns the shared listener registry.
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_sender.subscribe()
    }

    /// Connects to the configured servers and starts following topology
    /// changes. Fails if no server could be reached.
    #[instrument(name = "connection_manager.start", skip(self))]
    pub async fn start(&self) -> Result<()> {
        for address in self.config.network().addresses() {
            let address = server_address(*address);
            if let Err(e) = self.connect_to(&address).await {
                warn!(address = %address, error = %e, "failed initial connection");
            }
        }

        if self.connections.read().await.is_empty() {
            return Err(HotRodError::Connection(
                "failed to establish any connections".to_string(),
            ));
        }

        self.spawn_topology_watcher();
        info!(connections = self.connection_count().await, "connection manager started");
        Ok(())
    }

    /// Opens and probes a connection to `address`, replacing any existing
    /// one.
    #[instrument(name = "connection_manager.connect", skip(self), fields(address = %address))]
    pub async fn connect_to(&self, address: &ServerAddress) -> Result<Arc<Connection>> {
        let resolved: Vec<SocketAddr> = tokio::net::lookup_host((address.host.as_str(), address.port))
            .await
            .map_err(|e| HotRodError::Connection(format!("failed to resolve {}: {}", address, e)))?
            .collect();

        let mut last_error = None;
        for socket_addr in resolved {
            match Connection::connect(
                socket_addr,
                &self.config,
                Arc::clone(&self.routing),
                Arc::clone(&self.listeners),
            )
            .await
            {
                Ok(connection) => {
                    connection.probe().await?;
                    let connection = Arc::new(connection);
                    let id = connection.id();
                    let previous = self
                        .connections
                        .write()
                        .await
                        .insert(address.clone(), Arc::clone(&connection));
                    if let Some(previous) = previous {
                        previous.close();
                    }
                    let _ = self.event_sender.send(ConnectionEvent::Connected {
                        id,
                        address: address.clone(),
                    });
                    return Ok(connection);
                }
                Err(e) => {
                    debug!(address = %socket_addr, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            HotRodError::Connection(format!("{} did not resolve to any address", address))
        }))
    }

    /// Returns a valid connection to `address`, reconnecting if needed.
    pub async fn connection_to(&self, address: &ServerAddress) -> Result<Arc<Connection>> {
        if let Some(connection) = self.connections.read().await.get(address) {
            if connection.is_valid() {
                return Ok(Arc::clone(connection));
            }
        }
        self.connect_to(address).await
    }

    /// Returns a connection to the server that should handle a request on
    /// `cache_name`: the key's primary owner when `hash` is known, otherwise
    /// any server. Falls back to any open connection if the chosen server
    /// cannot be reached.
    pub async fn connection_for(&self, cache_name: &[u8], hash: Option<i32>) -> Result<Arc<Connection>> {
        let routed = match self.routing.route(cache_name, hash) {
            Some(address) => self.connection_to(&address).await,
            None => Err(HotRodError::Connection("no servers known".to_string())),
        };

        match routed {
            Ok(connection) => Ok(connection),
            Err(e) => {
                let fallback = self
                    .connections
                    .read()
                    .await
                    .values()
                    .find(|c| c.is_valid())
                    .cloned();
                fallback.ok_or(e)
            }
        }
    }

    /// Closes the connection to `address`, if any.
    pub async fn disconnect(&self, address: &ServerAddress) {
        disconnect(&self.connections, &self.event_sender, address, "disconnected by client").await;
    }

    /// Closes every connection and stops following topology changes.
    #[instrument(name = "connection_manager.shutdown", skip(self))]
    pub async fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
        let addresses = self.connected_addresses().await;
        for address in addresses {
            self.disconnect(&address).await;
        }
        info!("connection manager shut down");
    }

    /// Returns the number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns the addresses with an open connection.
    pub async fn connected_addresses(&self) -> Vec<ServerAddress> {
        self.connections.read().await.keys().cloned().collect()
    }

    fn spawn_topology_watcher(&self) {
        let mut events = self.routing.subscribe();
        let connections = Arc::clone(&self.connections);
        let sender = self.event_sender.clone();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TopologyEvent::MembersChanged { removed, .. }) => {
                        for address in removed {
                            disconnect(&connections, &sender, &address, "left the cluster").await;
                        }
                    }
                    Ok(TopologyEvent::ClusterSwitched { servers, .. }) => {
                        let stale: Vec<ServerAddress> = connections
                            .read()
                            .await
                            .keys()
                            .filter(|a| !servers.contains(a))
                            .cloned()
                            .collect();
                        for address in stale {
                            disconnect(&connections, &sender, &address, "cluster switched").await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "topology watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
    }
}

async fn disconnect(
    connections: &ConnectionMap,
    sender: &broadcast::Sender<ConnectionEvent>,
    address: &ServerAddress,
    reason: &str,
) {
    let removed = connections.write().await.remove(address);
    if let Some(connection) = removed {
        connection.close();
        let _ = sender.send(ConnectionEvent::Disconnected {
            id: connection.id(),
            address: address.clone(),
            reason: reason.to_string(),
        });
        info!(id = %connection.id(), address = %address, reason = reason, "disconnected from server");
    }
}
