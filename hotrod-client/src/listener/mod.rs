//! Client listener registration and event dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

use hotrod_core::protocol::ClientEvent;

/// Identifies a client listener on the server; 16 random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(Bytes);

impl ListenerId {
    /// Generates a new random listener id.
    pub fn new() -> Self {
        Self(Bytes::copy_from_slice(Uuid::new_v4().as_bytes()))
    }

    /// Wraps raw id bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the id as sent on the wire.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Uuid::from_slice(&self.0) {
            Ok(uuid) => write!(f, "listener-{}", uuid),
            Err(_) => {
                write!(f, "listener-")?;
                for byte in self.0.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// Statistics for event dispatch on one registry.
#[derive(Debug, Default)]
pub struct ListenerStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    unexpected: AtomicU64,
}

impl ListenerStats {
    /// Returns the number of events delivered to listeners.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Returns the number of events dropped because a listener lagged or
    /// went away.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of events for unknown listener ids.
    pub fn unexpected(&self) -> u64 {
        self.unexpected.load(Ordering::Relaxed)
    }

    pub(crate) fn record_unexpected(&self) {
        self.unexpected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Routes decoded events to registered listeners.
#[derive(Debug)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<Bytes, mpsc::Sender<ClientEvent>>>,
    capacity: usize,
    stats: ListenerStats,
}

impl ListenerRegistry {
    /// Creates a registry whose listener channels hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: ListenerStats::default(),
        }
    }

    /// Registers `id` and returns the receiving end of its event channel.
    pub fn register(&self, id: &ListenerId) -> mpsc::Receiver<ClientEvent> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.as_bytes().clone(), sender);
        receiver
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove(&self, id: &[u8]) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Returns true if `id` belongs to a registered listener.
    pub fn is_registered(&self, id: &[u8]) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns dispatch statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Delivers an event to its listener without waiting.
    ///
    /// Events for a full channel are dropped; a closed channel removes the
    /// listener.
    pub fn dispatch(&self, event: ClientEvent) -> bool {
        let id = event.listener_id().clone();
        let sender = match self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            Some(sender) => sender.clone(),
            None => {
                self.stats.record_unexpected();
                return false;
            }
        };

        match sender.try_send(event) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                trace!(listener = %ListenerId(id), "delivered event");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(listener = %ListenerId(id), "listener lagging, dropped event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.remove(&id);
                false
            }
        }
    }
}

/// A registered listener and its event stream.
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    registry: Arc<ListenerRegistry>,
    receiver: mpsc::Receiver<ClientEvent>,
}

impl ListenerHandle {
    pub(crate) fn new(
        id: ListenerId,
        registry: Arc<ListenerRegistry>,
        receiver: mpsc::Receiver<ClientEvent>,
    ) -> Self {
        Self {
            id,
            registry,
            receiver,
        }
    }

    /// Returns the listener id.
    pub fn id(&self) -> &ListenerId {
        &self.id
    }

    /// Waits for the next event. Returns `None` once the listener is
    /// removed or its connection closes.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.receiver.recv().await
    }

    /// Returns an event if one is ready.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.registry.remove(self.id.as_bytes());
    }
}
