//! Connection registry
//!
//! Thread-safe map of every connection currently in the OPEN state. Owned by
//! the server and handed to connection tasks through an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

use super::error::DispatchError;

/// Process-unique connection identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle used to push broadcast messages to a connection's task
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    evict: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle; the receiver and notifier stay with the connection task
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<str>>, evict: Arc<Notify>) -> Self {
        Self { id, tx, evict }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message without waiting
    pub fn deliver(&self, message: Arc<str>) -> Result<(), DispatchError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Disconnected,
        })
    }

    /// Ask the owning task to tear the connection down
    pub fn evict(&self) {
        self.evict.notify_one();
    }
}

/// Registry of open connections
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a freshly accepted socket
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a handle, replacing any entry with the same id
    pub async fn add(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let id = handle.id();
        let replaced = self.connections.write().await.insert(id, handle);
        if replaced.is_some() {
            debug!("Replaced registry entry for connection {}", id);
        }
        replaced
    }

    /// Remove a connection; returns false if it was not registered
    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Point-in-time copy of every registered handle
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle(registry: &Registry) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(registry.allocate_id(), tx, Arc::new(Notify::new()));
        (handle, rx)
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let registry = Registry::new();
        let (handle, _rx) = make_handle(&registry);
        let id = handle.id();

        assert!(registry.add(handle).await.is_none());
        assert!(registry.contains(id).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(id).await);
        assert!(!registry.contains(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let registry = Registry::new();
        assert!(!registry.remove(ConnectionId::new(42)).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_same_id_replaces() {
        let registry = Registry::new();
        let (handle, _rx1) = make_handle(&registry);
        let (tx, _rx2) = mpsc::channel(4);
        let duplicate = ConnectionHandle::new(handle.id(), tx, Arc::new(Notify::new()));

        registry.add(handle).await;
        assert!(registry.add(duplicate).await.is_some());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let registry = Registry::new();
        let (a, _rx_a) = make_handle(&registry);
        let (b, _rx_b) = make_handle(&registry);
        let b_id = b.id();
        registry.add(a).await;
        registry.add(b).await;

        let snapshot = registry.snapshot().await;
        registry.remove(b_id).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_deliver_reports_full_and_closed() {
        let registry = Registry::new();
        let (tx, rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(registry.allocate_id(), tx, Arc::new(Notify::new()));

        assert!(handle.deliver(Arc::from("one")).is_ok());
        assert_eq!(
            handle.deliver(Arc::from("two")),
            Err(DispatchError::QueueFull)
        );
        drop(rx);
        assert_eq!(
            handle.deliver(Arc::from("three")),
            Err(DispatchError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_concurrent_add_remove_snapshot() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();

        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = make_handle(&registry);
                let id = handle.id();
                registry.add(handle).await;
                let snapshot = registry.snapshot().await;
                assert!(snapshot.iter().filter(|h| h.id() == id).count() <= 1);
                assert!(registry.remove(id).await);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty().await);
    }
}
