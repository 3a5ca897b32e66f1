//! Connection and group membership bookkeeping.

use crate::types::AnimalId;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::types::{ConnectionHandle, ConnectionId, Member, RegistryConfig, UpdateNotification};

/// Internal per-connection state.
struct Connection {
    sender: Sender<UpdateNotification>,
    groups: HashSet<AnimalId>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    /// Group membership by animal. Empty groups are removed.
    groups: HashMap<AnimalId, HashSet<ConnectionId>>,
}

/// Tracks which live connections follow which animals.
///
/// Both directions of the membership relation sit behind one lock, so join,
/// leave, close and snapshot never observe a half-applied change. Malformed
/// requests are absorbed as no-ops; nothing here returns an error.
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    /// Counter for generating connection IDs.
    next_id: AtomicU64,
    config: RegistryConfig,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a new live connection.
    pub fn connect(&self) -> ConnectionHandle {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.config.buffer_size.max(1));

        self.inner.write().connections.insert(
            id,
            Connection {
                sender,
                groups: HashSet::new(),
            },
        );

        info!(connection = %id, "client connected");
        ConnectionHandle { id, receiver }
    }

    /// Add `connection` to the group for `animal_id`.
    ///
    /// Ignored for non-positive ids and for connections that are unknown or
    /// already closed. Returns true if membership changed.
    pub fn join(&self, connection: ConnectionId, animal_id: AnimalId) -> bool {
        if !animal_id.is_valid() {
            return false;
        }

        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.get_mut(&connection) else {
            return false;
        };
        if !conn.groups.insert(animal_id) {
            return false;
        }
        inner
            .groups
            .entry(animal_id)
            .or_default()
            .insert(connection);

        info!(connection = %connection, %animal_id, "joined group");
        true
    }

    /// Remove `connection` from the group for `animal_id` if present.
    pub fn leave(&self, connection: ConnectionId, animal_id: AnimalId) -> bool {
        if !animal_id.is_valid() {
            return false;
        }

        let mut inner = self.inner.write();
        let left = inner
            .connections
            .get_mut(&connection)
            .is_some_and(|conn| conn.groups.remove(&animal_id));
        if !left {
            return false;
        }
        Self::remove_member(&mut inner.groups, animal_id, connection);

        info!(connection = %connection, %animal_id, "left group");
        true
    }

    /// Release every membership of a terminated connection.
    ///
    /// The serving layer calls this once per termination, graceful or not.
    /// Repeat calls are no-ops. Returns the number of memberships released.
    pub fn on_connection_closed(&self, connection: ConnectionId) -> usize {
        let mut inner = self.inner.write();
        let Some(conn) = inner.connections.remove(&connection) else {
            return 0;
        };

        for animal_id in &conn.groups {
            Self::remove_member(&mut inner.groups, *animal_id, connection);
        }

        info!(connection = %connection, released = conn.groups.len(), "client disconnected");
        conn.groups.len()
    }

    /// Snapshot of the group for `animal_id`, possibly empty.
    pub fn members(&self, animal_id: AnimalId) -> Vec<Member> {
        let inner = self.inner.read();
        let Some(ids) = inner.groups.get(&animal_id) else {
            return Vec::new();
        };

        ids.iter()
            .filter_map(|id| {
                inner.connections.get(id).map(|conn| Member {
                    id: *id,
                    sender: conn.sender.clone(),
                })
            })
            .collect()
    }

    pub fn is_member(&self, connection: ConnectionId, animal_id: AnimalId) -> bool {
        self.inner
            .read()
            .groups
            .get(&animal_id)
            .is_some_and(|ids| ids.contains(&connection))
    }

    /// Animals `connection` currently follows.
    pub fn groups_of(&self, connection: ConnectionId) -> Vec<AnimalId> {
        let inner = self.inner.read();
        let mut groups: Vec<AnimalId> = inner
            .connections
            .get(&connection)
            .map(|conn| conn.groups.iter().copied().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    fn remove_member(
        groups: &mut HashMap<AnimalId, HashSet<ConnectionId>>,
        animal_id: AnimalId,
        connection: ConnectionId,
    ) {
        if let Some(ids) = groups.get_mut(&animal_id) {
            ids.remove(&connection);
            if ids.is_empty() {
                groups.remove(&animal_id);
                debug!(%animal_id, "group emptied");
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_join_leave() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.connect();

        assert!(registry.join(handle.id, AnimalId(1)));
        assert!(registry.is_member(handle.id, AnimalId(1)));
        assert_eq!(registry.members(AnimalId(1)).len(), 1);

        assert!(registry.leave(handle.id, AnimalId(1)));
        assert!(!registry.is_member(handle.id, AnimalId(1)));
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.connect();

        assert!(registry.join(handle.id, AnimalId(1)));
        assert!(!registry.join(handle.id, AnimalId(1)));
        assert_eq!(registry.members(AnimalId(1)).len(), 1);
    }

    #[test]
    fn test_invalid_ids_ignored() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.connect();

        assert!(!registry.join(handle.id, AnimalId(0)));
        assert!(!registry.join(handle.id, AnimalId(-7)));
        assert!(!registry.leave(handle.id, AnimalId(0)));
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_unknown_connection_ignored() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.join(ConnectionId(404), AnimalId(1)));
        assert!(!registry.leave(ConnectionId(404), AnimalId(1)));
        assert_eq!(registry.on_connection_closed(ConnectionId(404)), 0);
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_close_releases_all_groups() {
        let registry = SubscriptionRegistry::new();
        let a = registry.connect();
        let b = registry.connect();

        registry.join(a.id, AnimalId(1));
        registry.join(a.id, AnimalId(2));
        registry.join(b.id, AnimalId(2));

        assert_eq!(registry.on_connection_closed(a.id), 2);
        assert_eq!(registry.group_count(), 1);
        assert_eq!(registry.members(AnimalId(2)).len(), 1);
        assert!(registry.members(AnimalId(1)).is_empty());

        // Second close is a no-op, and a closed connection can't rejoin
        assert_eq!(registry.on_connection_closed(a.id), 0);
        assert!(!registry.join(a.id, AnimalId(1)));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_groups_of() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.connect();
        registry.join(handle.id, AnimalId(3));
        registry.join(handle.id, AnimalId(1));

        assert_eq!(registry.groups_of(handle.id), vec![AnimalId(1), AnimalId(3)]);
        assert!(registry.groups_of(ConnectionId(99)).is_empty());
    }

    #[test]
    fn test_concurrent_join_leave() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8).map(|_| registry.connect()).collect();

        let workers: Vec<_> = handles
            .iter()
            .map(|h| {
                let registry = Arc::clone(&registry);
                let id = h.id;
                thread::spawn(move || {
                    for i in 0..200 {
                        let animal = AnimalId(i % 5 + 1);
                        registry.join(id, animal);
                        if i % 2 == 0 {
                            registry.leave(id, animal);
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        // Both sides of the relation agree
        for h in &handles {
            for animal in registry.groups_of(h.id) {
                assert!(registry.is_member(h.id, animal));
            }
        }
        for h in &handles {
            registry.on_connection_closed(h.id);
        }
        assert_eq!(registry.group_count(), 0);
    }
}
