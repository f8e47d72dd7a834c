//! Connection registry for the hosting side

use relay_core::{ConnectionId, PeerIdentity};
use relay_transport::RelayConnection;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Registry shared between the driver and its acceptor
pub type SharedRegistry = Arc<Mutex<ConnectionRegistry>>;

/// A registered peer
#[derive(Clone)]
pub struct ConnectionRecord {
    pub connection: ConnectionId,
    pub identity: PeerIdentity,
    pub handle: Arc<dyn RelayConnection>,
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("connection", &self.connection)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Registry of connected peers, keyed by connection id
#[derive(Default)]
pub struct ConnectionRegistry {
    records: HashMap<ConnectionId, ConnectionRecord>,
    order: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry wrapped for sharing
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register a connection.
    ///
    /// Returns `false` and leaves the existing record untouched if the id is
    /// already registered.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        identity: PeerIdentity,
        handle: Arc<dyn RelayConnection>,
    ) -> bool {
        // Idempotent: a repeated connect for the same id is not an error
        if self.records.contains_key(&connection) {
            return false;
        }

        self.records.insert(
            connection,
            ConnectionRecord {
                connection,
                identity,
                handle,
            },
        );
        self.order.push(connection);
        true
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(&connection)
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.records.contains_key(&connection)
    }

    /// Remove a connection, returning its record
    pub fn remove(&mut self, connection: ConnectionId) -> Option<ConnectionRecord> {
        let record = self.records.remove(&connection)?;
        self.order.retain(|id| *id != connection);
        Some(record)
    }

    /// All records in insertion order
    pub fn all_connections(&self) -> Vec<&ConnectionRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// Remove every record
    pub fn clear(&mut self) -> Vec<ConnectionRecord> {
        let order = std::mem::take(&mut self.order);
        let mut records = std::mem::take(&mut self.records);
        order
            .into_iter()
            .filter_map(|id| records.remove(&id))
            .collect()
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
