//! Connection registry - tracks live connections from accept to teardown.
//!
//! Inserted by the accept loop, removed by each connection's own task when it
//! exits, drained by the listener on shutdown. Lock-sharded concurrent access
//! via DashMap; no caller ever holds an entry across an await point.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Identifier assigned to an accepted connection.
///
/// Sequential per server, starting at 1, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a registered connection.
///
/// A connection that has finished teardown is no longer registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handling loop is running.
    Open,
    /// Peer disconnected or shutdown was ordered; socket is being torn down.
    Closing,
}

/// Snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub state: ConnectionState,
}

/// Registry entry: connection metadata plus the handles needed to tear it down.
pub struct ConnectionRecord {
    info: ConnectionInfo,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl ConnectionRecord {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        shutdown: CancellationToken,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            info: ConnectionInfo {
                id,
                peer,
                state: ConnectionState::Open,
            },
            shutdown,
            worker,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Close the socket and wait for the connection task to finish.
    pub async fn close(self) -> Result<(), JoinError> {
        self.shutdown.cancel();
        self.worker.await
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("info", &self.info)
            .field("shutdown", &self.shutdown.is_cancelled())
            .field("finished", &self.worker.is_finished())
            .finish()
    }
}

/// Concurrent map from connection id to connection record.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a record. Returns the displaced record if the id was already present.
    pub fn register(&self, record: ConnectionRecord) -> Option<ConnectionRecord> {
        let id = record.id();
        let displaced = self.connections.insert(id, record);
        if displaced.is_some() {
            tracing::error!(connection_id = %id, "Connection id registered twice");
        }
        displaced
    }

    /// Remove a record. Unknown ids are a no-op.
    pub fn deregister(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.remove(&id).map(|(_, record)| record)
    }

    /// Move a connection to `Closing`. Returns false if it is not registered.
    pub fn mark_closing(&self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                entry.info.state = ConnectionState::Closing;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|entry| entry.info.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Point-in-time view of all registered connections, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Remove and return every record, ordered by id.
    ///
    /// Each record is removed individually, so a connection task that
    /// deregisters itself concurrently is never returned twice.
    pub fn drain(&self) -> Vec<ConnectionRecord> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        let mut records: Vec<ConnectionRecord> =
            ids.into_iter().filter_map(|id| self.deregister(id)).collect();
        records.sort_by_key(ConnectionRecord::id);
        records
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }
}
