//! Connection registry.
//!
//! Tracks every live connection together with the role it declared at
//! connect time. The registry is the single owner of [`Connection`] entries;
//! an entry is created when the transport connects and removed when it goes
//! away, so no entry outlives its connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Opaque identifier for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a connection declares when it connects. Fixed for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Sensor device pushing samples
    Producer,
    /// Dashboard or monitor receiving broadcasts
    Observer,
    /// Connected but without any privileges
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Observer => "observer",
            Role::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role string that names none of the known roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedRole(pub String);

impl std::fmt::Display for UnrecognizedRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Unrecognized role '{}' (expected producer, observer or unknown)",
            self.0
        )
    }
}

impl std::error::Error for UnrecognizedRole {}

impl FromStr for Role {
    type Err = UnrecognizedRole;

    /// Parse a role name. The legacy device names `esp32` and `frontend`
    /// are accepted as aliases for producer and observer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "producer" | "esp32" => Ok(Role::Producer),
            "observer" | "frontend" => Ok(Role::Observer),
            "unknown" | "" => Ok(Role::Unknown),
            _ => Err(UnrecognizedRole(s.to_string())),
        }
    }
}

/// A live connection as seen by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Snapshot of live connections per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCounts {
    pub producers: usize,
    pub observers: usize,
    pub total: usize,
}

/// In-memory registry of live connections, scoped to the process lifetime.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a newly connected transport.
    pub async fn register(&self, id: ConnectionId, role: Role) {
        let now = Utc::now();
        self.connections.write().await.insert(
            id,
            Connection {
                id,
                role,
                connected_at: now,
                last_seen_at: now,
            },
        );
    }

    /// Mark activity on a connection. A connection that has already gone
    /// away is ignored.
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.last_seen_at = Utc::now();
        }
    }

    /// Remove a connection, returning the role it held.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Role> {
        self.connections.write().await.remove(&id).map(|c| c.role)
    }

    /// Role of a live connection.
    pub async fn role_of(&self, id: ConnectionId) -> Option<Role> {
        self.connections.read().await.get(&id).map(|c| c.role)
    }

    /// Copy of a live connection entry.
    pub async fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Count live connections per role.
    pub async fn counts_by_role(&self) -> ClientCounts {
        let connections = self.connections.read().await;
        let mut counts = ClientCounts {
            total: connections.len(),
            ..ClientCounts::default()
        };
        for conn in connections.values() {
            match conn.role {
                Role::Producer => counts.producers += 1,
                Role::Observer => counts.observers += 1,
                Role::Unknown => {}
            }
        }
        counts
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("producer".parse::<Role>().unwrap(), Role::Producer);
        assert_eq!("ESP32".parse::<Role>().unwrap(), Role::Producer);
        assert_eq!("frontend".parse::<Role>().unwrap(), Role::Observer);
        assert_eq!("unknown".parse::<Role>().unwrap(), Role::Unknown);
        assert!("admin".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn test_counts_after_unregister() {
        let registry = ConnectionRegistry::new();
        let producer = ConnectionId::new();
        let observer_a = ConnectionId::new();
        let observer_b = ConnectionId::new();

        registry.register(producer, Role::Producer).await;
        registry.register(observer_a, Role::Observer).await;
        registry.register(observer_b, Role::Observer).await;

        assert_eq!(registry.unregister(observer_a).await, Some(Role::Observer));

        let counts = registry.counts_by_role().await;
        assert_eq!(
            counts,
            ClientCounts {
                producers: 1,
                observers: 1,
                total: 2
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_role_counts_only_in_total() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId::new(), Role::Unknown).await;

        let counts = registry.counts_by_role().await;
        assert_eq!(counts.producers, 0);
        assert_eq!(counts.observers, 0);
        assert_eq!(counts.total, 1);
    }

    #[tokio::test]
    async fn test_touch_updates_last_seen_and_ignores_missing() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        registry.register(id, Role::Producer).await;
        let before = registry.get(id).await.unwrap().last_seen_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.touch(id).await;
        assert!(registry.get(id).await.unwrap().last_seen_at > before);

        registry.unregister(id).await;
        registry.touch(id).await;
        assert!(registry.get(id).await.is_none());
        assert_eq!(registry.unregister(id).await, None);
    }
}
