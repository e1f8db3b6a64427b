//! Persistence seams consumed by the storage core.
//!
//! The core never writes connection records itself. Rotated cloud-disk tokens
//! and connection test results are handed back through these traits so the
//! owner of the records decides how to store them.

use crate::traits::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;
use vertex_core::{StorageConnection, TestStatus};

/// Receives credentials rotated by a provider during a call.
#[async_trait]
pub trait CredentialRefreshHandler: Send + Sync {
    /// Persist `credentials` (the full credential shape) for `connection_id`.
    async fn save_refreshed_credentials(
        &self,
        connection_id: Uuid,
        credentials: Map<String, Value>,
    ) -> StorageResult<()>;
}

/// Store of [`StorageConnection`] records.
#[async_trait]
pub trait ConnectionRepository: CredentialRefreshHandler {
    /// Active connection by id. Deactivated records are `NotFound`.
    async fn get(&self, id: Uuid) -> StorageResult<StorageConnection>;

    /// All active connections, default first, then by name.
    async fn list(&self) -> StorageResult<Vec<StorageConnection>>;

    /// Insert a new record. Names are unique among active connections.
    async fn insert(&self, connection: StorageConnection) -> StorageResult<StorageConnection>;

    /// Soft delete: the record stays but is no longer served.
    async fn deactivate(&self, id: Uuid) -> StorageResult<()>;

    async fn record_test_result(
        &self,
        id: Uuid,
        status: TestStatus,
        error: Option<String>,
        tested_at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

/// Process-local repository, used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryConnectionRepository {
    connections: RwLock<HashMap<Uuid, StorageConnection>>,
}

impl InMemoryConnectionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing records, e.g. loaded from a JSON file.
    pub fn with_connections(connections: impl IntoIterator<Item = StorageConnection>) -> Self {
        Self {
            connections: RwLock::new(connections.into_iter().map(|c| (c.id, c)).collect()),
        }
    }

    /// Every record including deactivated ones
    pub async fn snapshot(&self) -> Vec<StorageConnection> {
        self.connections.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl CredentialRefreshHandler for InMemoryConnectionRepository {
    async fn save_refreshed_credentials(
        &self,
        connection_id: Uuid,
        credentials: Map<String, Value>,
    ) -> StorageResult<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or_else(|| StorageError::NotFound(format!("connection {}", connection_id)))?;
        for (field, value) in credentials {
            connection.credentials.insert(field, value);
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryConnectionRepository {
    async fn get(&self, id: Uuid) -> StorageResult<StorageConnection> {
        self.connections
            .read()
            .await
            .get(&id)
            .filter(|c| c.is_active)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("connection {}", id)))
    }

    async fn list(&self) -> StorageResult<Vec<StorageConnection>> {
        let mut active: Vec<StorageConnection> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.is_default.cmp(&a.is_default).then(a.name.cmp(&b.name)));
        Ok(active)
    }

    async fn insert(&self, connection: StorageConnection) -> StorageResult<StorageConnection> {
        let mut connections = self.connections.write().await;

        if connections
            .values()
            .any(|c| c.is_active && c.name == connection.name)
        {
            return Err(StorageError::Conflict(format!(
                "A connection named '{}' already exists",
                connection.name
            )));
        }

        // At most one default connection.
        if connection.is_default {
            for existing in connections.values_mut() {
                existing.is_default = false;
            }
        }

        connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn deactivate(&self, id: Uuid) -> StorageResult<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .filter(|c| c.is_active)
            .ok_or_else(|| StorageError::NotFound(format!("connection {}", id)))?;
        connection.is_active = false;
        connection.is_default = false;
        Ok(())
    }

    async fn record_test_result(
        &self,
        id: Uuid,
        status: TestStatus,
        error: Option<String>,
        tested_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("connection {}", id)))?;
        connection.last_test_status = status;
        connection.last_test_error = error;
        connection.last_tested_at = Some(tested_at);
        Ok(())
    }
}
