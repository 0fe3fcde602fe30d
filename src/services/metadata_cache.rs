use chrono::Duration;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{CachedMetadata, DatabaseConnection, SchemaDocument};
use crate::services::database::{EngineMode, EngineProvisioner};
use crate::storage::SqliteStorage;

/// Metadata cache service: one schema snapshot per connection name, with
/// staleness computed on read.
#[derive(Clone)]
pub struct MetadataCacheService {
    storage: Arc<SqliteStorage>,
    provisioner: EngineProvisioner,
    staleness: Duration,
}

impl MetadataCacheService {
    pub fn new(storage: Arc<SqliteStorage>, provisioner: EngineProvisioner, staleness: Duration) -> Self {
        Self {
            storage,
            provisioner,
            staleness,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Cached entry, but only while it is fresh
    pub async fn get(&self, database_name: &str) -> Result<Option<CachedMetadata>, AppError> {
        let entry = self.storage.get_metadata(database_name).await?;
        Ok(entry.filter(|entry| !entry.is_stale(self.staleness)))
    }

    /// Cached entry regardless of age
    pub async fn get_any(&self, database_name: &str) -> Result<Option<CachedMetadata>, AppError> {
        Ok(self.storage.get_metadata(database_name).await?)
    }

    pub async fn put(&self, database_name: &str, document: &SchemaDocument) -> Result<CachedMetadata, AppError> {
        Ok(self.storage.save_metadata(database_name, document).await?)
    }

    pub async fn invalidate(&self, database_name: &str) -> Result<bool, AppError> {
        Ok(self.storage.delete_metadata(database_name).await?)
    }

    /// Serve a fresh cache entry, or introspect the target and store the result.
    ///
    /// The flag is `true` when the entry came from cache.
    pub async fn get_or_refresh(
        &self,
        connection: &DatabaseConnection,
        force: bool,
    ) -> Result<(CachedMetadata, bool), AppError> {
        if !force {
            if let Some(entry) = self.get(&connection.name).await? {
                tracing::debug!("Metadata cache hit for '{}'", connection.name);
                return Ok((entry, true));
            }
        }

        let document = self.introspect(connection).await?;
        let entry = self.put(&connection.name, &document).await?;
        tracing::info!(
            "Cached metadata for '{}': {} tables, {} views",
            connection.name,
            entry.document.tables.len(),
            entry.document.views.len()
        );
        Ok((entry, false))
    }

    async fn introspect(&self, connection: &DatabaseConnection) -> Result<SchemaDocument, AppError> {
        let mut handle = self.provisioner.provision(connection, EngineMode::Pooled).await?;
        let document = handle.introspect().await;
        handle.dispose().await;
        document
    }
}
