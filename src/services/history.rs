use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{NewHistoryEntry, QueryHistoryEntry};
use crate::storage::SqliteStorage;

/// Default number of entries kept per connection.
pub const DEFAULT_HISTORY_RETENTION: usize = 50;

/// Append-only record of query outcomes, bounded per connection name.
#[derive(Clone)]
pub struct HistoryLedger {
    storage: Arc<SqliteStorage>,
    retention: usize,
}

impl HistoryLedger {
    pub fn new(storage: Arc<SqliteStorage>, retention: usize) -> Self {
        Self { storage, retention }
    }

    /// Insert the entry and trim its connection back to the retention bound.
    pub async fn record(&self, entry: NewHistoryEntry) -> Result<i64, AppError> {
        let id = self.storage.add_query_history(&entry, self.retention).await?;
        tracing::debug!(
            "Recorded {} query for '{}' (id {})",
            if entry.success { "successful" } else { "failed" },
            entry.database_name,
            id
        );
        Ok(id)
    }

    /// Most recent first. `limit` is capped at the retention bound.
    pub async fn list(&self, database_name: &str, limit: usize) -> Result<Vec<QueryHistoryEntry>, AppError> {
        let limit = limit.min(self.retention);
        Ok(self.storage.list_query_history(database_name, limit).await?)
    }

    pub async fn trim(&self, database_name: &str, keep: usize) -> Result<usize, AppError> {
        Ok(self.storage.trim_query_history(database_name, keep).await?)
    }
}
