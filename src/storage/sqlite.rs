use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::models::{
    CachedMetadata, ConnectionStatus, DatabaseConnection, DatabaseType, NewHistoryEntry, QueryHistoryEntry,
    QuerySource, SchemaDocument,
};

/// SQLite storage for connections, cached metadata and query history
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteStorage {
    conn: Arc<Mutex<Option<Connection>>>,
}

const CONNECTION_COLUMNS: &str =
    "name, url, database_type, description, created_at, updated_at, last_connected_at, status";

const HISTORY_COLUMNS: &str = "id, database_name, sql_text, executed_at, execution_time_ms, row_count, \
     success, error_message, query_source";

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: &str) -> SqliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn closed_error() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISUSE),
        Some("storage is closed".to_string()),
    )
}

fn connection_from_row(row: &Row<'_>) -> SqliteResult<DatabaseConnection> {
    let database_type: String = row.get(2)?;
    Ok(DatabaseConnection {
        name: row.get(0)?,
        url: row.get(1)?,
        database_type: DatabaseType::from_str(&database_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.to_string().into())
        })?,
        description: row.get(3)?,
        created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
        updated_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
        last_connected_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_timestamp(6, &s))
            .transpose()?,
        status: ConnectionStatus::parse(&row.get::<_, String>(7)?),
    })
}

fn history_from_row(row: &Row<'_>) -> SqliteResult<QueryHistoryEntry> {
    Ok(QueryHistoryEntry {
        id: row.get(0)?,
        database_name: row.get(1)?,
        sql_text: row.get(2)?,
        executed_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
        execution_time_ms: row.get::<_, i64>(4)?.max(0) as u64,
        row_count: row.get::<_, i64>(5)?.max(0) as usize,
        success: row.get(6)?,
        error_message: row.get(7)?,
        query_source: QuerySource::parse(&row.get::<_, String>(8)?),
    })
}

fn metadata_from_row(row: &Row<'_>) -> SqliteResult<CachedMetadata> {
    let metadata_json: String = row.get(1)?;
    let document: SchemaDocument = serde_json::from_str(&metadata_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    Ok(CachedMetadata {
        database_name: row.get(0)?,
        document,
        fetched_at: parse_timestamp(2, &row.get::<_, String>(2)?)?,
        table_count: row.get(3)?,
    })
}

/// Delete every history row of `database_name` beyond the newest `keep`.
fn trim_history_in(conn: &Connection, database_name: &str, keep: usize) -> SqliteResult<usize> {
    conn.execute(
        r#"
        DELETE FROM query_history
        WHERE id IN (
            SELECT id FROM query_history
            WHERE database_name = ?1
            ORDER BY executed_at DESC, id DESC
            LIMIT -1 OFFSET ?2
        )
        "#,
        params![database_name, keep as i64],
    )
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            let mut cleaned = path_str.trim_start_matches("sqlite:");
            cleaned = cleaned.trim_start_matches("//");
            cleaned
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        };
        storage.init_schema().await?;
        tracing::info!("Storage initialised at {}", clean_path);
        Ok(storage)
    }

    async fn lock(&self) -> SqliteResult<MappedMutexGuard<'_, Connection>> {
        MutexGuard::try_map(self.conn.lock().await, |conn| conn.as_mut()).map_err(|_| closed_error())
    }

    /// Initialize database schema
    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.lock().await?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                name TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                database_type TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_connected_at TEXT,
                status TEXT NOT NULL DEFAULT 'inactive'
            );

            CREATE TABLE IF NOT EXISTS database_metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                database_name TEXT NOT NULL UNIQUE,
                metadata_json TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                table_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS query_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                database_name TEXT NOT NULL,
                sql_text TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                row_count INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL,
                error_message TEXT,
                query_source TEXT NOT NULL DEFAULT 'manual'
            );

            CREATE INDEX IF NOT EXISTS idx_query_history_database
                ON query_history(database_name, executed_at DESC);
            "#,
        )?;

        Ok(())
    }

    /// Close the underlying connection. Later calls fail with a misuse error.
    pub async fn close(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| e)?;
            tracing::info!("Storage closed");
        }
        Ok(())
    }

    // ==================== Connections ====================

    /// Insert or update a connection, keeping its original creation time
    pub async fn save_connection(&self, connection: &DatabaseConnection) -> SqliteResult<()> {
        let conn = self.lock().await?;
        conn.execute(
            r#"
            INSERT INTO connections
            (name, url, database_type, description, created_at, updated_at, last_connected_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(name) DO UPDATE SET
                url = excluded.url,
                database_type = excluded.database_type,
                description = excluded.description,
                updated_at = excluded.updated_at,
                last_connected_at = excluded.last_connected_at,
                status = excluded.status
            "#,
            params![
                connection.name,
                connection.url,
                connection.database_type.as_str(),
                connection.description,
                format_timestamp(&connection.created_at),
                format_timestamp(&connection.updated_at),
                connection.last_connected_at.as_ref().map(format_timestamp),
                connection.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_connection(&self, name: &str) -> SqliteResult<Option<DatabaseConnection>> {
        let conn = self.lock().await?;
        conn.query_row(
            &format!("SELECT {} FROM connections WHERE name = ?1", CONNECTION_COLUMNS),
            params![name],
            connection_from_row,
        )
        .optional()
    }

    pub async fn list_connections(&self) -> SqliteResult<Vec<DatabaseConnection>> {
        let conn = self.lock().await?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM connections ORDER BY created_at DESC, name",
            CONNECTION_COLUMNS
        ))?;
        let connections = stmt
            .query_map([], connection_from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(connections)
    }

    /// Delete a connection together with its cached metadata and history
    pub async fn delete_connection(&self, name: &str) -> SqliteResult<bool> {
        let mut conn = self.lock().await?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM query_history WHERE database_name = ?1", params![name])?;
        tx.execute("DELETE FROM database_metadata WHERE database_name = ?1", params![name])?;
        let rows_affected = tx.execute("DELETE FROM connections WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(rows_affected > 0)
    }

    // ==================== Metadata cache ====================

    /// Upsert the single cache entry for `database_name`, stamping it now
    pub async fn save_metadata(&self, database_name: &str, document: &SchemaDocument) -> SqliteResult<CachedMetadata> {
        let metadata_json = serde_json::to_string(document)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let entry = CachedMetadata {
            database_name: database_name.to_string(),
            document: document.clone(),
            // Match the stored precision so a re-read compares equal.
            fetched_at: Utc::now().trunc_subsecs(6),
            table_count: document.object_count() as i64,
        };

        let conn = self.lock().await?;
        conn.execute(
            r#"
            INSERT INTO database_metadata (database_name, metadata_json, fetched_at, table_count)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(database_name) DO UPDATE SET
                metadata_json = excluded.metadata_json,
                fetched_at = excluded.fetched_at,
                table_count = excluded.table_count
            "#,
            params![
                entry.database_name,
                metadata_json,
                format_timestamp(&entry.fetched_at),
                entry.table_count,
            ],
        )?;
        Ok(entry)
    }

    /// Cached entry regardless of age; staleness is the caller's decision
    pub async fn get_metadata(&self, database_name: &str) -> SqliteResult<Option<CachedMetadata>> {
        let conn = self.lock().await?;
        conn.query_row(
            "SELECT database_name, metadata_json, fetched_at, table_count FROM database_metadata WHERE database_name = ?1",
            params![database_name],
            metadata_from_row,
        )
        .optional()
    }

    pub async fn delete_metadata(&self, database_name: &str) -> SqliteResult<bool> {
        let conn = self.lock().await?;
        let rows_affected = conn.execute(
            "DELETE FROM database_metadata WHERE database_name = ?1",
            params![database_name],
        )?;
        Ok(rows_affected > 0)
    }

    // ==================== Query history ====================

    /// Append a history entry and trim its database to `keep` entries in one transaction
    pub async fn add_query_history(&self, entry: &NewHistoryEntry, keep: usize) -> SqliteResult<i64> {
        let mut conn = self.lock().await?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO query_history
            (database_name, sql_text, executed_at, execution_time_ms, row_count, success, error_message, query_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                entry.database_name,
                entry.sql_text,
                format_timestamp(&entry.executed_at),
                entry.execution_time_ms as i64,
                entry.row_count as i64,
                entry.success,
                entry.error_message,
                entry.query_source.as_str(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        let trimmed = trim_history_in(&tx, &entry.database_name, keep)?;
        tx.commit()?;

        if trimmed > 0 {
            tracing::debug!("Trimmed {} history entries for {}", trimmed, entry.database_name);
        }
        Ok(id)
    }

    /// Most recent entries first
    pub async fn list_query_history(&self, database_name: &str, limit: usize) -> SqliteResult<Vec<QueryHistoryEntry>> {
        let conn = self.lock().await?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM query_history WHERE database_name = ?1 ORDER BY executed_at DESC, id DESC LIMIT ?2",
            HISTORY_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![database_name, limit as i64], history_from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(entries)
    }

    pub async fn trim_query_history(&self, database_name: &str, keep: usize) -> SqliteResult<usize> {
        let conn = self.lock().await?;
        trim_history_in(&conn, database_name, keep)
    }
}
