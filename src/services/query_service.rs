use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::models::{
    DatabaseConnection, GeneratedSql, NewHistoryEntry, QueryResult, QuerySource, RawResultSet, SchemaDocument,
};
use crate::services::database::{EngineMode, EngineProvisioner};
use crate::services::history::HistoryLedger;
use crate::services::llm_service::SqlGenerator;
use crate::validation::{SqlValidator, DEFAULT_ROW_LIMIT};

/// Default session statement timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one validated query per call on its own single-use engine and
/// records the outcome in the history ledger.
#[derive(Clone)]
pub struct QueryService {
    provisioner: EngineProvisioner,
    history: HistoryLedger,
    row_limit: u64,
    timeout: Duration,
}

impl QueryService {
    pub fn new(provisioner: EngineProvisioner, history: HistoryLedger) -> Self {
        Self {
            provisioner,
            history,
            row_limit: DEFAULT_ROW_LIMIT,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_row_limit(mut self, row_limit: u64) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn history(&self) -> &HistoryLedger {
        &self.history
    }

    /// Validate, execute and record a query against `connection`.
    pub async fn execute(
        &self,
        connection: &DatabaseConnection,
        sql: &str,
        source: QuerySource,
    ) -> Result<QueryResult, AppError> {
        let gated = SqlValidator::validate_with_limit(sql, connection.database_type, self.row_limit);
        let validated_sql = match gated {
            Ok(validated) => validated,
            Err(e) => {
                tracing::warn!("Rejected query for '{}': {}", connection.name, e);
                let entry = NewHistoryEntry::failed(&connection.name, sql, 0, e.message(), source);
                self.record_failure(entry).await;
                return Err(e);
            }
        };

        let start_time = Instant::now();
        let outcome = self.run(connection, &validated_sql).await;
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        match outcome {
            Ok(raw) => {
                let result = QueryResult::from_raw(raw, execution_time_ms, validated_sql);
                let entry = NewHistoryEntry::succeeded(
                    &connection.name,
                    &result.sql,
                    execution_time_ms,
                    result.row_count,
                    source,
                );
                self.history.record(entry).await?;
                tracing::info!(
                    "Query on '{}' returned {} rows in {}ms",
                    connection.name,
                    result.row_count,
                    execution_time_ms
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!("Query on '{}' failed after {}ms: {}", connection.name, execution_time_ms, e);
                let message = e.message();
                let entry =
                    NewHistoryEntry::failed(&connection.name, &validated_sql, execution_time_ms, message.clone(), source);
                self.record_failure(entry).await;
                Err(AppError::QueryExecution {
                    message,
                    error_type: e.kind().to_string(),
                    execution_time_ms,
                })
            }
        }
    }

    /// Provision, apply the session timeout, fetch. The handle is disposed
    /// on every path; if this future is dropped, `Drop` on the handle does it.
    async fn run(&self, connection: &DatabaseConnection, sql: &str) -> Result<RawResultSet, AppError> {
        let mut handle = self.provisioner.provision(connection, EngineMode::OneShot).await?;

        let fetched = match handle.apply_statement_timeout(self.timeout).await {
            Ok(()) => handle.fetch_all(sql).await,
            Err(e) => Err(e),
        };
        handle.dispose().await;
        fetched
    }

    async fn record_failure(&self, entry: NewHistoryEntry) {
        // The caller still gets the original error.
        if let Err(e) = self.history.record(entry).await {
            tracing::error!("Failed to record query history: {}", e);
        }
    }

    /// Ask `generator` for SQL and pass it through the gate before returning it.
    pub async fn generate_sql(
        &self,
        generator: &dyn SqlGenerator,
        connection: &DatabaseConnection,
        schema: &SchemaDocument,
        prompt: &str,
    ) -> Result<GeneratedSql, AppError> {
        let generated = generator
            .generate_sql(connection.database_type, schema, prompt)
            .await?;

        let sql = SqlValidator::validate_with_limit(&generated.sql, connection.database_type, self.row_limit)
            .map_err(|e| {
                tracing::warn!("Generated SQL for '{}' was rejected: {}", connection.name, generated.sql);
                AppError::InvalidSql(format!("Generated SQL failed validation: {}", e.message()))
            })?;

        Ok(GeneratedSql {
            sql,
            explanation: generated.explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseType, SemanticType};
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        service: QueryService,
        connection: DatabaseConnection,
        target: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let target = dir.path().join("shop.db");
        {
            let conn = rusqlite::Connection::open(&target).unwrap();
            conn.execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, note TEXT);
                 INSERT INTO items (name, price, note) VALUES ('pen', 1.5, NULL), ('ink', 4.0, NULL);",
            )
            .unwrap();
        }
        let storage = SqliteStorage::new(dir.path().join("app.db")).await.unwrap();
        let history = HistoryLedger::new(Arc::new(storage), 50);
        let connection = DatabaseConnection::new(
            "shop".to_string(),
            format!("sqlite:///{}", target.display()),
            DatabaseType::Sqlite,
            None,
        );
        Fixture {
            service: QueryService::new(EngineProvisioner::default(), history),
            connection,
            target,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_execute_shapes_result_and_records_history() {
        let f = fixture().await;

        let result = f
            .service
            .execute(&f.connection, "SELECT id, name, price, note FROM items ORDER BY id;", QuerySource::Manual)
            .await
            .unwrap();

        assert_eq!(result.sql, "SELECT id, name, price, note FROM items ORDER BY id LIMIT 1000");
        assert_eq!(result.row_count, 2);
        let types: Vec<SemanticType> = result.columns.iter().map(|c| c.data_type).collect();
        assert_eq!(
            types,
            vec![SemanticType::Integer, SemanticType::Text, SemanticType::Real, SemanticType::Text]
        );
        assert_eq!(result.rows[0]["name"], json!("pen"));
        assert_eq!(result.rows[1]["note"], json!(null));

        let history = f.service.history().list("shop", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].row_count, 2);
        assert_eq!(history[0].sql_text, result.sql);
        assert_eq!(history[0].query_source, QuerySource::Manual);
    }

    #[tokio::test]
    async fn test_rejected_sql_never_reaches_database() {
        let f = fixture().await;

        let err = f
            .service
            .execute(&f.connection, "DROP TABLE items", QuerySource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidSql(ref msg) if msg.contains("DROP")));

        let history = f.service.history().list("shop", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].execution_time_ms, 0);
        assert_eq!(history[0].sql_text, "DROP TABLE items");
        assert!(history[0].error_message.as_deref().unwrap_or("").contains("Only SELECT"));

        // The table is still there.
        let conn = rusqlite::Connection::open(&f.target).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_execution_failure_is_timed_and_recorded() {
        let f = fixture().await;

        let err = f
            .service
            .execute(&f.connection, "SELECT missing_column FROM items", QuerySource::NaturalLanguage)
            .await
            .unwrap_err();
        let elapsed = match &err {
            AppError::QueryExecution {
                message,
                error_type,
                execution_time_ms,
            } => {
                assert!(message.contains("missing_column"));
                assert_eq!(error_type, "DatabaseError");
                *execution_time_ms
            }
            other => panic!("unexpected error: {:?}", other),
        };

        let history = f.service.history().list("shop", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].execution_time_ms, elapsed);
        assert_eq!(history[0].row_count, 0);
        assert_eq!(history[0].sql_text, "SELECT missing_column FROM items LIMIT 1000");
        assert_eq!(history[0].query_source, QuerySource::NaturalLanguage);
        assert!(history[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_target_is_execution_error() {
        let f = fixture().await;
        let mut connection = f.connection.clone();
        connection.url = "sqlite:////nonexistent/dir/none.db".to_string();

        let err = f
            .service
            .execute(&connection, "SELECT 1", QuerySource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QueryExecution { ref error_type, .. } if error_type == "ConnectionError"));
    }

    #[tokio::test]
    async fn test_cancelled_query_releases_target() {
        let f = fixture().await;
        let endless = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                       SELECT count(*) FROM n CROSS JOIN items";

        let outcome = tokio::time::timeout(
            Duration::from_millis(300),
            f.service.execute(&f.connection, endless, QuerySource::Manual),
        )
        .await;
        assert!(outcome.is_err(), "query should still be running");

        // An exclusive lock is only granted once the dropped query has let go of the file.
        let target = f.target.clone();
        let locked = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&target).unwrap();
            conn.busy_timeout(Duration::from_secs(5)).unwrap();
            conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
        })
        .await
        .unwrap();
        assert!(locked.is_ok(), "target still locked: {:?}", locked);

        // Nothing is recorded for a query whose caller went away.
        assert!(f.service.history().list("shop", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_retention_after_many_queries() {
        let f = fixture().await;

        for i in 0..55 {
            f.service
                .execute(&f.connection, &format!("SELECT {} AS n", i), QuerySource::Manual)
                .await
                .unwrap();
        }

        let history = f.service.history().list("shop", 1000).await.unwrap();
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].sql_text, "SELECT 54 AS n LIMIT 1000");
        assert_eq!(history[49].sql_text, "SELECT 5 AS n LIMIT 1000");
    }

    #[tokio::test]
    async fn test_configured_row_limit() {
        let f = fixture().await;
        let service = f.service.clone().with_row_limit(1);

        let result = service
            .execute(&f.connection, "SELECT name FROM items ORDER BY id", QuerySource::Manual)
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.sql.ends_with("LIMIT 1"));
    }

    struct CannedGenerator(&'static str);

    #[async_trait]
    impl SqlGenerator for CannedGenerator {
        async fn generate_sql(
            &self,
            _dialect: DatabaseType,
            _schema: &SchemaDocument,
            _prompt: &str,
        ) -> Result<GeneratedSql, AppError> {
            Ok(GeneratedSql {
                sql: self.0.to_string(),
                explanation: "canned".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_generated_sql_passes_through_gate() {
        let f = fixture().await;
        let schema = SchemaDocument::default();

        let generated = f
            .service
            .generate_sql(&CannedGenerator("SELECT name FROM items"), &f.connection, &schema, "names")
            .await
            .unwrap();
        assert_eq!(generated.sql, "SELECT name FROM items LIMIT 1000");
        assert_eq!(generated.explanation, "canned");

        let err = f
            .service
            .generate_sql(&CannedGenerator("DELETE FROM items"), &f.connection, &schema, "wipe it")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidSql(ref msg) if msg.starts_with("Generated SQL failed validation")));
    }
}
