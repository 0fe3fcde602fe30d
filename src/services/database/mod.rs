// Engine provisioning for target databases.
//
// Every operation against a registered database goes through an `EngineHandle`
// obtained from the `EngineProvisioner`. Handles are disposed exactly once,
// either explicitly through `dispose` or by `Drop` on error and cancellation paths.
pub mod mysql;
pub mod postgresql;
pub mod sqlite;

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::api::middleware::AppError;
use crate::config::EngineConfig;
use crate::models::{mask_credentials, DatabaseConnection, DatabaseType, RawResultSet, SchemaDocument};

/// Pool sizing and connect limits shared by every provisioned engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pool_size: usize,
    pub max_overflow: usize,
    pub connect_timeout: Duration,
}

impl EngineSettings {
    pub fn max_connections(&self) -> usize {
        (self.pool_size + self.max_overflow).max(1)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_overflow: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

/// How a handle holds its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Small verified pool, used for connection tests and metadata extraction.
    Pooled,
    /// One unpooled connection, used for a single query execution.
    OneShot,
}

/// Rewrite a stored connection URL into the form the Rust drivers accept.
///
/// Driver suffixes (`postgresql+asyncpg`, `mysql+aiomysql`) are dropped and
/// aliases collapse to the canonical scheme. SQLite URLs become a filesystem
/// path following the `sqlite:///relative` / `sqlite:////absolute` convention,
/// or `:memory:` when no path is given. Applying it twice changes nothing.
pub fn normalize_url(url: &str, dialect: DatabaseType) -> String {
    let url = url.trim();
    match dialect {
        DatabaseType::PostgreSQL => replace_scheme(url, "postgresql"),
        DatabaseType::MySQL => replace_scheme(url, "mysql"),
        DatabaseType::Sqlite => sqlite_path(url),
    }
}

fn replace_scheme(url: &str, scheme: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => format!("{}://{}", scheme, rest),
        None => url.to_string(),
    }
}

fn sqlite_path(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once(':') else {
        return url.to_string();
    };
    if scheme != "sqlite" && !scheme.starts_with("sqlite+") {
        return url.to_string();
    }

    let path = rest.strip_prefix("//").unwrap_or(rest);
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        ":memory:".to_string()
    } else {
        path.to_string()
    }
}

pub(crate) fn connection_error(dialect: DatabaseType, masked_url: &str, message: impl Into<String>) -> AppError {
    AppError::Connection {
        dialect: dialect.to_string(),
        url: masked_url.to_string(),
        message: message.into(),
    }
}

enum Engine {
    PostgresPool(deadpool_postgres::Pool),
    Postgres {
        client: tokio_postgres::Client,
        driver: JoinHandle<()>,
    },
    MySqlPool(mysql_async::Pool),
    MySql(mysql_async::Conn),
    Sqlite {
        conn: sqlite::SharedConnection,
        interrupt: rusqlite::InterruptHandle,
    },
}

impl Engine {
    /// Synchronous part of disposal, for handles dropped without `dispose`.
    fn close_now(self) {
        match self {
            Engine::PostgresPool(pool) => pool.close(),
            Engine::Postgres { driver, .. } => driver.abort(),
            // A blocking call still running owns a clone of the connection;
            // interrupting it lets that call return and close the file.
            Engine::Sqlite { interrupt, .. } => interrupt.interrupt(),
            // mysql_async disconnects dropped connections in the background
            Engine::MySqlPool(_) | Engine::MySql(_) => {}
        }
    }

    async fn close(self) -> Result<(), AppError> {
        match self {
            Engine::PostgresPool(pool) => {
                pool.close();
                Ok(())
            }
            Engine::Postgres { client, mut driver } => {
                // Dropping the last client ends the driver task gracefully.
                drop(client);
                if tokio::time::timeout(Duration::from_secs(5), &mut driver).await.is_err() {
                    driver.abort();
                }
                Ok(())
            }
            Engine::MySqlPool(pool) => pool
                .disconnect()
                .await
                .map_err(|e| AppError::Database(format!("Failed to close MySQL pool: {}", e))),
            Engine::MySql(conn) => conn
                .disconnect()
                .await
                .map_err(|e| AppError::Database(format!("Failed to close MySQL connection: {}", e))),
            Engine::Sqlite { conn, .. } => sqlite::close(conn),
        }
    }
}

/// A live engine for one target database.
pub struct EngineHandle {
    dialect: DatabaseType,
    masked_url: String,
    statement_timeout: Option<Duration>,
    engine: Option<Engine>,
}

impl EngineHandle {
    pub fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    fn engine_mut(&mut self) -> Result<&mut Engine, AppError> {
        self.engine
            .as_mut()
            .ok_or_else(|| AppError::Internal("Engine handle already disposed".to_string()))
    }

    /// Bound the server-side run time of every subsequent statement.
    ///
    /// PostgreSQL uses `statement_timeout` and MySQL `max_execution_time`.
    /// SQLite has no per-statement limit; only the busy timeout set at open
    /// time applies. Pooled handles apply the limit on each checkout.
    pub async fn apply_statement_timeout(&mut self, timeout: Duration) -> Result<(), AppError> {
        self.statement_timeout = Some(timeout);
        match self.engine_mut()? {
            Engine::Postgres { client, .. } => postgresql::set_statement_timeout(client, timeout).await,
            Engine::MySql(conn) => mysql::set_statement_timeout(conn, timeout).await,
            Engine::Sqlite { .. } => {
                tracing::debug!("SQLite has no statement timeout, relying on busy timeout");
                Ok(())
            }
            Engine::PostgresPool(_) | Engine::MySqlPool(_) => Ok(()),
        }
    }

    /// Run one statement and buffer its full result set.
    pub async fn fetch_all(&mut self, sql: &str) -> Result<RawResultSet, AppError> {
        let statement_timeout = self.statement_timeout;
        match self.engine_mut()? {
            Engine::PostgresPool(pool) => {
                let client = postgresql::checkout(pool).await?;
                if let Some(timeout) = statement_timeout {
                    postgresql::set_statement_timeout(&client, timeout).await?;
                }
                postgresql::fetch_all(&client, sql).await
            }
            Engine::Postgres { client, .. } => postgresql::fetch_all(client, sql).await,
            Engine::MySqlPool(pool) => {
                let mut conn = mysql::checkout(pool).await?;
                if let Some(timeout) = statement_timeout {
                    mysql::set_statement_timeout(&mut conn, timeout).await?;
                }
                mysql::fetch_all(&mut conn, sql).await
            }
            Engine::MySql(conn) => mysql::fetch_all(conn, sql).await,
            Engine::Sqlite { conn, .. } => sqlite::fetch_all(conn.clone(), sql.to_string()).await,
        }
    }

    /// Read tables, views and columns into a dialect-neutral document.
    pub async fn introspect(&mut self) -> Result<SchemaDocument, AppError> {
        let dialect = self.dialect;
        let masked_url = self.masked_url.clone();
        let result = match self.engine_mut()? {
            Engine::PostgresPool(pool) => match postgresql::checkout(pool).await {
                Ok(client) => postgresql::introspect(&client).await,
                Err(e) => Err(e),
            },
            Engine::Postgres { client, .. } => postgresql::introspect(client).await,
            Engine::MySqlPool(pool) => match mysql::checkout(pool).await {
                Ok(mut conn) => mysql::introspect(&mut conn).await,
                Err(e) => Err(e),
            },
            Engine::MySql(conn) => mysql::introspect(conn).await,
            Engine::Sqlite { conn, .. } => sqlite::introspect(conn.clone()).await,
        };
        result.map_err(|e| connection_error(dialect, &masked_url, format!("Failed to extract metadata: {}", e.message())))
    }

    /// Release every connection held by this handle.
    pub async fn dispose(mut self) {
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.close().await {
                tracing::warn!("Failed to dispose {} engine for {}: {}", self.dialect, self.masked_url, e);
            } else {
                tracing::debug!("Disposed {} engine for {}", self.dialect, self.masked_url);
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            tracing::debug!("Disposing {} engine for {} on drop", self.dialect, self.masked_url);
            engine.close_now();
        }
    }
}

/// Creates engines for registered connections.
#[derive(Debug, Clone, Default)]
pub struct EngineProvisioner {
    settings: EngineSettings,
}

impl EngineProvisioner {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub async fn provision(
        &self,
        connection: &DatabaseConnection,
        mode: EngineMode,
    ) -> Result<EngineHandle, AppError> {
        let dialect = connection.database_type;
        let url = normalize_url(&connection.url, dialect);
        let masked_url = mask_credentials(&connection.url);

        tracing::debug!(
            "Provisioning {:?} {} engine for '{}' ({})",
            mode,
            dialect,
            connection.name,
            masked_url
        );

        let engine = tokio::time::timeout(self.settings.connect_timeout, self.connect(dialect, &url, mode))
            .await
            .map_err(|_| {
                connection_error(
                    dialect,
                    &masked_url,
                    format!("Connection timed out after {}s", self.settings.connect_timeout.as_secs()),
                )
            })?
            .map_err(|e| {
                tracing::error!("Failed to connect to {} database {}: {}", dialect, masked_url, e.message());
                connection_error(dialect, &masked_url, e.message())
            })?;

        Ok(EngineHandle {
            dialect,
            masked_url,
            statement_timeout: None,
            engine: Some(engine),
        })
    }

    async fn connect(&self, dialect: DatabaseType, url: &str, mode: EngineMode) -> Result<Engine, AppError> {
        match (dialect, mode) {
            (DatabaseType::PostgreSQL, EngineMode::Pooled) => {
                let pool = postgresql::create_pool(url, self.settings.max_connections())?;
                // Pools are lazy; check out once so unreachable servers fail here.
                drop(postgresql::checkout(&pool).await?);
                Ok(Engine::PostgresPool(pool))
            }
            (DatabaseType::PostgreSQL, EngineMode::OneShot) => {
                let (client, driver) = postgresql::connect(url).await?;
                Ok(Engine::Postgres { client, driver })
            }
            (DatabaseType::MySQL, EngineMode::Pooled) => {
                let pool = mysql::create_pool(url, self.settings.max_connections())?;
                drop(mysql::checkout(&pool).await?);
                Ok(Engine::MySqlPool(pool))
            }
            (DatabaseType::MySQL, EngineMode::OneShot) => Ok(Engine::MySql(mysql::connect(url).await?)),
            (DatabaseType::Sqlite, _) => {
                let conn = sqlite::open(url.to_string(), self.settings.connect_timeout).await?;
                let interrupt = sqlite::interrupt_handle(&conn)?;
                Ok(Engine::Sqlite { conn, interrupt })
            }
        }
    }

    /// Connect and run `SELECT 1`, disposing the engine afterwards.
    pub async fn test_connection(&self, connection: &DatabaseConnection) -> Result<(), AppError> {
        let mut handle = self.provision(connection, EngineMode::Pooled).await?;
        let result = handle.fetch_all("SELECT 1").await;
        handle.dispose().await;

        result.map(|_| ()).map_err(|e| {
            connection_error(connection.database_type, &connection.masked_url(), e.message())
        })
    }
}
