use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::{
    validate_connection_name, DatabaseConnection, DatabaseConnectionInput, DatabaseConnectionResponse,
    DatabaseMetadataResponse,
};
use crate::services::{
    EngineProvisioner, EngineSettings, HistoryLedger, LlmService, MetadataCacheService, QueryService, SqlGenerator,
};
use crate::storage::SqliteStorage;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<SqliteStorage>,
    pub config: Config,
    pub provisioner: EngineProvisioner,
    pub metadata_cache: MetadataCacheService,
    pub query_service: QueryService,
    pub sql_generator: Arc<dyn SqlGenerator>,
}

impl AppState {
    pub fn new(storage: Arc<SqliteStorage>, config: Config) -> Self {
        let provisioner = EngineProvisioner::new(EngineSettings::from(&config.engine));
        let history = HistoryLedger::new(storage.clone(), config.query.history_retention);
        let metadata_cache =
            MetadataCacheService::new(storage.clone(), provisioner.clone(), config.staleness_window());
        let query_service = QueryService::new(provisioner.clone(), history)
            .with_row_limit(config.query.row_limit)
            .with_timeout(config.query_timeout());
        let llm = LlmService::new(&config.llm);
        if !llm.is_configured() {
            tracing::warn!("No LLM API key configured; natural language queries will fail");
        }
        let sql_generator: Arc<dyn SqlGenerator> = Arc::new(llm);

        Self {
            storage,
            config,
            provisioner,
            metadata_cache,
            query_service,
            sql_generator,
        }
    }

    pub fn with_sql_generator(mut self, generator: Arc<dyn SqlGenerator>) -> Self {
        self.sql_generator = generator;
        self
    }

    /// Look up a registered connection or fail with 404.
    pub async fn connection(&self, name: &str) -> Result<DatabaseConnection, AppError> {
        self.storage
            .get_connection(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Database '{}' not found", name)))
    }
}

/// List all connections
pub async fn list_databases(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let connections: Vec<DatabaseConnectionResponse> = state
        .storage
        .list_connections()
        .await?
        .into_iter()
        .map(DatabaseConnectionResponse::from)
        .collect();

    Ok(Json(serde_json::json!({
        "databases": connections
    })))
}

/// Create or update a connection after a successful connection test
pub async fn upsert_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<DatabaseConnectionInput>,
) -> Result<(StatusCode, Json<DatabaseConnectionResponse>), AppError> {
    validate_connection_name(&name)?;
    let database_type = payload.validate()?;
    let url = payload.url.trim().to_string();

    let existing = state.storage.get_connection(&name).await?;
    let url_changed = existing.as_ref().is_some_and(|existing| existing.url != url);
    let mut connection = match existing {
        Some(mut existing) => {
            existing.url = url;
            existing.database_type = database_type;
            existing.description = payload.description;
            existing
        }
        None => DatabaseConnection::new(name.clone(), url, database_type, payload.description),
    };

    tracing::info!("Testing {} connection '{}' ({})", database_type, name, connection.masked_url());
    state.provisioner.test_connection(&connection).await?;

    if url_changed {
        // The cached schema belongs to the previous target.
        state.metadata_cache.invalidate(&name).await?;
    }

    connection.mark_connected();
    state.storage.save_connection(&connection).await?;
    tracing::info!("Saved connection '{}'", name);

    Ok((StatusCode::CREATED, Json(connection.into())))
}

/// Schema metadata, served from cache while fresh
pub async fn get_database_metadata(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DatabaseMetadataResponse>, AppError> {
    metadata_response(&state, &name, false).await
}

/// Re-introspect the target and replace the cached snapshot
pub async fn refresh_metadata(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DatabaseMetadataResponse>, AppError> {
    tracing::info!("Force refreshing metadata for '{}'", name);
    metadata_response(&state, &name, true).await
}

async fn metadata_response(
    state: &AppState,
    name: &str,
    force: bool,
) -> Result<Json<DatabaseMetadataResponse>, AppError> {
    let connection = state.connection(name).await?;
    let (entry, _cached) = state.metadata_cache.get_or_refresh(&connection, force).await?;
    let is_stale = entry.is_stale(state.metadata_cache.staleness());
    Ok(Json(DatabaseMetadataResponse::from_cache(
        entry,
        connection.database_type,
        is_stale,
    )))
}

/// Delete a connection with its cached metadata and history
pub async fn delete_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.storage.delete_connection(&name).await? {
        return Err(AppError::NotFound(format!("Database '{}' not found", name)));
    }
    tracing::info!("Deleted connection '{}'", name);
    Ok(StatusCode::NO_CONTENT)
}
