use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::api::handlers::database::AppState;
use crate::api::middleware::AppError;
use crate::models::{GeneratedSql, NaturalLanguageInput, QueryHistoryEntry, QueryInput, QueryResult, QuerySource};
use crate::services::{render_export, ExportRequest, ExportResponse, DEFAULT_HISTORY_RETENTION};

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// Execute a SQL query against a registered database
pub async fn execute_query(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<QueryInput>,
) -> Result<Json<QueryResult>, AppError> {
    tracing::info!("Executing SQL query for '{}'", name);
    let connection = state.connection(&name).await?;
    let result = state
        .query_service
        .execute(&connection, &payload.sql, QuerySource::Manual)
        .await?;
    Ok(Json(result))
}

/// Query history, most recent first
pub async fn query_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<QueryHistoryEntry>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_RETENTION);
    if limit == 0 {
        return Err(AppError::Validation("limit must be at least 1".to_string()));
    }

    state.connection(&name).await?;
    let entries = state.query_service.history().list(&name, limit).await?;
    Ok(Json(entries))
}

/// Generate (but do not run) SQL from a natural-language prompt
pub async fn natural_language_query(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<NaturalLanguageInput>,
) -> Result<Json<GeneratedSql>, AppError> {
    let prompt = payload.prompt.trim();
    if prompt.is_empty() {
        return Err(AppError::Validation("Prompt cannot be empty".to_string()));
    }

    let connection = state.connection(&name).await?;
    let (metadata, _) = state.metadata_cache.get_or_refresh(&connection, false).await?;

    tracing::info!("Generating SQL for '{}' from natural language", name);
    let generated = state
        .query_service
        .generate_sql(state.sql_generator.as_ref(), &connection, &metadata.document, prompt)
        .await?;
    Ok(Json(generated))
}

/// Render a result set the caller already holds as CSV or JSON
pub async fn export_result(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<ExportRequest>,
) -> Result<Json<ExportResponse>, AppError> {
    state.connection(&name).await?;
    Ok(Json(render_export(payload)?))
}
