use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::handlers::database::{self, AppState};
use crate::api::handlers::query;
use crate::config::Config;
use crate::storage::SqliteStorage;

/// Create router with application state
pub fn create_router_with_state(storage: Arc<SqliteStorage>, config: Config) -> Router {
    create_router(AppState::new(storage, config))
}

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/dbs", get(database::list_databases))
        .route(
            "/api/v1/dbs/{name}",
            put(database::upsert_database)
                .get(database::get_database_metadata)
                .delete(database::delete_database),
        )
        .route("/api/v1/dbs/{name}/refresh", post(database::refresh_metadata))
        .route("/api/v1/dbs/{name}/query", post(query::execute_query))
        .route("/api/v1/dbs/{name}/query/natural", post(query::natural_language_query))
        .route("/api/v1/dbs/{name}/history", get(query::query_history))
        .route("/api/v1/dbs/{name}/export", post(query::export_result))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = config.cors_origins();
    if origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::permissive().allow_origin(AllowOrigin::list(allowed))
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::middleware::AppError;
    use crate::models::{DatabaseType, GeneratedSql, SchemaDocument};
    use crate::services::SqlGenerator;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct EchoGenerator;

    #[async_trait]
    impl SqlGenerator for EchoGenerator {
        async fn generate_sql(
            &self,
            _dialect: DatabaseType,
            schema: &SchemaDocument,
            prompt: &str,
        ) -> Result<GeneratedSql, AppError> {
            let table = schema
                .tables
                .first()
                .map(|t| t.name.clone())
                .unwrap_or_else(|| "missing".to_string());
            let sql = if prompt.contains("delete") {
                format!("DELETE FROM {}", table)
            } else {
                format!("SELECT * FROM {}", table)
            };
            Ok(GeneratedSql {
                sql,
                explanation: "echo".to_string(),
            })
        }
    }

    async fn app() -> (Router, TempDir, String) {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.db");
        {
            let conn = rusqlite::Connection::open(&target).unwrap();
            conn.execute_batch(
                "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
                 INSERT INTO books (title) VALUES ('Dune'), ('Emma');",
            )
            .unwrap();
        }
        let storage = SqliteStorage::new(dir.path().join("app.db")).await.unwrap();
        let config = Config::from_env().unwrap();
        let state = AppState::new(Arc::new(storage), config).with_sql_generator(Arc::new(EchoGenerator));
        let url = format!("sqlite:///{}", target.display());
        (create_router(state), dir, url)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register(app: &Router, url: &str) {
        let (status, body) = send(app, Method::PUT, "/api/v1/dbs/library", Some(json!({ "url": url }))).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _dir, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let (app, _dir, url) = app().await;
        register(&app, &url).await;

        let (status, body) = send(&app, Method::GET, "/api/v1/dbs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["databases"][0]["name"], "library");
        assert_eq!(body["databases"][0]["databaseType"], "sqlite");
        assert_eq!(body["databases"][0]["status"], "active");
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let (app, _dir, url) = app().await;

        let (status, body) = send(&app, Method::PUT, "/api/v1/dbs/bad%20name", Some(json!({ "url": url }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, _) = send(
            &app,
            Method::PUT,
            "/api/v1/dbs/oracle",
            Some(json!({ "url": "oracle://scott:tiger@db/orcl" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_unreachable_target() {
        let (app, dir, _) = app().await;
        let url = format!("sqlite:///{}", dir.path().join("absent.db").display());

        let (status, body) = send(&app, Method::PUT, "/api/v1/dbs/absent", Some(json!({ "url": url }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "CONNECTION_ERROR");
        assert_eq!(body["error"]["details"]["databaseType"], "sqlite");
    }

    #[tokio::test]
    async fn test_metadata_and_refresh() {
        let (app, _dir, url) = app().await;
        register(&app, &url).await;

        let (status, body) = send(&app, Method::GET, "/api/v1/dbs/library", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["databaseName"], "library");
        assert_eq!(body["isStale"], false);
        assert_eq!(body["tables"][0]["name"], "books");
        assert_eq!(body["tables"][0]["rowCount"], 2);
        assert_eq!(body["tables"][0]["columns"][0]["primaryKey"], true);

        let (status, refreshed) = send(&app, Method::POST, "/api/v1/dbs/library/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refreshed["tables"][0]["name"], "books");
    }

    #[tokio::test]
    async fn test_url_change_keeps_cache_until_connection_succeeds() {
        let (app, dir, url) = app().await;
        register(&app, &url).await;

        let (_, before) = send(&app, Method::GET, "/api/v1/dbs/library", None).await;

        let absent = format!("sqlite:///{}", dir.path().join("absent.db").display());
        let (status, _) = send(&app, Method::PUT, "/api/v1/dbs/library", Some(json!({ "url": absent }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (_, after) = send(&app, Method::GET, "/api/v1/dbs/library", None).await;
        assert_eq!(after["fetchedAt"], before["fetchedAt"]);
        assert_eq!(after["tables"][0]["name"], "books");

        let moved = dir.path().join("moved.db");
        rusqlite::Connection::open(&moved)
            .unwrap()
            .execute_batch("CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        register(&app, &format!("sqlite:///{}", moved.display())).await;

        let (_, switched) = send(&app, Method::GET, "/api/v1/dbs/library", None).await;
        assert_eq!(switched["tables"][0]["name"], "authors");
    }

    #[tokio::test]
    async fn test_query_and_history() {
        let (app, _dir, url) = app().await;
        register(&app, &url).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/library/query",
            Some(json!({ "sql": "SELECT id, title FROM books ORDER BY id" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rowCount"], 2);
        assert_eq!(body["sql"], "SELECT id, title FROM books ORDER BY id LIMIT 1000");
        assert_eq!(body["columns"][0]["dataType"], "integer");
        assert_eq!(body["rows"][1]["title"], "Emma");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/library/query",
            Some(json!({ "sql": "DELETE FROM books" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/library/query",
            Some(json!({ "sql": "SELECT nope FROM books" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "EXECUTION_ERROR");
        assert!(body["error"]["details"]["executionTimeMs"].is_u64());

        let (status, history) = send(&app, Method::GET, "/api/v1/dbs/library/history?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["sqlText"], "SELECT nope FROM books LIMIT 1000");
        assert_eq!(history[0]["success"], false);
        assert_eq!(history[1]["executionTimeMs"], 0);
    }

    #[tokio::test]
    async fn test_unknown_database_is_404() {
        let (app, _dir, _) = app().await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/ghost/query",
            Some(json!({ "sql": "SELECT 1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "DATABASE_NOT_FOUND");

        let (status, _) = send(&app, Method::GET, "/api/v1/dbs/ghost/history", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_natural_language_query() {
        let (app, _dir, url) = app().await;
        register(&app, &url).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/library/query/natural",
            Some(json!({ "prompt": "all books" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sql"], "SELECT * FROM books LIMIT 1000");
        assert_eq!(body["explanation"], "echo");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/library/query/natural",
            Some(json!({ "prompt": "delete everything" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Generated SQL failed validation"));
    }

    #[tokio::test]
    async fn test_export_csv() {
        let (app, _dir, url) = app().await;
        register(&app, &url).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/library/export",
            Some(json!({
                "columns": [{ "name": "id", "dataType": "integer" }, { "name": "title" }],
                "rows": [{ "id": 1, "title": "Dune" }],
                "format": "csv",
                "filename": "books.csv"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "id,title\n1,Dune\n");
        assert_eq!(body["filename"], "books.csv");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/dbs/library/export",
            Some(json!({ "columns": [], "rows": [], "format": "xml" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_FORMAT");
    }

    #[tokio::test]
    async fn test_delete_database() {
        let (app, _dir, url) = app().await;
        register(&app, &url).await;

        let (status, _) = send(&app, Method::DELETE, "/api/v1/dbs/library", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, Method::DELETE, "/api/v1/dbs/library", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
