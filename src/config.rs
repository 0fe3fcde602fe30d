use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub query: QueryConfig,
    pub metadata: MetadataConfig,
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
    pub cors: CorsConfig,
}

/// Local store for connections, metadata cache and query history.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub row_limit: u64,
    pub timeout_secs: u64,
    pub history_retention: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    pub staleness_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub pool_size: usize,
    pub max_overflow: usize,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub origins: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("database.url", "./db/db_query.db")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("query.row_limit", 1000)?
            .set_default("query.timeout_secs", 30)?
            .set_default("query.history_retention", 50)?
            .set_default("metadata.staleness_hours", 24)?
            .set_default("engine.pool_size", 2)?
            .set_default("engine.max_overflow", 10)?
            .set_default("engine.connect_timeout_secs", 10)?
            .set_default("llm.base_url", "https://api.openai.com/v1")?
            .set_default("llm.model", "gpt-4o-mini")?
            .set_default("logging.level", "info")?
            .set_default("cors.origins", "*")?;

        let overrides = [
            ("DATABASE_URL", "database.url"),
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("QUERY_ROW_LIMIT", "query.row_limit"),
            ("QUERY_TIMEOUT_SECS", "query.timeout_secs"),
            ("HISTORY_RETENTION", "query.history_retention"),
            ("METADATA_STALENESS_HOURS", "metadata.staleness_hours"),
            ("ENGINE_POOL_SIZE", "engine.pool_size"),
            ("ENGINE_MAX_OVERFLOW", "engine.max_overflow"),
            ("ENGINE_CONNECT_TIMEOUT_SECS", "engine.connect_timeout_secs"),
            ("OPENAI_BASE_URL", "llm.base_url"),
            ("OPENAI_MODEL", "llm.model"),
            ("RUST_LOG", "logging.level"),
            ("CORS_ORIGINS", "cors.origins"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            if !api_key.is_empty() {
                builder = builder.set_override("llm.api_key", Some(api_key))?;
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.metadata.staleness_hours)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.connect_timeout_secs)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        if self.cors.origins.trim() == "*" {
            return vec!["*".to_string()];
        }
        self.cors
            .origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }
}
