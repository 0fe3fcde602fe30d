use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Semantic column type reported with query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Integer,
    Real,
    Text,
    Boolean,
    Date,
    Timestamp,
    Blob,
}

/// A single decoded result cell, independent of the driver that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl CellValue {
    /// `None` for NULL, which carries no type information.
    pub fn semantic_type(&self) -> Option<SemanticType> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(_) => Some(SemanticType::Integer),
            CellValue::Real(_) => Some(SemanticType::Real),
            CellValue::Text(_) => Some(SemanticType::Text),
            CellValue::Boolean(_) => Some(SemanticType::Boolean),
            CellValue::Date(_) => Some(SemanticType::Date),
            CellValue::Timestamp(_) | CellValue::TimestampTz(_) => Some(SemanticType::Timestamp),
            CellValue::Blob(_) => Some(SemanticType::Blob),
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Integer(v) => Value::from(v),
            CellValue::Real(v) => serde_json::Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(v) => Value::String(v),
            CellValue::Boolean(v) => Value::Bool(v),
            CellValue::Date(v) => Value::String(v.format("%Y-%m-%d").to_string()),
            CellValue::Timestamp(v) => Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            CellValue::TimestampTz(v) => Value::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            CellValue::Blob(v) => Value::String(String::from_utf8_lossy(&v).into_owned()),
        }
    }
}

/// Column names plus decoded rows, as fetched from a target database.
#[derive(Debug, Clone, Default)]
pub struct RawResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RawResultSet {
    /// Semantic type per column from its first non-null cell; `text` when every cell is null.
    pub fn infer_column_types(&self) -> Vec<SemanticType> {
        (0..self.columns.len())
            .map(|idx| {
                self.rows
                    .iter()
                    .find_map(|row| row.get(idx).and_then(CellValue::semantic_type))
                    .unwrap_or(SemanticType::Text)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryColumn {
    pub name: String,
    pub data_type: SemanticType,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<QueryColumn>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub sql: String,
}

impl QueryResult {
    pub fn from_raw(raw: RawResultSet, execution_time_ms: u64, sql: String) -> Self {
        let types = raw.infer_column_types();
        let columns: Vec<QueryColumn> = raw
            .columns
            .iter()
            .zip(types)
            .map(|(name, data_type)| QueryColumn {
                name: name.clone(),
                data_type,
            })
            .collect();

        let rows: Vec<Map<String, Value>> = raw
            .rows
            .into_iter()
            .map(|row| {
                raw.columns
                    .iter()
                    .cloned()
                    .zip(row.into_iter().map(CellValue::into_json))
                    .collect()
            })
            .collect();

        Self {
            row_count: rows.len(),
            columns,
            rows,
            execution_time_ms,
            sql,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    Manual,
    NaturalLanguage,
}

impl QuerySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuerySource::Manual => "manual",
            QuerySource::NaturalLanguage => "natural_language",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "natural_language" => QuerySource::NaturalLanguage,
            _ => QuerySource::Manual,
        }
    }
}

/// A history row about to be written. Ids are assigned by storage.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub database_name: String,
    pub sql_text: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub row_count: usize,
    pub success: bool,
    pub error_message: Option<String>,
    pub query_source: QuerySource,
}

impl NewHistoryEntry {
    pub fn succeeded(
        database_name: &str,
        sql_text: &str,
        execution_time_ms: u64,
        row_count: usize,
        query_source: QuerySource,
    ) -> Self {
        Self {
            database_name: database_name.to_string(),
            sql_text: sql_text.to_string(),
            executed_at: Utc::now(),
            execution_time_ms,
            row_count,
            success: true,
            error_message: None,
            query_source,
        }
    }

    pub fn failed(
        database_name: &str,
        sql_text: &str,
        execution_time_ms: u64,
        error_message: String,
        query_source: QuerySource,
    ) -> Self {
        Self {
            database_name: database_name.to_string(),
            sql_text: sql_text.to_string(),
            executed_at: Utc::now(),
            execution_time_ms,
            row_count: 0,
            success: false,
            error_message: Some(error_message),
            query_source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHistoryEntry {
    pub id: i64,
    pub database_name: String,
    pub sql_text: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub row_count: usize,
    pub success: bool,
    pub error_message: Option<String>,
    pub query_source: QuerySource,
}

#[derive(Debug, Deserialize)]
pub struct QueryInput {
    pub sql: String,
}

#[derive(Debug, Deserialize)]
pub struct NaturalLanguageInput {
    pub prompt: String,
}

/// SQL proposed by the natural-language collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub explanation: String,
}
