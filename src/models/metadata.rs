use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::DatabaseType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    /// Type name exactly as the dialect reports it.
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A table or view. Columns are kept in physical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub schema_name: String,
    pub columns: Vec<ColumnMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
}

impl TableMetadata {
    pub fn table(name: String, schema_name: String, columns: Vec<ColumnMetadata>, row_count: i64) -> Self {
        Self {
            name,
            object_type: ObjectType::Table,
            schema_name,
            columns,
            row_count: Some(row_count),
        }
    }

    pub fn view(name: String, schema_name: String, columns: Vec<ColumnMetadata>) -> Self {
        Self {
            name,
            object_type: ObjectType::View,
            schema_name,
            columns,
            row_count: None,
        }
    }
}

/// Dialect-neutral snapshot of one database, produced by a single introspection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDocument {
    pub tables: Vec<TableMetadata>,
    pub views: Vec<TableMetadata>,
}

impl SchemaDocument {
    pub fn new(tables: Vec<TableMetadata>, views: Vec<TableMetadata>) -> Self {
        Self { tables, views }
    }

    pub fn object_count(&self) -> usize {
        self.tables.len() + self.views.len()
    }
}

/// The single cache entry kept per connection name.
#[derive(Debug, Clone)]
pub struct CachedMetadata {
    pub database_name: String,
    pub document: SchemaDocument,
    pub fetched_at: DateTime<Utc>,
    pub table_count: i64,
}

impl CachedMetadata {
    pub fn is_stale(&self, window: Duration) -> bool {
        Utc::now() - self.fetched_at > window
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMetadataResponse {
    pub database_name: String,
    pub database_type: DatabaseType,
    pub tables: Vec<TableMetadata>,
    pub views: Vec<TableMetadata>,
    pub fetched_at: DateTime<Utc>,
    pub is_stale: bool,
}

impl DatabaseMetadataResponse {
    pub fn from_cache(entry: CachedMetadata, database_type: DatabaseType, is_stale: bool) -> Self {
        Self {
            database_name: entry.database_name,
            database_type,
            tables: entry.document.tables,
            views: entry.document.views,
            fetched_at: entry.fetched_at,
            is_stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, pk: bool) -> ColumnMetadata {
        ColumnMetadata {
            name: name.to_string(),
            data_type: "integer".to_string(),
            nullable: !pk,
            primary_key: pk,
            unique: false,
            default_value: None,
            comment: None,
        }
    }

    #[test]
    fn test_document_serializes_camel_case() {
        let doc = SchemaDocument::new(
            vec![TableMetadata::table("users".into(), "public".into(), vec![column("id", true)], 3)],
            vec![TableMetadata::view("active_users".into(), "public".into(), vec![column("id", false)])],
        );
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["tables"][0]["type"], "table");
        assert_eq!(value["tables"][0]["schemaName"], "public");
        assert_eq!(value["tables"][0]["rowCount"], 3);
        assert_eq!(value["tables"][0]["columns"][0]["primaryKey"], true);
        assert_eq!(value["views"][0]["type"], "view");
        assert!(value["views"][0].get("rowCount").is_none());
        assert_eq!(doc.object_count(), 2);
    }

    #[test]
    fn test_staleness_is_computed_from_fetch_time() {
        let entry = CachedMetadata {
            database_name: "db".into(),
            document: SchemaDocument::default(),
            fetched_at: Utc::now() - Duration::hours(25),
            table_count: 0,
        };
        assert!(entry.is_stale(Duration::hours(24)));
        assert!(!entry.is_stale(Duration::hours(48)));
    }
}
