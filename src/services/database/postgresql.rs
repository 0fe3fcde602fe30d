// PostgreSQL engines: verified pool for metadata, single client for queries
use std::error::Error;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, NoTls, Row};

use crate::api::middleware::AppError;
use crate::models::{CellValue, ColumnMetadata, RawResultSet, SchemaDocument, TableMetadata};

const LIST_TABLES: &str = r#"
    SELECT schemaname::text, tablename::text
    FROM pg_tables
    WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
    ORDER BY schemaname, tablename
"#;

const LIST_VIEWS: &str = r#"
    SELECT schemaname::text, viewname::text
    FROM pg_views
    WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
    ORDER BY schemaname, viewname
"#;

const LIST_COLUMNS: &str = r#"
    SELECT
        c.column_name::text,
        c.data_type::text,
        c.is_nullable::text = 'YES' AS nullable,
        c.column_default::text,
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
                AND tc.table_name = kcu.table_name
            WHERE tc.table_schema = c.table_schema
                AND tc.table_name = c.table_name
                AND kcu.column_name = c.column_name
                AND tc.constraint_type = 'PRIMARY KEY'
        ) AS is_primary_key,
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
                AND tc.table_name = kcu.table_name
            WHERE tc.table_schema = c.table_schema
                AND tc.table_name = c.table_name
                AND kcu.column_name = c.column_name
                AND tc.constraint_type = 'UNIQUE'
        ) AS is_unique,
        col_description(
            format('%I.%I', c.table_schema, c.table_name)::regclass,
            c.ordinal_position::int
        ) AS comment
    FROM information_schema.columns c
    WHERE c.table_schema::text = $1::text AND c.table_name::text = $2::text
    ORDER BY c.ordinal_position
"#;

/// Format a driver error, preferring the server's SQLSTATE and message.
pub(crate) fn describe_error(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db_error) => format!("Code: {}, Message: {}", db_error.code().code(), db_error.message()),
        None => e.to_string(),
    }
}

fn database_error(context: &str) -> impl Fn(tokio_postgres::Error) -> AppError + '_ {
    move |e| AppError::Database(format!("{}: {}", context, describe_error(&e)))
}

pub(crate) fn create_pool(url: &str, max_size: usize) -> Result<Pool, AppError> {
    let mut cfg = Config::new();
    cfg.url = Some(url.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Verified,
    });
    cfg.pool = Some(PoolConfig::new(max_size));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| AppError::Database(format!("Failed to create connection pool: {}", e)))
}

pub(crate) async fn checkout(pool: &Pool) -> Result<Object, AppError> {
    pool.get()
        .await
        .map_err(|e| AppError::Database(format!("Failed to get connection from pool: {}", e)))
}

/// Open one unpooled client. The returned task drives the connection and
/// ends when the client is dropped.
pub(crate) async fn connect(url: &str) -> Result<(Client, JoinHandle<()>), AppError> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| AppError::Database(describe_error(&e)))?;

    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!("PostgreSQL connection closed with error: {}", e);
        }
    });

    Ok((client, driver))
}

pub(crate) async fn set_statement_timeout(client: &Client, timeout: Duration) -> Result<(), AppError> {
    client
        .batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis()))
        .await
        .map_err(database_error("Failed to set statement timeout"))
}

pub(crate) async fn fetch_all(client: &Client, sql: &str) -> Result<RawResultSet, AppError> {
    // Prepare first so column names are known even for empty results.
    let statement = client
        .prepare(sql)
        .await
        .map_err(|e| AppError::Database(describe_error(&e)))?;
    let rows = client
        .query(&statement, &[])
        .await
        .map_err(|e| AppError::Database(describe_error(&e)))?;

    let columns = statement.columns();
    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let cells = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| decode_cell(row, idx, column.type_()))
            .collect::<Result<Vec<_>, _>>()?;
        decoded.push(cells);
    }

    Ok(RawResultSet {
        columns: columns.iter().map(|c| c.name().to_string()).collect(),
        rows: decoded,
    })
}

fn decode_cell(row: &Row, idx: usize, ty: &Type) -> Result<CellValue, AppError> {
    let cell = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(CellValue::Boolean)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map(|n| CellValue::Integer(n.into()))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map(|n| CellValue::Integer(n.into()))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(CellValue::Integer)),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)
            .map(|v| v.map(|n| CellValue::Integer(n.into()))),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map(|n| CellValue::Real(n.into()))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(CellValue::Real)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx).map(|v| v.map(CellValue::Text))
        }
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx).map(|v| v.map(CellValue::Date)),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .map(|v| v.map(|t| CellValue::Text(t.to_string()))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map(|v| v.map(CellValue::Timestamp)),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map(|v| v.map(CellValue::TimestampTz)),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx).map(|v| v.map(CellValue::Blob)),
        _ => row
            .try_get::<_, Option<LossyText>>(idx)
            .map(|v| v.map(|text| CellValue::Text(text.0))),
    };

    cell.map(|v| v.unwrap_or(CellValue::Null))
        .map_err(|e| AppError::Database(format!("Failed to decode column {} ({}): {}", idx, ty.name(), e)))
}

/// Text rendering for types without a dedicated cell variant.
///
/// NUMERIC, UUID, JSON and enum values are decoded from their binary wire
/// format; anything else renders as a `<typename>` placeholder.
struct LossyText(String);

impl<'a> FromSql<'a> for LossyText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let text = match *ty {
            Type::NUMERIC => decode_numeric(raw)?,
            Type::UUID => decode_uuid(raw)?,
            Type::JSON | Type::XML => String::from_utf8_lossy(raw).into_owned(),
            Type::JSONB => match raw.split_first() {
                Some((&1, body)) => String::from_utf8_lossy(body).into_owned(),
                _ => return Err("unsupported jsonb version".into()),
            },
            _ if matches!(ty.kind(), Kind::Enum(_)) => String::from_utf8_lossy(raw).into_owned(),
            _ => format!("<{}>", ty.name()),
        };
        Ok(LossyText(text))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Decode the binary NUMERIC format: base-10000 digit groups with a weight
/// (exponent of the first group) and a display scale.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    let read = |offset: usize| -> Result<u16, Box<dyn Error + Sync + Send>> {
        raw.get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric value".into())
    };

    let ndigits = read(0)? as usize;
    let weight = read(2)? as i16 as i32;
    let sign = read(4)?;
    let dscale = read(6)? as usize;
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }

    let digits = (0..ndigits)
        .map(|i| read(8 + 2 * i))
        .collect::<Result<Vec<u16>, _>>()?;
    let group = |idx: i32| -> u16 {
        if idx < 0 {
            0
        } else {
            digits.get(idx as usize).copied().unwrap_or(0)
        }
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&group(0).to_string());
        for idx in 1..=weight {
            text.push_str(&format!("{:04}", group(idx)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(idx)));
            idx += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}

fn decode_uuid(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    if raw.len() != 16 {
        return Err("invalid uuid length".into());
    }
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) async fn introspect(client: &Client) -> Result<SchemaDocument, AppError> {
    let mut tables = Vec::new();
    let table_rows = client
        .query(LIST_TABLES, &[])
        .await
        .map_err(database_error("Failed to list tables"))?;
    for row in table_rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        let columns = table_columns(client, &schema, &name).await?;
        let row_count = row_count(client, &schema, &name).await?;
        tables.push(TableMetadata::table(name, schema, columns, row_count));
    }

    let mut views = Vec::new();
    let view_rows = client
        .query(LIST_VIEWS, &[])
        .await
        .map_err(database_error("Failed to list views"))?;
    for row in view_rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        let columns = table_columns(client, &schema, &name).await?;
        views.push(TableMetadata::view(name, schema, columns));
    }

    Ok(SchemaDocument::new(tables, views))
}

async fn table_columns(client: &Client, schema: &str, table: &str) -> Result<Vec<ColumnMetadata>, AppError> {
    let rows = client
        .query(LIST_COLUMNS, &[&schema, &table])
        .await
        .map_err(database_error("Failed to get columns"))?;

    Ok(rows
        .iter()
        .map(|row| ColumnMetadata {
            name: row.get(0),
            data_type: row.get(1),
            nullable: row.get(2),
            default_value: row.get(3),
            primary_key: row.get(4),
            unique: row.get(5),
            comment: row.get(6),
        })
        .collect())
}

async fn row_count(client: &Client, schema: &str, table: &str) -> Result<i64, AppError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.{}",
        quote_identifier(schema),
        quote_identifier(table)
    );
    let row = client
        .query_one(&sql, &[])
        .await
        .map_err(database_error("Failed to count rows"))?;
    Ok(row.get(0))
}
