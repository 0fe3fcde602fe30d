// MySQL engines built on mysql_async
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value};

use crate::api::middleware::AppError;
use crate::models::{CellValue, ColumnMetadata, RawResultSet, SchemaDocument, TableMetadata};

/// Character set id MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

const LIST_OBJECTS: &str = r#"
    SELECT table_schema, table_name, table_type
    FROM information_schema.tables
    WHERE table_schema NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')
      AND table_schema = ?
    ORDER BY table_name
"#;

const LIST_COLUMNS: &str = r#"
    SELECT column_name, data_type, is_nullable, column_default, column_key, column_comment
    FROM information_schema.columns
    WHERE table_schema = ? AND table_name = ?
    ORDER BY ordinal_position
"#;

fn database_error(context: &str) -> impl Fn(mysql_async::Error) -> AppError + '_ {
    move |e| AppError::Database(format!("{}: {}", context, e))
}

fn parse_opts(url: &str) -> Result<Opts, AppError> {
    Opts::from_url(url).map_err(|e| AppError::Database(format!("Invalid MySQL URL: {}", e)))
}

pub(crate) fn create_pool(url: &str, max_size: usize) -> Result<Pool, AppError> {
    let constraints = PoolConstraints::new(0, max_size)
        .ok_or_else(|| AppError::Database(format!("Invalid MySQL pool size: {}", max_size)))?;
    let opts = OptsBuilder::from_opts(parse_opts(url)?)
        .pool_opts(PoolOpts::default().with_constraints(constraints));
    Ok(Pool::new(opts))
}

/// Take a connection from the pool, pinging it before use.
pub(crate) async fn checkout(pool: &Pool) -> Result<Conn, AppError> {
    let mut conn = pool
        .get_conn()
        .await
        .map_err(database_error("Failed to get MySQL connection from pool"))?;
    conn.ping().await.map_err(database_error("MySQL ping failed"))?;
    Ok(conn)
}

pub(crate) async fn connect(url: &str) -> Result<Conn, AppError> {
    Conn::new(parse_opts(url)?)
        .await
        .map_err(database_error("Failed to open MySQL connection"))
}

pub(crate) async fn set_statement_timeout(conn: &mut Conn, timeout: Duration) -> Result<(), AppError> {
    conn.query_drop(format!("SET SESSION max_execution_time = {}", timeout.as_millis()))
        .await
        .map_err(database_error("Failed to set statement timeout"))
}

/// Run `sql` as a prepared statement. The server refuses more than one
/// statement per prepare, whatever the multi-statement capability says.
pub(crate) async fn fetch_all(conn: &mut Conn, sql: &str) -> Result<RawResultSet, AppError> {
    let mut result = conn
        .exec_iter(sql, ())
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
    let columns: Vec<Column> = result.columns_ref().to_vec();
    let rows: Vec<Row> = result
        .collect()
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

    let decoded: Vec<Vec<CellValue>> = rows
        .into_iter()
        .map(|mut row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, column)| decode_cell(row.take::<Value, _>(idx).unwrap_or(Value::NULL), column))
                .collect()
        })
        .collect();

    Ok(RawResultSet {
        columns: columns.iter().map(|c| c.name_str().into_owned()).collect(),
        rows: decoded,
    })
}

/// Decode one cell. The binary protocol types most values; decimals and
/// strings still arrive as bytes, where the column type decides the variant.
fn decode_cell(value: Value, column: &Column) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(n) => CellValue::Integer(n),
        Value::UInt(n) => i64::try_from(n)
            .map(CellValue::Integer)
            .unwrap_or_else(|_| CellValue::Text(n.to_string())),
        Value::Float(f) => CellValue::Real(f.into()),
        Value::Double(d) => CellValue::Real(d),
        Value::Date(y, m, d, h, mi, s, us) => {
            let date = NaiveDate::from_ymd_opt(y.into(), m.into(), d.into());
            match (column.column_type(), date) {
                (ColumnType::MYSQL_TYPE_DATE, Some(date)) => CellValue::Date(date),
                (_, Some(date)) => date
                    .and_hms_micro_opt(h.into(), mi.into(), s.into(), us)
                    .map(CellValue::Timestamp)
                    .unwrap_or(CellValue::Null),
                (_, None) => CellValue::Text(format!("{:04}-{:02}-{:02}", y, m, d)),
            }
        }
        Value::Time(negative, days, h, m, s, _) => {
            let sign = if negative { "-" } else { "" };
            CellValue::Text(format!("{}{}:{:02}:{:02}", sign, days * 24 + u32::from(h), m, s))
        }
        Value::Bytes(bytes) => decode_bytes(bytes, column),
    }
}

fn decode_bytes(bytes: Vec<u8>, column: &Column) -> CellValue {
    let column_type = column.column_type();
    let is_string_type = matches!(
        column_type,
        ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
            | ColumnType::MYSQL_TYPE_STRING
    );
    if is_string_type && column.character_set() == BINARY_CHARSET {
        return CellValue::Blob(bytes);
    }

    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return CellValue::Blob(e.into_bytes()),
    };

    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => match text.parse::<i64>() {
            Ok(n) => CellValue::Integer(n),
            Err(_) => CellValue::Text(text),
        },
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => match text.parse::<f64>() {
            Ok(n) => CellValue::Real(n),
            Err(_) => CellValue::Text(text),
        },
        ColumnType::MYSQL_TYPE_DATE => match NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
            Ok(date) => CellValue::Date(date),
            Err(_) => CellValue::Text(text),
        },
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_TIMESTAMP => {
            match NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f") {
                Ok(ts) => CellValue::Timestamp(ts),
                Err(_) => CellValue::Text(text),
            }
        }
        _ => CellValue::Text(text),
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub(crate) async fn introspect(conn: &mut Conn) -> Result<SchemaDocument, AppError> {
    let database: Option<String> = conn
        .query_first::<Option<String>, _>("SELECT DATABASE()")
        .await
        .map_err(database_error("Failed to read current database"))?
        .flatten();
    let Some(database) = database else {
        return Err(AppError::Database(
            "No database selected; include one in the connection URL".to_string(),
        ));
    };

    let objects: Vec<(String, String, String)> = conn
        .exec(LIST_OBJECTS, (database.as_str(),))
        .await
        .map_err(database_error("Failed to list tables"))?;

    let mut tables = Vec::new();
    let mut views = Vec::new();
    for (schema, name, table_type) in objects {
        let columns = table_columns(conn, &schema, &name).await?;
        if table_type == "BASE TABLE" {
            let row_count = row_count(conn, &schema, &name).await?;
            tables.push(TableMetadata::table(name, schema, columns, row_count));
        } else {
            views.push(TableMetadata::view(name, schema, columns));
        }
    }

    Ok(SchemaDocument::new(tables, views))
}

type ColumnRow = (String, String, String, Option<String>, Option<String>, Option<String>);

async fn table_columns(conn: &mut Conn, schema: &str, table: &str) -> Result<Vec<ColumnMetadata>, AppError> {
    let rows: Vec<ColumnRow> = conn
        .exec(LIST_COLUMNS, (schema, table))
        .await
        .map_err(database_error("Failed to get columns"))?;

    Ok(rows
        .into_iter()
        .map(|(name, data_type, is_nullable, default_value, column_key, comment)| {
            let key = column_key.unwrap_or_default();
            ColumnMetadata {
                name,
                data_type,
                nullable: is_nullable == "YES",
                primary_key: key.contains("PRI"),
                unique: key == "UNI",
                default_value,
                comment: comment.filter(|c| !c.is_empty()),
            }
        })
        .collect())
}

async fn row_count(conn: &mut Conn, schema: &str, table: &str) -> Result<i64, AppError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.{}",
        quote_identifier(schema),
        quote_identifier(table)
    );
    let count: Option<i64> = conn
        .query_first(sql)
        .await
        .map_err(database_error("Failed to count rows"))?;
    Ok(count.unwrap_or(0))
}
