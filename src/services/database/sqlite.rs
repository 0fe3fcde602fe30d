// SQLite target databases. rusqlite is blocking, so every call runs on the
// blocking pool while holding the connection mutex.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};

use crate::api::middleware::AppError;
use crate::models::{CellValue, ColumnMetadata, RawResultSet, SchemaDocument, TableMetadata};

pub type SharedConnection = Arc<Mutex<Connection>>;

/// SQLite has a single schema per attached file.
const MAIN_SCHEMA: &str = "main";

const LIST_OBJECTS: &str = "SELECT name, type FROM sqlite_master \
     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name";

async fn run_blocking<T, F>(conn: SharedConnection, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let guard = conn
            .lock()
            .map_err(|_| AppError::Internal("SQLite connection lock poisoned".to_string()))?;
        f(&*guard).map_err(|e| AppError::Database(e.to_string()))
    })
    .await
    .map_err(|e| AppError::Internal(format!("SQLite task failed: {}", e)))?
}

/// Open an existing database file. Missing files are an error rather than
/// being created.
pub(crate) async fn open(path: String, busy_timeout: Duration) -> Result<SharedConnection, AppError> {
    let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };
        conn.busy_timeout(busy_timeout)?;
        Ok(conn)
    })
    .await
    .map_err(|e| AppError::Internal(format!("SQLite task failed: {}", e)))?
    .map_err(|e| AppError::Database(format!("Failed to open SQLite database: {}", e)))?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// Handle that aborts the statement running on `conn` without taking its lock.
pub(crate) fn interrupt_handle(conn: &SharedConnection) -> Result<InterruptHandle, AppError> {
    let guard = conn
        .lock()
        .map_err(|_| AppError::Internal("SQLite connection lock poisoned".to_string()))?;
    Ok(guard.get_interrupt_handle())
}

pub(crate) fn close(conn: SharedConnection) -> Result<(), AppError> {
    // Still shared by an in-flight blocking call: it closes when that call drops it.
    let Ok(mutex) = Arc::try_unwrap(conn) else {
        return Ok(());
    };
    let conn = mutex
        .into_inner()
        .map_err(|_| AppError::Internal("SQLite connection lock poisoned".to_string()))?;
    conn.close()
        .map_err(|(_, e)| AppError::Database(format!("Failed to close SQLite database: {}", e)))
}

pub(crate) async fn fetch_all(conn: SharedConnection, sql: String) -> Result<RawResultSet, AppError> {
    run_blocking(conn, move |conn| query_all(conn, &sql)).await
}

fn query_all(conn: &Connection, sql: &str) -> rusqlite::Result<RawResultSet> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut decoded = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            cells.push(decode_value(row.get_ref(idx)?));
        }
        decoded.push(cells);
    }

    Ok(RawResultSet {
        columns,
        rows: decoded,
    })
}

fn decode_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(n) => CellValue::Integer(n),
        ValueRef::Real(f) => CellValue::Real(f),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Blob(bytes.to_vec()),
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) async fn introspect(conn: SharedConnection) -> Result<SchemaDocument, AppError> {
    run_blocking(conn, read_schema).await
}

fn read_schema(conn: &Connection) -> rusqlite::Result<SchemaDocument> {
    let mut stmt = conn.prepare(LIST_OBJECTS)?;
    let objects = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tables = Vec::new();
    let mut views = Vec::new();
    for (name, kind) in objects {
        let columns = table_columns(conn, &name)?;
        if kind == "table" {
            let row_count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_identifier(&name)),
                [],
                |row| row.get(0),
            )?;
            tables.push(TableMetadata::table(name, MAIN_SCHEMA.to_string(), columns, row_count));
        } else {
            views.push(TableMetadata::view(name, MAIN_SCHEMA.to_string(), columns));
        }
    }

    Ok(SchemaDocument::new(tables, views))
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnMetadata>> {
    let unique = unique_columns(conn, table)?;

    // cid, name, type, notnull, dflt_value, pk
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            Ok(ColumnMetadata {
                unique: unique.contains(&name),
                name,
                data_type: row.get(2)?,
                nullable: row.get::<_, i64>(3)? == 0,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? > 0,
                comment: None,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Columns covered on their own by a UNIQUE index.
fn unique_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    // seq, name, unique, origin, partial
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", quote_identifier(table)))?;
    let indexes = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?, row.get::<_, String>(3)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut columns = Vec::new();
    for (index, is_unique, origin) in indexes {
        // Primary keys are reported separately.
        if is_unique == 0 || origin == "pk" {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info({})", quote_identifier(&index)))?;
        let names = info
            .query_map([], |row| row.get::<_, Option<String>>(2))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if let [Some(name)] = names.as_slice() {
            columns.push(name.clone());
        }
    }
    Ok(columns)
}
