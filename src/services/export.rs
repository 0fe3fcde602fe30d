use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::api::middleware::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(AppError::UnsupportedFormat(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column descriptor as sent back by clients; only `name` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub columns: Vec<ExportColumn>,
    pub rows: Vec<Map<String, Value>>,
    pub format: String,
    pub filename: Option<String>,
    #[serde(default = "default_true")]
    pub include_headers: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub data: String,
    pub format: String,
    pub filename: String,
}

/// `query_result_<YYYYmmdd_HHMMSS>.<ext>`
pub fn default_filename(format: ExportFormat) -> String {
    format!("query_result_{}.{}", Utc::now().format("%Y%m%d_%H%M%S"), format)
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        // Numbers, booleans, arrays and objects in compact JSON form.
        Some(other) => other.to_string(),
    }
}

/// Render rows as CSV. No rows gives an empty document, even with headers requested.
pub fn export_csv(
    columns: &[ExportColumn],
    rows: &[Map<String, Value>],
    include_headers: bool,
) -> Result<String, AppError> {
    if rows.is_empty() {
        return Ok(String::new());
    }

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    let csv_error = |e: csv::Error| AppError::Internal(format!("Failed to write CSV: {}", e));

    if include_headers {
        writer
            .write_record(columns.iter().map(|c| c.name.as_str()))
            .map_err(csv_error)?;
    }
    for row in rows {
        writer
            .write_record(columns.iter().map(|c| csv_cell(row.get(&c.name))))
            .map_err(csv_error)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Internal(format!("Failed to flush CSV: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| AppError::Internal(format!("CSV output is not UTF-8: {}", e)))
}

pub fn export_json(
    columns: &[ExportColumn],
    rows: &[Map<String, Value>],
    pretty: bool,
) -> Result<String, AppError> {
    let document = json!({
        "columns": columns,
        "rows": rows,
        "rowCount": rows.len(),
        "exportedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });

    let rendered = if pretty {
        serde_json::to_string_pretty(&document)
    } else {
        serde_json::to_string(&document)
    };
    rendered.map_err(|e| AppError::Internal(format!("Failed to serialize export: {}", e)))
}

pub fn render_export(request: ExportRequest) -> Result<ExportResponse, AppError> {
    let format = ExportFormat::parse(&request.format)?;
    let data = match format {
        ExportFormat::Csv => export_csv(&request.columns, &request.rows, request.include_headers)?,
        ExportFormat::Json => export_json(&request.columns, &request.rows, true)?,
    };
    let filename = request
        .filename
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| default_filename(format));

    tracing::info!("Exported {} rows as {}", request.rows.len(), format);
    Ok(ExportResponse {
        data,
        format: format.as_str().to_string(),
        filename,
    })
}
