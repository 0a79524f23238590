//! Output formatting helpers for human-readable and JSON output.

use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row};

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn from_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Human }
    }
}

/// Print a table with aligned columns in human-readable format.
///
/// `headers` and each row in `rows` must have the same length.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    if rows.is_empty() {
        return;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
    };
    println!("{}", line(headers.to_vec()));
    for row in rows {
        println!("{}", line(row.iter().map(String::as_str).collect()));
    }
}

/// Column names of a result set.
pub fn column_names(row: &SqliteRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// One SQLite value as JSON, whatever its storage class.
pub fn cell_value(row: &SqliteRow, index: usize) -> serde_json::Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map_or(serde_json::Value::Null, Into::into);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map_or(serde_json::Value::Null, Into::into);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map_or(serde_json::Value::Null, Into::into);
    }
    match row.try_get::<Option<Vec<u8>>, _>(index) {
        Ok(Some(bytes)) => format!("x'{}'", hex::encode(bytes)).into(),
        _ => serde_json::Value::Null,
    }
}

/// A value as a table cell.
pub fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
