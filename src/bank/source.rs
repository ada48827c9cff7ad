//! Tabular question bank sources
//!
//! Reads CSV files (header row required) and JSON arrays of row objects into
//! a uniform header + string-cell table.

use crate::config::SourceFormat;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum BankError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error in {path:?}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("JSON error in {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0:?} is not a JSON array of row objects")]
    NotAnArray(PathBuf),

    #[error("cannot infer source format from {0:?}")]
    UnknownFormat(PathBuf),

    #[error("source '{source_id}' is missing columns {columns:?}")]
    MissingColumns {
        source_id: String,
        columns: Vec<String>,
    },
}

/// Header names and string cells, in file order
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// 1-based data row number of each entry in `rows`, when rows were dropped
    pub row_numbers: Vec<usize>,
    /// Rows that could not be decoded and were left out
    pub malformed_rows: usize,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Data row number of `rows[index]` in the source file
    pub fn row_number(&self, index: usize) -> usize {
        self.row_numbers.get(index).copied().unwrap_or(index + 1)
    }

    /// Cell text, empty when the row is short
    pub fn cell<'a>(&'a self, row: &'a [String], column: usize) -> &'a str {
        row.get(column).map(|s| s.trim()).unwrap_or("")
    }
}

/// Format from the config, or from the file extension
pub fn detect_format(path: &Path, configured: Option<SourceFormat>) -> Result<SourceFormat, BankError> {
    if let Some(format) = configured {
        return Ok(format);
    }
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => Ok(SourceFormat::Csv),
        Some("json") => Ok(SourceFormat::Json),
        _ => Err(BankError::UnknownFormat(path.to_path_buf())),
    }
}

pub fn read_table(path: &Path, format: SourceFormat) -> Result<Table, BankError> {
    match format {
        SourceFormat::Csv => read_csv(path),
        SourceFormat::Json => read_json(path),
    }
}

fn read_csv(path: &Path) -> Result<Table, BankError> {
    let csv_err = |source| BankError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let headers = reader
        .byte_headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut table = Table {
        headers,
        ..Default::default()
    };
    for (i, record) in reader.byte_records().enumerate() {
        let row_number = i + 1;
        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(csv_err(e)),
            Err(e) => {
                warn!("{:?} row {}: {}, skipping", path, row_number, e);
                table.malformed_rows += 1;
                continue;
            }
        };

        let cells: Result<Vec<String>, _> = record
            .iter()
            .map(|cell| std::str::from_utf8(cell).map(String::from))
            .collect();
        match cells {
            Ok(cells) => {
                table.rows.push(cells);
                table.row_numbers.push(row_number);
            }
            Err(e) => {
                warn!("{:?} row {}: not valid UTF-8 ({}), skipping", path, row_number, e);
                table.malformed_rows += 1;
            }
        }
    }

    Ok(table)
}

fn read_json(path: &Path) -> Result<Table, BankError> {
    let content = std::fs::read_to_string(path).map_err(|source| BankError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| BankError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let Value::Array(items) = value else {
        return Err(BankError::NotAnArray(path.to_path_buf()));
    };

    let mut headers: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut objects = Vec::with_capacity(items.len());

    for item in items {
        let Value::Object(map) = item else {
            return Err(BankError::NotAnArray(path.to_path_buf()));
        };
        for key in map.keys() {
            if !positions.contains_key(key) {
                positions.insert(key.clone(), headers.len());
                headers.push(key.clone());
            }
        }
        objects.push(map);
    }

    let rows = objects
        .into_iter()
        .map(|map| {
            let mut row = vec![String::new(); headers.len()];
            for (key, value) in map {
                if let Some(&i) = positions.get(&key) {
                    row[i] = cell_text(&value);
                }
            }
            row
        })
        .collect();

    Ok(Table {
        headers,
        rows,
        ..Default::default()
    })
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
