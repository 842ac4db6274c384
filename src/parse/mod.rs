//! Tabular source parsing.
//!
//! CSV and Excel inputs normalize to the same [`ParsedSheet`] shape so the
//! rest of the pipeline never cares which format a file arrived in. An Excel
//! workbook yields one sheet per non-empty worksheet; CSV yields exactly one
//! unnamed sheet.

use std::io::Cursor;

use calamine::{Data, Reader};
use serde_json::{Map, Value};

use crate::error::{ImportError, Result};

/// MIME types accepted as CSV.
pub const CSV_MIME_TYPES: &[&str] = &["text/csv", "application/csv", "text/plain"];

/// MIME types accepted as Excel workbooks. `application/zip` covers xlsx
/// files sniffed by magic bytes (they are zip containers).
pub const EXCEL_MIME_TYPES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
    "application/zip",
];

/// One table of parsed rows. `name` is `None` for single-table sources.
#[derive(Debug, Clone)]
pub struct ParsedSheet {
    pub name: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

/// Parse raw bytes according to the resolved MIME type.
pub fn parse_content(bytes: &[u8], mime_type: &str) -> Result<Vec<ParsedSheet>> {
    if CSV_MIME_TYPES.contains(&mime_type) {
        Ok(vec![parse_csv(bytes)?])
    } else if EXCEL_MIME_TYPES.contains(&mime_type) {
        parse_excel(bytes)
    } else {
        Err(ImportError::Parse(format!(
            "unsupported content type: {}",
            mime_type
        )))
    }
}

/// Parse a CSV document. The first record is the header row; empty cells
/// are omitted from the row map so schema inference sees them as absent.
pub fn parse_csv(bytes: &[u8]) -> Result<ParsedSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ImportError::Parse(format!("invalid CSV header: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::Parse("CSV has no header row".into()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ImportError::Parse(format!("invalid CSV row: {}", e)))?;
        let mut row = Map::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            let trimmed = field.trim();
            if header.is_empty() || trimmed.is_empty() {
                continue;
            }
            row.insert(header.clone(), Value::String(trimmed.to_string()));
        }
        rows.push(row);
    }

    Ok(ParsedSheet {
        name: None,
        headers,
        rows,
    })
}

/// Parse an Excel workbook (xlsx or legacy xls), one [`ParsedSheet`] per
/// non-empty worksheet. The first worksheet row is the header row.
pub fn parse_excel(bytes: &[u8]) -> Result<Vec<ParsedSheet>> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor)
        .map_err(|e| ImportError::Parse(format!("invalid workbook: {}", e)))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let mut sheets = Vec::new();

    for sheet_name in sheet_names {
        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(range) => range,
            Err(e) => {
                return Err(ImportError::Parse(format!(
                    "failed to read sheet '{}': {}",
                    sheet_name, e
                )))
            }
        };

        let mut iter = range.rows();
        let Some(header_row) = iter.next() else {
            continue;
        };
        let headers: Vec<String> = header_row
            .iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            continue;
        }

        let mut rows = Vec::new();
        for data_row in iter {
            let mut row = Map::new();
            for (header, cell) in headers.iter().zip(data_row.iter()) {
                if header.is_empty() {
                    continue;
                }
                if let Some(value) = cell_to_value(cell) {
                    row.insert(header.clone(), value);
                }
            }
            if !row.is_empty() {
                rows.push(row);
            }
        }

        if !rows.is_empty() {
            sheets.push(ParsedSheet {
                name: Some(sheet_name),
                headers,
                rows,
            });
        }
    }

    if sheets.is_empty() {
        return Err(ImportError::Parse("workbook has no non-empty sheets".into()));
    }
    Ok(sheets)
}

/// Map one spreadsheet cell to JSON. Empty cells return `None`; whole
/// floats become integers so row hashing stays stable across formats.
fn cell_to_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty => None,
        Data::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(Value::String(trimmed.to_string()))
            }
        }
        Data::Int(i) => Some(Value::from(*i)),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                Some(Value::from(*f as i64))
            } else {
                Some(Value::from(*f))
            }
        }
        Data::Bool(b) => Some(Value::Bool(*b)),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|naive| Value::String(naive.format("%Y-%m-%dT%H:%M:%S").to_string())),
        Data::DateTimeIso(s) => Some(Value::String(s.clone())),
        Data::DurationIso(s) => Some(Value::String(s.clone())),
        Data::Error(_) => None,
    }
}
