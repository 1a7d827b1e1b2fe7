//! File ingestion: raw bytes in, [`NormalizedRecord`] out.
//!
//! Delimited text and spreadsheets are both read into a grid of [`Cell`]s
//! first, so header offsets, blank-row filtering and column mapping behave
//! the same for every format.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use calamine::{Data, Reader, open_workbook_auto_from_rs};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::CategoryConfig;
use crate::data::Cell;
use crate::io_utils::{self, DecodeError};
use crate::mapping::{ColumnMapper, normalize_header};
use crate::normalize::normalize_cell;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported or unreadable file '{filename}': {detail}")]
    Unsupported { filename: String, detail: String },
    #[error("decoding text: {0}")]
    Decode(#[from] DecodeError),
    #[error("reading delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error("reading workbook: {0}")]
    Workbook(String),
    #[error("no header row found in '{filename}'")]
    NoHeaders { filename: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Delimited(u8),
    Spreadsheet,
    Unknown,
}

impl FileFormat {
    pub fn detect(filename: &str) -> Self {
        match io_utils::file_extension(filename).as_deref() {
            Some("csv") | Some("txt") => FileFormat::Delimited(io_utils::DEFAULT_CSV_DELIMITER),
            Some("tsv") => FileFormat::Delimited(io_utils::DEFAULT_TSV_DELIMITER),
            Some("xlsx") | Some("xlsm") | Some("xls") | Some("xlsb") | Some("ods") => {
                FileFormat::Spreadsheet
            }
            _ => FileFormat::Unknown,
        }
    }
}

/// Ordered headers plus rows that always carry exactly one value per header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizedRecord {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl NormalizedRecord {
    /// Short rows are padded with empty strings, long rows truncated.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { headers, rows }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == header)
    }

    pub fn value(&self, row: usize, header: &str) -> Option<&str> {
        let idx = self.column_index(header)?;
        self.rows.get(row).map(|r| r[idx].as_str())
    }

    pub fn records(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|values| RowView {
            headers: &self.headers,
            values,
        })
    }

    /// Concatenates records, aligning columns by header text in first-seen
    /// order. Values for headers a record lacks are empty.
    pub fn merge<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a NormalizedRecord>,
    {
        let mut headers: Vec<String> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut rows = Vec::new();
        for record in records {
            let targets: Vec<usize> = record
                .headers
                .iter()
                .map(|header| {
                    *positions.entry(header.clone()).or_insert_with(|| {
                        headers.push(header.clone());
                        headers.len() - 1
                    })
                })
                .collect();
            for source in &record.rows {
                let mut row = vec![String::new(); headers.len()];
                for (value, target) in source.iter().zip(&targets) {
                    row[*target] = value.clone();
                }
                rows.push(row);
            }
        }
        Self::new(headers, rows)
    }
}

/// A borrowed row addressable by header name.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    headers: &'a [String],
    values: &'a [String],
}

impl<'a> RowView<'a> {
    pub fn get(&self, header: &str) -> Option<&'a str> {
        let idx = self.headers.iter().position(|h| h == header)?;
        self.values.get(idx).map(String::as_str)
    }

    pub fn values(&self) -> &'a [String] {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub filename: String,
    pub category: Option<String>,
    pub record: NormalizedRecord,
    /// Data rows found below the configured data start row, blank ones included.
    pub total_rows: usize,
    pub skipped_rows: usize,
    pub errors: Vec<String>,
    pub column_mapped: bool,
    pub source_headers: Vec<String>,
}

impl IngestResult {
    pub fn is_valid(&self) -> bool {
        self.category.is_some() && !self.record.is_empty()
    }

    pub fn headers(&self) -> &[String] {
        self.record.headers()
    }
}

/// Reads `bytes` (named `filename`) and normalizes it for `category`.
///
/// Without a category, or with one that declares no canonical headers, every
/// source header is kept 1:1.
pub fn ingest_file(
    filename: &str,
    bytes: &[u8],
    category: Option<&CategoryConfig>,
) -> Result<IngestResult, IngestError> {
    let grid = read_grid(filename, bytes)?;
    let (header_row, data_start_row) = category
        .map(|c| (c.header_row, c.data_start_row))
        .unwrap_or((0, 1));

    let header_cells = grid
        .get(header_row)
        .filter(|row| row.iter().any(|cell| !cell.is_blank()))
        .ok_or_else(|| IngestError::NoHeaders {
            filename: filename.to_string(),
        })?;
    let source_headers: Vec<String> = header_cells
        .iter()
        .enumerate()
        .map(|(idx, cell)| match normalize_cell(cell) {
            text if text.is_empty() => format!("column_{idx}"),
            text => text,
        })
        .collect();

    let mut total_rows = 0;
    let mut skipped_rows = 0;
    let mut errors = Vec::new();
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    for (offset, row) in grid.into_iter().skip(data_start_row).enumerate() {
        total_rows += 1;
        if row.iter().all(Cell::is_blank) {
            skipped_rows += 1;
            continue;
        }
        let overflow = row
            .iter()
            .skip(source_headers.len())
            .filter(|cell| !cell.is_blank())
            .count();
        if overflow > 0 {
            errors.push(format!(
                "Row {}: {overflow} value(s) beyond the last header were ignored",
                data_start_row + offset + 1
            ));
        }
        rows.push(row);
    }
    debug!(
        "'{filename}': {total_rows} data row(s), {skipped_rows} blank row(s) skipped, {} header(s)",
        source_headers.len()
    );

    let mapped = category
        .filter(|c| !c.required_headers.is_empty())
        .and_then(|c| {
            ColumnMapper::for_category(c)
                .and_then(|mapper| mapper.map_rows(&source_headers, &rows))
                .map_err(|err| {
                    warn!(
                        "Column mapping for '{filename}' ({}) failed: {err}; keeping source headers",
                        c.name
                    );
                })
                .ok()
        });
    let column_mapped = mapped.is_some();
    let (headers, values) = mapped.unwrap_or_else(|| pass_through(&source_headers, &rows));

    let record = NormalizedRecord::new(dedupe_headers(headers), values);
    info!(
        "Ingested '{filename}': {} row(s) x {} column(s){}",
        record.len(),
        record.headers().len(),
        if column_mapped { " (mapped)" } else { "" }
    );
    Ok(IngestResult {
        filename: filename.to_string(),
        category: category.map(|c| c.name.clone()),
        record,
        total_rows,
        skipped_rows,
        errors,
        column_mapped,
        source_headers,
    })
}

fn pass_through(headers: &[String], rows: &[Vec<Cell>]) -> (Vec<String>, Vec<Vec<String>>) {
    let values = rows
        .iter()
        .map(|row| {
            (0..headers.len())
                .map(|idx| row.get(idx).map(normalize_cell).unwrap_or_default())
                .collect()
        })
        .collect();
    (headers.to_vec(), values)
}

/// Suffixes later occurrences of a header (by normalized form) with `_1`,
/// `_2`, ... until the name is unique.
pub fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(headers.len());
    let mut unique = Vec::with_capacity(headers.len());
    for header in headers {
        if seen.insert(normalize_header(&header)) {
            unique.push(header);
            continue;
        }
        let mut suffix = 1;
        loop {
            let candidate = format!("{header}_{suffix}");
            if seen.insert(normalize_header(&candidate)) {
                unique.push(candidate);
                break;
            }
            suffix += 1;
        }
    }
    unique
}

/// Reads every row of the file (first sheet for workbooks) as raw cells.
pub fn read_grid(filename: &str, bytes: &[u8]) -> Result<Vec<Vec<Cell>>, IngestError> {
    match FileFormat::detect(filename) {
        FileFormat::Delimited(delimiter) => read_delimited(bytes, delimiter),
        FileFormat::Spreadsheet => read_workbook(bytes),
        FileFormat::Unknown => read_workbook(bytes).or_else(|workbook_err| {
            debug!("'{filename}' is not a workbook ({workbook_err}); trying delimited text");
            read_delimited(bytes, io_utils::resolve_delimiter(filename)).map_err(|text_err| {
                IngestError::Unsupported {
                    filename: filename.to_string(),
                    detail: format!("{workbook_err}; {text_err}"),
                }
            })
        }),
    }
}

fn read_delimited(bytes: &[u8], delimiter: u8) -> Result<Vec<Vec<Cell>>, IngestError> {
    let decoded = io_utils::decode_text(bytes)?;
    debug!("Decoded delimited text as {}", decoded.encoding.name());
    let mut reader = io_utils::open_csv_reader(decoded.text.as_bytes(), delimiter);
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record?;
        grid.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Cell::Empty
                    } else {
                        Cell::text(field)
                    }
                })
                .collect(),
        );
    }
    Ok(grid)
}

fn read_workbook(bytes: &[u8]) -> Result<Vec<Vec<Cell>>, IngestError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|err| IngestError::Workbook(err.to_string()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| IngestError::Workbook("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|err| IngestError::Workbook(format!("sheet '{sheet}': {err}")))?;

    // Ranges start at the first used cell; pad back to absolute positions so
    // header offsets count from the top of the sheet.
    let (first_row, first_col) = range.start().unwrap_or((0, 0));
    let mut grid: Vec<Vec<Cell>> = vec![Vec::new(); first_row as usize];
    for row in range.rows() {
        let mut cells = vec![Cell::Empty; first_col as usize];
        cells.extend(row.iter().map(cell_from_data));
        grid.push(cells);
    }
    Ok(grid)
}

fn cell_from_data(value: &Data) -> Cell {
    match value {
        Data::Empty => Cell::Empty,
        Data::String(text) if text.is_empty() => Cell::Empty,
        Data::String(text) => Cell::Text(text.clone()),
        Data::Int(value) => Cell::Integer(*value),
        Data::Float(value) => Cell::Float(*value),
        Data::Bool(value) => Cell::Boolean(*value),
        Data::DateTime(value) => value
            .as_datetime()
            .map(Cell::DateTime)
            .unwrap_or(Cell::Float(value.as_f64())),
        Data::DateTimeIso(text) | Data::DurationIso(text) => Cell::Text(text.clone()),
        Data::Error(err) => Cell::Text(err.to_string()),
    }
}
