//! The destination seam.
//!
//! Everything the provisioner and the load coordinator need from the
//! analytical store goes through [`Warehouse`]. Tables are all-text: one
//! required brand-code column plus nullable string columns.

mod directory;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub use directory::DirectoryWarehouse;
pub use memory::MemoryWarehouse;

/// The partition column every destination table carries.
pub const BRAND_COLUMN: &str = "_brand_code";

/// One row as written to or read from a table: column name to text value.
pub type WarehouseRow = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("warehouse error: {0}")]
    Backend(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl WarehouseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WarehouseError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WarehouseError::Conflict(_))
    }

    /// Write-concurrency limits, whether typed or only visible in a backend
    /// message.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            WarehouseError::RateLimited(_) => true,
            WarehouseError::Backend(message) => {
                let lower = message.to_ascii_lowercase();
                lower.contains("too many dml statements") || lower.contains("concurrent")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableId {
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub required: bool,
}

impl ColumnSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn nullable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub id: TableId,
    pub columns: Vec<ColumnSpec>,
}

impl TableInfo {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns of `wanted` that this table lacks, in `wanted` order.
    pub fn missing<'a>(&self, wanted: &'a [ColumnSpec]) -> Vec<&'a ColumnSpec> {
        wanted.iter().filter(|c| !self.has_column(&c.name)).collect()
    }

    /// Why the table would refuse `row`, if it would.
    pub fn reject_reason(&self, row: &WarehouseRow) -> Option<String> {
        if let Some(unknown) = row.keys().find(|name| !self.has_column(name)) {
            return Some(format!("no such field: {unknown}"));
        }
        self.columns
            .iter()
            .filter(|c| c.required)
            .find(|c| row.get(&c.name).is_none_or(|v| v.is_empty()))
            .map(|c| format!("missing required field: {}", c.name))
    }
}

/// A row the destination refused; `index` is the row's position in the
/// submitted slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub index: usize,
    pub message: String,
}

pub trait Warehouse: Send + Sync {
    fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError>;

    /// Fails with [`WarehouseError::Conflict`] when the dataset exists.
    fn create_dataset(&self, dataset: &str) -> Result<(), WarehouseError>;

    /// Fails with [`WarehouseError::NotFound`] when the table does not exist.
    fn get_table(&self, id: &TableId) -> Result<TableInfo, WarehouseError>;

    /// Fails with [`WarehouseError::Conflict`] when another caller created
    /// the table first.
    fn create_table(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError>;

    /// Adds the given columns as nullable text. Existing columns are left
    /// untouched.
    fn add_columns(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError>;

    /// Removes every row of `brand_code` and returns how many went.
    fn delete_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError>;

    fn count_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError>;

    fn brand_rows(&self, id: &TableId, brand_code: &str) -> Result<Vec<WarehouseRow>, WarehouseError>;

    /// Appends rows. Rows the table refuses are returned; the rest are
    /// written.
    fn insert_rows(&self, id: &TableId, rows: &[WarehouseRow]) -> Result<Vec<RowRejection>, WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableInfo {
        TableInfo {
            id: TableId::new("ds", "t"),
            columns: vec![ColumnSpec::required(BRAND_COLUMN), ColumnSpec::nullable("A")],
        }
    }

    #[test]
    fn rate_limits_are_recognised_from_messages() {
        assert!(WarehouseError::RateLimited("x".into()).is_rate_limit());
        assert!(WarehouseError::Backend("Too many DML statements outstanding".into()).is_rate_limit());
        assert!(WarehouseError::Backend("could not serialize concurrent update".into()).is_rate_limit());
        assert!(!WarehouseError::Backend("syntax error".into()).is_rate_limit());
        assert!(!WarehouseError::NotFound("t".into()).is_rate_limit());
    }

    #[test]
    fn rows_are_checked_against_the_schema() {
        let table = table();
        let mut row = WarehouseRow::new();
        row.insert("A".into(), "1".into());
        assert_eq!(
            table.reject_reason(&row).as_deref(),
            Some("missing required field: _brand_code")
        );
        row.insert(BRAND_COLUMN.into(), "GS".into());
        assert_eq!(table.reject_reason(&row), None);
        row.insert("Z".into(), "x".into());
        assert_eq!(table.reject_reason(&row).as_deref(), Some("no such field: Z"));
    }

    #[test]
    fn missing_columns_keep_requested_order() {
        let wanted = vec![
            ColumnSpec::nullable("C"),
            ColumnSpec::nullable("A"),
            ColumnSpec::nullable("B"),
        ];
        let names: Vec<_> = table().missing(&wanted).iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["C", "B"]);
    }
}
