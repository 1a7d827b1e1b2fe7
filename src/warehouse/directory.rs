use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use uuid::Uuid;

use super::{
    BRAND_COLUMN, ColumnSpec, RowRejection, TableId, TableInfo, Warehouse, WarehouseError,
    WarehouseRow,
};
use crate::io_utils::{self, DEFAULT_CSV_DELIMITER};

/// A warehouse kept on disk: one directory per dataset, one CSV file per
/// table whose header row is the schema.
///
/// Table creation uses an exclusive create, so concurrent creators observe
/// a conflict. Rewrites (deletes, schema growth) go through a temporary file
/// and a rename. Writers inside one process are serialized; separate
/// processes are not.
#[derive(Debug)]
pub struct DirectoryWarehouse {
    root: PathBuf,
    write_lock: Mutex<()>,
}

struct TableFile {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl DirectoryWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, id: &TableId) -> PathBuf {
        self.root.join(&id.dataset).join(format!("{}.csv", id.table))
    }

    fn exclusive<T>(
        &self,
        f: impl FnOnce() -> Result<T, WarehouseError>,
    ) -> Result<T, WarehouseError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| WarehouseError::Backend("directory warehouse lock poisoned".to_string()))?;
        f()
    }

    fn read_table(&self, id: &TableId) -> Result<TableFile, WarehouseError> {
        let path = self.table_path(id);
        let file = File::open(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => WarehouseError::NotFound(format!("table {id}")),
            _ => WarehouseError::Io {
                path: path.clone(),
                source,
            },
        })?;
        let mut reader = io_utils::open_csv_reader(file, DEFAULT_CSV_DELIMITER);
        let mut records = reader.records();
        let headers = match records.next() {
            Some(record) => record
                .map_err(|source| csv_error(&path, source))?
                .iter()
                .map(str::to_string)
                .collect::<Vec<_>>(),
            // Created but header not flushed yet.
            None => return Err(WarehouseError::NotFound(format!("table {id} schema"))),
        };
        let mut rows = Vec::new();
        for record in records {
            let record = record.map_err(|source| csv_error(&path, source))?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }
        Ok(TableFile { headers, rows })
    }

    fn rewrite(&self, id: &TableId, table: &TableFile) -> Result<(), WarehouseError> {
        let path = self.table_path(id);
        let temp = path.with_extension(format!("csv.{}.tmp", Uuid::new_v4().simple()));
        let file = File::create(&temp).map_err(|source| io_error(&temp, source))?;
        write_records(&temp, BufWriter::new(file), Some(table.headers.as_slice()), &table.rows)?;
        fs::rename(&temp, &path).map_err(|source| io_error(&path, source))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> WarehouseError {
    WarehouseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path, source: csv::Error) -> WarehouseError {
    WarehouseError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn write_records<W: Write>(
    path: &Path,
    sink: W,
    headers: Option<&[String]>,
    rows: &[Vec<String>],
) -> Result<(), WarehouseError> {
    let mut writer = io_utils::csv_writer(sink, DEFAULT_CSV_DELIMITER);
    if let Some(headers) = headers {
        writer
            .write_record(headers)
            .map_err(|source| csv_error(path, source))?;
    }
    for row in rows {
        writer
            .write_record(row)
            .map_err(|source| csv_error(path, source))?;
    }
    writer.flush().map_err(|source| io_error(path, source))
}

fn table_info(id: &TableId, headers: &[String]) -> TableInfo {
    TableInfo {
        id: id.clone(),
        columns: headers
            .iter()
            .map(|name| ColumnSpec {
                name: name.clone(),
                required: name == BRAND_COLUMN,
            })
            .collect(),
    }
}

fn brand_position(id: &TableId, headers: &[String]) -> Result<usize, WarehouseError> {
    headers
        .iter()
        .position(|h| h == BRAND_COLUMN)
        .ok_or_else(|| WarehouseError::Backend(format!("table {id} has no {BRAND_COLUMN} column")))
}

fn row_map(headers: &[String], values: &[String]) -> WarehouseRow {
    headers.iter().cloned().zip(values.iter().cloned()).collect()
}

impl Warehouse for DirectoryWarehouse {
    fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        Ok(self.root.join(dataset).is_dir())
    }

    fn create_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        fs::create_dir_all(&self.root).map_err(|source| io_error(&self.root, source))?;
        let path = self.root.join(dataset);
        fs::create_dir(&path).map_err(|source| match source.kind() {
            ErrorKind::AlreadyExists => WarehouseError::Conflict(format!("dataset {dataset}")),
            _ => io_error(&path, source),
        })
    }

    fn get_table(&self, id: &TableId) -> Result<TableInfo, WarehouseError> {
        let table = self.read_table(id)?;
        Ok(table_info(id, &table.headers))
    }

    fn create_table(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        if !self.dataset_exists(&id.dataset)? {
            return Err(WarehouseError::NotFound(format!("dataset {}", id.dataset)));
        }
        let path = self.table_path(id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => WarehouseError::Conflict(format!("table {id}")),
                _ => io_error(&path, source),
            })?;
        let headers: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        write_records(&path, BufWriter::new(file), Some(headers.as_slice()), &[])?;
        debug!("Created table file {path:?}");
        Ok(table_info(id, &headers))
    }

    fn add_columns(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        self.exclusive(|| {
            let mut table = self.read_table(id)?;
            let before = table.headers.len();
            for column in columns {
                if !table.headers.contains(&column.name) {
                    table.headers.push(column.name.clone());
                }
            }
            if table.headers.len() != before {
                for row in &mut table.rows {
                    row.resize(table.headers.len(), String::new());
                }
                self.rewrite(id, &table)?;
            }
            Ok(table_info(id, &table.headers))
        })
    }

    fn delete_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        self.exclusive(|| {
            let mut table = self.read_table(id)?;
            let brand = brand_position(id, &table.headers)?;
            let before = table.rows.len();
            table.rows.retain(|row| row[brand] != brand_code);
            let removed = before - table.rows.len();
            if removed > 0 {
                self.rewrite(id, &table)?;
            }
            Ok(removed)
        })
    }

    fn count_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        let table = self.read_table(id)?;
        let brand = brand_position(id, &table.headers)?;
        Ok(table.rows.iter().filter(|row| row[brand] == brand_code).count())
    }

    fn brand_rows(&self, id: &TableId, brand_code: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let table = self.read_table(id)?;
        let brand = brand_position(id, &table.headers)?;
        Ok(table
            .rows
            .iter()
            .filter(|row| row[brand] == brand_code)
            .map(|row| row_map(&table.headers, row))
            .collect())
    }

    fn insert_rows(&self, id: &TableId, rows: &[WarehouseRow]) -> Result<Vec<RowRejection>, WarehouseError> {
        self.exclusive(|| {
            let table = self.read_table(id)?;
            let schema = table_info(id, &table.headers);
            let mut rejections = Vec::new();
            let mut accepted = Vec::with_capacity(rows.len());
            for (index, row) in rows.iter().enumerate() {
                match schema.reject_reason(row) {
                    Some(message) => rejections.push(RowRejection { index, message }),
                    None => accepted.push(
                        table
                            .headers
                            .iter()
                            .map(|h| row.get(h).cloned().unwrap_or_default())
                            .collect::<Vec<_>>(),
                    ),
                }
            }
            if !accepted.is_empty() {
                let path = self.table_path(id);
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|source| io_error(&path, source))?;
                write_records(&path, BufWriter::new(file), None, &accepted)?;
            }
            Ok(rejections)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(brand: &str, a: &str) -> WarehouseRow {
        WarehouseRow::from([
            (BRAND_COLUMN.to_string(), brand.to_string()),
            ("A".to_string(), a.to_string()),
        ])
    }

    #[test]
    fn table_file_round_trips_rows_and_schema_growth() {
        let dir = tempdir().unwrap();
        let wh = DirectoryWarehouse::new(dir.path().join("wh"));
        let id = TableId::new("ds", "orders");
        assert!(wh.get_table(&id).unwrap_err().is_not_found());

        wh.create_dataset("ds").unwrap();
        assert!(wh.create_dataset("ds").unwrap_err().is_conflict());
        wh.create_table(&id, &[ColumnSpec::required(BRAND_COLUMN), ColumnSpec::nullable("A")])
            .unwrap();
        assert!(wh.create_table(&id, &[]).unwrap_err().is_conflict());

        let rejected = wh
            .insert_rows(&id, &[row("GS", "a, \"quoted\""), row("XY", "2")])
            .unwrap();
        assert!(rejected.is_empty());

        let info = wh.add_columns(&id, &[ColumnSpec::nullable("B")]).unwrap();
        assert_eq!(info.column_names(), vec![BRAND_COLUMN, "A", "B"]);
        assert!(info.columns[0].required);

        let gs = wh.brand_rows(&id, "GS").unwrap();
        assert_eq!(gs.len(), 1);
        assert_eq!(gs[0]["A"], "a, \"quoted\"");
        assert_eq!(gs[0]["B"], "");

        assert_eq!(wh.delete_brand(&id, "GS").unwrap(), 1);
        assert_eq!(wh.count_brand(&id, "GS").unwrap(), 0);
        assert_eq!(wh.count_brand(&id, "XY").unwrap(), 1);
    }

    #[test]
    fn unknown_columns_are_rejected_per_row() {
        let dir = tempdir().unwrap();
        let wh = DirectoryWarehouse::new(dir.path());
        let id = TableId::new("ds", "t");
        wh.create_dataset("ds").unwrap();
        wh.create_table(&id, &[ColumnSpec::required(BRAND_COLUMN), ColumnSpec::nullable("A")])
            .unwrap();
        let mut bad = row("GS", "1");
        bad.insert("Q".to_string(), "x".to_string());
        let rejected = wh.insert_rows(&id, &[row("GS", "0"), bad]).unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].index, 1);
        assert_eq!(wh.count_brand(&id, "GS").unwrap(), 1);
    }
}
