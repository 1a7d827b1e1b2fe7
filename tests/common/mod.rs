#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::{TempDir, tempdir};

use marketload::config::{CategoryConfig, Settings};
use marketload::warehouse::{
    ColumnSpec, MemoryWarehouse, RowRejection, TableId, TableInfo, Warehouse, WarehouseError,
    WarehouseRow,
};

/// Returns the absolute path to a fixture under `tests/data`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

pub fn fixture_bytes(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).expect("read fixture")
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }
}

/// Settings that never sleep, with a small retry budget.
pub fn quick_settings() -> Settings {
    Settings {
        max_retries: 3,
        ..Settings::without_delays()
    }
}

pub fn csv_bytes(lines: &[&str]) -> Vec<u8> {
    let mut out = lines.join("\n");
    out.push('\n');
    out.into_bytes()
}

pub fn snapshot_category() -> CategoryConfig {
    CategoryConfig::new("BA Produk Test", vec!["SKU".into(), "Nama Produk".into(), "Total Stok".into()])
        .with_aliases("Nama Produk", &["Product Name"])
        .with_aliases("Total Stok", &["Stok*"])
        .with_dynamic_headers(false)
}

pub fn append_category() -> CategoryConfig {
    CategoryConfig::new("Penjualan Harian", vec!["Tanggal".into(), "SKU".into(), "Qty".into()])
}

/// Pads the first `gate` table lookups so they all finish before any caller
/// moves on, which lines concurrent provisioners up for a create/create race.
pub struct RaceWarehouse {
    pub inner: MemoryWarehouse,
    barrier: Barrier,
    gate: usize,
    lookups: AtomicUsize,
    pub creates: AtomicUsize,
}

impl RaceWarehouse {
    pub fn new(callers: usize) -> Self {
        Self {
            inner: MemoryWarehouse::new(),
            barrier: Barrier::new(callers),
            gate: callers,
            lookups: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }
}

impl Warehouse for RaceWarehouse {
    fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        self.inner.dataset_exists(dataset)
    }

    fn create_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        self.inner.create_dataset(dataset)
    }

    fn get_table(&self, id: &TableId) -> Result<TableInfo, WarehouseError> {
        let result = self.inner.get_table(id);
        if self.lookups.fetch_add(1, Ordering::SeqCst) < self.gate {
            self.barrier.wait();
        }
        result
    }

    fn create_table(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_table(id, columns)
    }

    fn add_columns(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        self.inner.add_columns(id, columns)
    }

    fn delete_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        self.inner.delete_brand(id, brand_code)
    }

    fn count_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        self.inner.count_brand(id, brand_code)
    }

    fn brand_rows(&self, id: &TableId, brand_code: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        self.inner.brand_rows(id, brand_code)
    }

    fn insert_rows(&self, id: &TableId, rows: &[WarehouseRow]) -> Result<Vec<RowRejection>, WarehouseError> {
        self.inner.insert_rows(id, rows)
    }
}

/// Injects a fixed number of failures into selected operations.
#[derive(Default)]
pub struct FlakyWarehouse {
    pub inner: MemoryWarehouse,
    /// Deletes that answer with a rate-limit message before succeeding.
    pub rate_limited_deletes: AtomicUsize,
    /// Deletes that fail with an unrelated backend error.
    pub broken_deletes: AtomicUsize,
    /// Deletes that report the table as missing.
    pub missing_deletes: AtomicUsize,
    /// Brand reads that report the table as missing.
    pub missing_reads: AtomicUsize,
    /// Inserts that report the table as missing before succeeding.
    pub missing_inserts: AtomicUsize,
    /// Table creations that report a conflict without creating anything.
    pub phantom_conflicts: AtomicUsize,
    /// Rows carrying this value in any column are rejected.
    pub poison: Option<String>,
    pub delete_calls: AtomicUsize,
    pub insert_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
}

impl FlakyWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limited_deletes(self, n: usize) -> Self {
        self.rate_limited_deletes.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_broken_deletes(self, n: usize) -> Self {
        self.broken_deletes.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_missing_deletes(self, n: usize) -> Self {
        self.missing_deletes.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_missing_reads(self, n: usize) -> Self {
        self.missing_reads.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_missing_inserts(self, n: usize) -> Self {
        self.missing_inserts.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_phantom_conflicts(self, n: usize) -> Self {
        self.phantom_conflicts.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_poison(mut self, value: &str) -> Self {
        self.poison = Some(value.to_string());
        self
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Warehouse for FlakyWarehouse {
    fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        self.inner.dataset_exists(dataset)
    }

    fn create_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        self.inner.create_dataset(dataset)
    }

    fn get_table(&self, id: &TableId) -> Result<TableInfo, WarehouseError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_table(id)
    }

    fn create_table(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        if take_one(&self.phantom_conflicts) {
            return Err(WarehouseError::Conflict(format!("table {id}")));
        }
        self.inner.create_table(id, columns)
    }

    fn add_columns(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        self.inner.add_columns(id, columns)
    }

    fn delete_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.rate_limited_deletes) {
            return Err(WarehouseError::Backend(
                "Too many DML statements outstanding against table".to_string(),
            ));
        }
        if take_one(&self.broken_deletes) {
            return Err(WarehouseError::Backend("query planner exploded".to_string()));
        }
        if take_one(&self.missing_deletes) {
            return Err(WarehouseError::NotFound(format!("table {id}")));
        }
        self.inner.delete_brand(id, brand_code)
    }

    fn count_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        self.inner.count_brand(id, brand_code)
    }

    fn brand_rows(&self, id: &TableId, brand_code: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        if take_one(&self.missing_reads) {
            return Err(WarehouseError::NotFound(format!("table {id}")));
        }
        self.inner.brand_rows(id, brand_code)
    }

    fn insert_rows(&self, id: &TableId, rows: &[WarehouseRow]) -> Result<Vec<RowRejection>, WarehouseError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.missing_inserts) {
            return Err(WarehouseError::NotFound(format!("table {id}")));
        }
        let Some(poison) = &self.poison else {
            return self.inner.insert_rows(id, rows);
        };
        let mut rejections = Vec::new();
        let mut accepted = Vec::new();
        let mut positions = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            if row.values().any(|v| v == poison) {
                rejections.push(RowRejection {
                    index,
                    message: format!("invalid value '{poison}'"),
                });
            } else {
                accepted.push(row.clone());
                positions.push(index);
            }
        }
        // The inner store numbers rejections within `accepted`.
        rejections.extend(
            self.inner
                .insert_rows(id, &accepted)?
                .into_iter()
                .map(|r| RowRejection {
                    index: positions[r.index],
                    message: r.message,
                }),
        );
        rejections.sort_by_key(|r| r.index);
        Ok(rejections)
    }
}

/// Non-sentinel rows of `brand`, as (column, value) pairs without the brand.
pub fn brand_values(wh: &MemoryWarehouse, id: &TableId, brand: &str) -> Vec<Vec<(String, String)>> {
    wh.brand_rows(id, brand)
        .expect("brand rows")
        .into_iter()
        .map(|row| {
            row.into_iter()
                .filter(|(k, _)| k != "_brand_code")
                .collect()
        })
        .collect()
}
