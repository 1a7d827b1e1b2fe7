//! Load coordination: normalized records into the shared destination table.
//!
//! Destination layout: `_brand_code` (required) followed by one nullable
//! text column per header position, named like spreadsheet columns (`A`,
//! `B`, ... `Z`, `AA`, ...). One sentinel row per table, branded
//! [`HEADER_SENTINEL`], carries the human-readable header text.
//!
//! Snapshot categories delete the brand's rows before inserting; append
//! categories accumulate, optionally skipping rows whose content already
//! exists for the brand.

use std::collections::HashMap;
use std::time::Instant;

use itertools::Itertools;
use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{CategoryConfig, LoadMode, Settings};
use crate::ingest::NormalizedRecord;
use crate::provision::Provisioner;
use crate::retry::{RetryError, RetryPolicy};
use crate::warehouse::{BRAND_COLUMN, ColumnSpec, TableId, Warehouse, WarehouseError, WarehouseRow};

/// Brand code of the synthetic header row.
pub const HEADER_SENTINEL: &str = "_header_";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("brand code '{0}' cannot be used for data rows")]
    ReservedBrand(String),
    #[error("nothing to load")]
    EmptyBatch,
    #[error("provisioning {table} failed: {source}")]
    Provision {
        table: String,
        #[source]
        source: WarehouseError,
    },
    #[error("deleting rows of brand '{brand_code}' still rate limited after {attempts} attempt(s)")]
    RateLimited { brand_code: String, attempts: u32 },
    #[error("table {table} still not visible after {attempts} insert attempt(s)")]
    TransientNotFound { table: String, attempts: u32 },
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

impl LoadError {
    /// Stable code reported to callers.
    pub fn reason(&self) -> &'static str {
        match self {
            LoadError::ReservedBrand(_) => "RESERVED_BRAND",
            LoadError::EmptyBatch => "EMPTY_BATCH",
            LoadError::Provision { .. } => "PROVISION_FAILED",
            LoadError::RateLimited { .. } => "RATE_LIMITED",
            LoadError::TransientNotFound { .. } => "TABLE_NOT_READY",
            LoadError::Warehouse(_) => "WAREHOUSE_ERROR",
        }
    }
}

/// Rows of one brand bound for one category table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBatch {
    pub brand_code: String,
    pub record: NormalizedRecord,
}

impl ImportBatch {
    pub fn new(brand_code: impl Into<String>, record: NormalizedRecord) -> Self {
        Self {
            brand_code: brand_code.into(),
            record,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub success: bool,
    pub table: String,
    pub import_id: String,
    pub load_mode: Option<LoadMode>,
    pub rows_inserted: usize,
    pub rows_total: usize,
    pub rows_deleted: usize,
    pub rows_deduplicated: usize,
    pub table_created: bool,
    pub sentinel_inserted: bool,
    pub errors: Vec<String>,
    pub failure_reason: Option<String>,
    pub elapsed_ms: u128,
}

/// `0 -> A`, `25 -> Z`, `26 -> AA`.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

pub fn import_id(table: &str, brand_code: &str) -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!("{table}_{brand_code}_{}", &unique[..8])
}

/// SHA-256 over the row's non-empty column/value pairs, brand included.
pub fn row_fingerprint(row: &WarehouseRow) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (column, value) in row.iter().filter(|(_, v)| !v.is_empty()) {
        hasher.update(column.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(value.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.finalize().into()
}

pub struct LoadCoordinator<'a> {
    warehouse: &'a dyn Warehouse,
    settings: &'a Settings,
    policy: RetryPolicy,
}

impl<'a> LoadCoordinator<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, settings: &'a Settings) -> Self {
        Self {
            warehouse,
            settings,
            policy: settings.retry_policy(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn table_id(&self, category: &CategoryConfig) -> TableId {
        TableId::new(&self.settings.dataset, &category.table)
    }

    pub fn load(&self, category: &CategoryConfig, batch: &ImportBatch) -> LoadResult {
        self.load_many(category, std::slice::from_ref(batch))
    }

    /// Loads several brands' rows with one provisioning pass and one
    /// sentinel check. Failures are described in the returned [`LoadResult`].
    pub fn load_many(&self, category: &CategoryConfig, batches: &[ImportBatch]) -> LoadResult {
        let started = Instant::now();
        let id = self.table_id(category);
        let brands = distinct_brands(batches);
        let mut result = LoadResult {
            table: id.to_string(),
            import_id: import_id(&category.table, &brands.join("-")),
            load_mode: Some(category.load_mode),
            rows_total: batches.iter().map(|b| b.record.len()).sum(),
            ..LoadResult::default()
        };

        match self.run(category, &id, batches, &brands, &mut result) {
            Ok(()) => {
                result.success = result.errors.is_empty();
                info!(
                    "Loaded {}/{} row(s) into {id} for {} [{}] ({} deleted, {} deduplicated, {} row error(s))",
                    result.rows_inserted,
                    result.rows_total,
                    category.name,
                    brands.join(", "),
                    result.rows_deleted,
                    result.rows_deduplicated,
                    result.errors.len()
                );
            }
            Err(err) => {
                error!(
                    "FAILED ({}) category={} brand={} table={id}: {err}",
                    err.reason(),
                    category.name,
                    brands.join(",")
                );
                result.success = false;
                result.failure_reason = Some(err.reason().to_string());
                result.errors.push(err.to_string());
            }
        }
        result.elapsed_ms = started.elapsed().as_millis();
        result
    }

    fn run(
        &self,
        category: &CategoryConfig,
        id: &TableId,
        batches: &[ImportBatch],
        brands: &[String],
        result: &mut LoadResult,
    ) -> Result<(), LoadError> {
        if result.rows_total == 0 {
            return Err(LoadError::EmptyBatch);
        }
        if let Some(bad) = brands
            .iter()
            .find(|b| b.trim().is_empty() || b.as_str() == HEADER_SENTINEL)
        {
            return Err(LoadError::ReservedBrand(bad.clone()));
        }

        let headers = union_headers(batches);
        let mut columns = vec![ColumnSpec::required(BRAND_COLUMN)];
        columns.extend((0..headers.len()).map(|idx| ColumnSpec::nullable(column_letter(idx))));

        let provisioner = Provisioner::new(self.warehouse, self.settings).with_policy(self.policy);
        provisioner.ensure_dataset(&id.dataset)?;
        let provisioned = provisioner.ensure_table(id, &columns)?;
        result.table_created = provisioned.created;

        if category.load_mode == LoadMode::Snapshot {
            for brand in brands {
                result.rows_deleted += self.delete_brand(id, brand)?;
            }
        }

        if !self.sentinel_exists(id) {
            let sentinel = sentinel_row(&headers);
            let rejected = self.insert_chunk(id, std::slice::from_ref(&sentinel))?;
            result.sentinel_inserted = rejected.is_empty();
            result.errors.extend(
                rejected
                    .into_iter()
                    .map(|message| format!("Header row: {message}")),
            );
        }

        let mut rows = destination_rows(&headers, batches);
        if category.load_mode == LoadMode::Append && self.settings.append_dedup {
            let (kept, skipped) = self.drop_existing(id, brands, rows)?;
            rows = kept;
            result.rows_deduplicated = skipped;
        }

        let mut offset = 0;
        for chunk in rows.chunks(self.settings.batch_size.max(1)) {
            let rejected = self.insert_indexed(id, chunk)?;
            result.rows_inserted += chunk.len() - rejected.len();
            result.errors.extend(
                rejected
                    .into_iter()
                    .map(|(index, message)| format!("Row {}: {message}", offset + index + 1)),
            );
            offset += chunk.len();
        }
        Ok(())
    }

    fn delete_brand(&self, id: &TableId, brand: &str) -> Result<usize, LoadError> {
        let outcome = self.policy.run(
            &format!("Deleting brand '{brand}' from {id}"),
            WarehouseError::is_rate_limit,
            |_| self.warehouse.delete_brand(id, brand),
        );
        match outcome {
            Ok(deleted) => {
                debug!("Deleted {deleted} row(s) of brand '{brand}' from {id}");
                Ok(deleted)
            }
            Err(RetryError::Exhausted { attempts, .. }) => Err(LoadError::RateLimited {
                brand_code: brand.to_string(),
                attempts,
            }),
            Err(RetryError::Aborted(err)) if err.is_not_found() => Ok(0),
            Err(RetryError::Aborted(err)) => {
                warn!("Delete of brand '{brand}' from {id} failed ({err}); continuing with insert");
                Ok(0)
            }
        }
    }

    fn sentinel_exists(&self, id: &TableId) -> bool {
        match self.warehouse.count_brand(id, HEADER_SENTINEL) {
            Ok(count) => count > 0,
            Err(err) => {
                warn!("Checking header row of {id} failed ({err}); assuming absent");
                false
            }
        }
    }

    /// Removes rows already present for their brand, counting duplicates
    /// so a row that exists once only suppresses one incoming copy.
    fn drop_existing(
        &self,
        id: &TableId,
        brands: &[String],
        rows: Vec<WarehouseRow>,
    ) -> Result<(Vec<WarehouseRow>, usize), LoadError> {
        let mut existing: HashMap<[u8; 32], usize> = HashMap::new();
        for brand in brands {
            let rows = match self.warehouse.brand_rows(id, brand) {
                Ok(rows) => rows,
                Err(err) if err.is_not_found() => {
                    warn!("{id} not visible yet for brand '{brand}' ({err}); treating as empty");
                    Vec::new()
                }
                Err(err) => return Err(err.into()),
            };
            for row in rows {
                *existing.entry(row_fingerprint(&row)).or_default() += 1;
            }
        }
        if existing.is_empty() {
            return Ok((rows, 0));
        }
        let before = rows.len();
        let kept: Vec<WarehouseRow> = rows
            .into_iter()
            .filter(|row| match existing.get_mut(&row_fingerprint(row)) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    false
                }
                _ => true,
            })
            .collect();
        let skipped = before - kept.len();
        if skipped > 0 {
            info!("Skipping {skipped} row(s) already present in {id}");
        }
        Ok((kept, skipped))
    }

    fn insert_indexed(
        &self,
        id: &TableId,
        chunk: &[WarehouseRow],
    ) -> Result<Vec<(usize, String)>, LoadError> {
        let outcome = self.policy.run(
            &format!("Inserting {} row(s) into {id}", chunk.len()),
            WarehouseError::is_not_found,
            |attempt| {
                if attempt > 0 {
                    // Refresh the handle; the insert below is what decides.
                    if let Err(err) = self.warehouse.get_table(id) {
                        debug!("Refreshing {id} before retry: {err}");
                    }
                }
                self.warehouse.insert_rows(id, chunk)
            },
        );
        match outcome {
            Ok(rejections) => Ok(rejections
                .into_iter()
                .map(|r| (r.index, r.message))
                .collect()),
            Err(RetryError::Exhausted { attempts, .. }) => Err(LoadError::TransientNotFound {
                table: id.to_string(),
                attempts,
            }),
            Err(RetryError::Aborted(err)) => Err(err.into()),
        }
    }

    fn insert_chunk(&self, id: &TableId, chunk: &[WarehouseRow]) -> Result<Vec<String>, LoadError> {
        Ok(self
            .insert_indexed(id, chunk)?
            .into_iter()
            .map(|(_, message)| message)
            .collect())
    }
}

fn distinct_brands(batches: &[ImportBatch]) -> Vec<String> {
    batches
        .iter()
        .map(|b| b.brand_code.trim().to_string())
        .unique()
        .collect()
}

/// Header text across all batches, first-seen order.
fn union_headers(batches: &[ImportBatch]) -> Vec<String> {
    batches
        .iter()
        .flat_map(|b| b.record.headers())
        .unique()
        .cloned()
        .collect()
}

fn sentinel_row(headers: &[String]) -> WarehouseRow {
    let mut row = WarehouseRow::new();
    row.insert(BRAND_COLUMN.to_string(), HEADER_SENTINEL.to_string());
    for (idx, header) in headers.iter().enumerate() {
        row.insert(column_letter(idx), header.clone());
    }
    row
}

/// Empty values are left out so they read back as NULL.
fn destination_rows(headers: &[String], batches: &[ImportBatch]) -> Vec<WarehouseRow> {
    let letters: HashMap<&str, String> = headers
        .iter()
        .enumerate()
        .map(|(idx, header)| (header.as_str(), column_letter(idx)))
        .collect();
    let mut rows = Vec::new();
    for batch in batches {
        let brand = batch.brand_code.trim();
        for record in batch.record.records() {
            let mut row = WarehouseRow::new();
            row.insert(BRAND_COLUMN.to_string(), brand.to_string());
            for (header, value) in record.iter() {
                if value.is_empty() {
                    continue;
                }
                if let Some(letter) = letters.get(header) {
                    row.insert(letter.clone(), value.to_string());
                }
            }
            rows.push(row);
        }
    }
    rows
}
