//! Per-run import flows.
//!
//! An [`ImportContext`] is built once per process and passed to every flow;
//! nothing here keeps process-wide state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use serde::Serialize;

use crate::config::{Catalog, CategoryConfig, Settings};
use crate::ingest::{self, IngestResult, NormalizedRecord};
use crate::load::{ImportBatch, LoadCoordinator, LoadResult};
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    UnknownCategory,
    ParseFailed,
    UploadFailed,
    AllFilesFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownCategory => "UNKNOWN_CATEGORY",
            FailureReason::ParseFailed => "PARSE_FAILED",
            FailureReason::UploadFailed => "UPLOAD_FAILED",
            FailureReason::AllFilesFailed => "ALL_FILES_FAILED",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file handed to a batch, with the brand it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub brand_code: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub success: bool,
    pub filename: String,
    pub brand_code: String,
    pub category: String,
    pub rows_parsed: usize,
    pub rows_skipped: usize,
    pub column_mapped: bool,
    pub warnings: Vec<String>,
    pub load: Option<LoadResult>,
    pub failure_reason: Option<FailureReason>,
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

impl FileOutcome {
    fn new(category: &str, brand_code: &str, filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            brand_code: brand_code.to_string(),
            category: category.to_string(),
            ..Self::default()
        }
    }

    fn fail(&mut self, reason: FailureReason, message: String) {
        error!(
            "FAILED ({reason}) category={} brand={} file={}: {message}",
            self.category, self.brand_code, self.filename
        );
        self.success = false;
        self.failure_reason = Some(reason);
        self.error = Some(message);
    }

    fn record_ingest(&mut self, result: &IngestResult) {
        self.rows_parsed = result.record.len();
        self.rows_skipped = result.skipped_rows;
        self.column_mapped = result.column_mapped;
        self.warnings = result.errors.clone();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub category: String,
    pub files: Vec<FileOutcome>,
    pub files_succeeded: usize,
    pub files_failed: usize,
    pub load: Option<LoadResult>,
    pub failure_reason: Option<FailureReason>,
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

pub struct ImportContext {
    settings: Settings,
    catalog: Catalog,
    warehouse: Arc<dyn Warehouse>,
}

impl ImportContext {
    /// A dataset named in the catalog takes precedence over the settings.
    pub fn new(mut settings: Settings, catalog: Catalog, warehouse: Arc<dyn Warehouse>) -> Self {
        if let Some(dataset) = &catalog.dataset {
            settings.dataset = dataset.clone();
        }
        Self {
            settings,
            catalog,
            warehouse,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.warehouse.as_ref()
    }

    pub fn coordinator(&self) -> LoadCoordinator<'_> {
        LoadCoordinator::new(self.warehouse.as_ref(), &self.settings)
    }

    /// Ingests one file and loads it for `brand_code`.
    pub fn process_file(
        &self,
        category_name: &str,
        brand_code: &str,
        filename: &str,
        bytes: &[u8],
    ) -> FileOutcome {
        let started = Instant::now();
        let mut outcome = FileOutcome::new(category_name, brand_code, filename);
        self.process_file_into(&mut outcome, category_name, brand_code, filename, bytes);
        outcome.elapsed_ms = started.elapsed().as_millis();
        outcome
    }

    fn process_file_into(
        &self,
        outcome: &mut FileOutcome,
        category_name: &str,
        brand_code: &str,
        filename: &str,
        bytes: &[u8],
    ) {
        let category = match self.catalog.find(category_name) {
            Ok(category) => category,
            Err(err) => return outcome.fail(FailureReason::UnknownCategory, err.to_string()),
        };
        outcome.category = category.name.clone();
        let Some(result) = ingest_one(outcome, category, filename, bytes) else {
            return;
        };

        let load = self
            .coordinator()
            .load(category, &ImportBatch::new(brand_code, result.record));
        let failed = !load.success;
        let message = load.errors.join("; ");
        outcome.load = Some(load);
        if failed {
            outcome.fail(FailureReason::UploadFailed, message);
        } else {
            outcome.success = true;
            info!(
                "Imported '{filename}' for {} [{brand_code}]: {} row(s)",
                category.name, outcome.rows_parsed
            );
        }
    }

    /// Ingests every file of one category, drops the ones that fail, and
    /// loads the rest together (one merged record per brand).
    pub fn process_batch(&self, category_name: &str, files: &[InputFile]) -> BatchOutcome {
        let started = Instant::now();
        let mut outcome = BatchOutcome {
            category: category_name.to_string(),
            ..BatchOutcome::default()
        };
        self.process_batch_into(&mut outcome, category_name, files);
        outcome.elapsed_ms = started.elapsed().as_millis();
        outcome
    }

    fn process_batch_into(&self, outcome: &mut BatchOutcome, category_name: &str, files: &[InputFile]) {
        let category = match self.catalog.find(category_name) {
            Ok(category) => category,
            Err(err) => {
                error!("FAILED (UNKNOWN_CATEGORY) category={category_name}: {err}");
                outcome.failure_reason = Some(FailureReason::UnknownCategory);
                outcome.error = Some(err.to_string());
                return;
            }
        };
        outcome.category = category.name.clone();

        let mut by_brand: BTreeMap<String, Vec<NormalizedRecord>> = BTreeMap::new();
        for file in files {
            let mut file_outcome = FileOutcome::new(&category.name, &file.brand_code, &file.filename);
            if let Some(result) = ingest_one(&mut file_outcome, category, &file.filename, &file.bytes) {
                file_outcome.success = true;
                by_brand
                    .entry(file.brand_code.trim().to_string())
                    .or_default()
                    .push(result.record);
            }
            outcome.files.push(file_outcome);
        }
        outcome.files_succeeded = outcome.files.iter().filter(|f| f.success).count();
        outcome.files_failed = outcome.files.len() - outcome.files_succeeded;

        if by_brand.is_empty() {
            error!(
                "FAILED (ALL_FILES_FAILED) category={} files={}",
                category.name,
                files.len()
            );
            outcome.failure_reason = Some(FailureReason::AllFilesFailed);
            outcome.error = Some(format!("none of {} file(s) could be parsed", files.len()));
            return;
        }
        if outcome.files_failed > 0 {
            warn!(
                "{} of {} file(s) for {} were skipped",
                outcome.files_failed,
                files.len(),
                category.name
            );
        }

        let batches: Vec<ImportBatch> = by_brand
            .into_iter()
            .map(|(brand, records)| ImportBatch::new(brand, NormalizedRecord::merge(&records)))
            .collect();
        let load = self.coordinator().load_many(category, &batches);
        outcome.success = load.success;
        if !load.success {
            outcome.failure_reason = Some(FailureReason::UploadFailed);
            outcome.error = Some(load.errors.join("; "));
        }
        outcome.load = Some(load);
    }
}

/// Ingests a file into `outcome`; `None` when it is unusable.
fn ingest_one(
    outcome: &mut FileOutcome,
    category: &CategoryConfig,
    filename: &str,
    bytes: &[u8],
) -> Option<IngestResult> {
    match ingest::ingest_file(filename, bytes, Some(category)) {
        Ok(result) => {
            outcome.record_ingest(&result);
            if result.is_valid() {
                Some(result)
            } else {
                outcome.fail(
                    FailureReason::ParseFailed,
                    format!(
                        "no data rows after filtering ({} row(s), {} blank)",
                        result.total_rows, result.skipped_rows
                    ),
                );
                None
            }
        }
        Err(err) => {
            outcome.fail(FailureReason::ParseFailed, err.to_string());
            None
        }
    }
}
