pub mod cli;
pub mod config;
pub mod data;
pub mod ingest;
pub mod io_utils;
pub mod load;
pub mod mapping;
pub mod normalize;
pub mod pipeline;
pub mod preview;
pub mod provision;
pub mod retry;
pub mod warehouse;

use std::{env, path::Path, sync::Arc, sync::OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use crate::cli::{Cli, Commands};
use crate::config::{Catalog, Settings};
use crate::pipeline::{ImportContext, InputFile};
use crate::warehouse::DirectoryWarehouse;

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("marketload", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Categories(args) => handle_categories(&args),
        Commands::Ingest(args) => handle_ingest(&args),
        Commands::Load(args) => handle_load(&args),
        Commands::Batch(args) => handle_batch(&args),
    }
}

fn load_catalog(args: &cli::CatalogArgs) -> Result<Catalog> {
    let catalog = Catalog::load(&args.catalog)
        .with_context(|| format!("Loading catalog {:?}", args.catalog))?;
    debug!(
        "Catalog {:?} defines {} categor(ies)",
        args.catalog,
        catalog.categories.len()
    );
    Ok(catalog)
}

fn import_context(catalog_args: &cli::CatalogArgs, warehouse: &Path) -> Result<ImportContext> {
    let catalog = load_catalog(catalog_args)?;
    let settings = Settings::from_env().context("Reading MARKETLOAD_* settings")?;
    info!("Using warehouse directory {warehouse:?}");
    Ok(ImportContext::new(
        settings,
        catalog,
        Arc::new(DirectoryWarehouse::new(warehouse)),
    ))
}

fn input_name(path: &Path, override_name: Option<&str>) -> String {
    override_name
        .map(str::to_string)
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| path.display().to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Serializing outcome")?;
    println!("{rendered}");
    Ok(())
}

fn handle_categories(args: &cli::CategoriesArgs) -> Result<()> {
    let catalog = load_catalog(&args.catalog)?;
    let headers = ["name", "table", "mode", "dynamic", "headers", "rules"]
        .map(String::from)
        .to_vec();
    let rows = catalog
        .categories
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                c.table.clone(),
                c.load_mode.to_string(),
                c.dynamic_headers.to_string(),
                c.required_headers.len().to_string(),
                c.column_aliases.len().to_string(),
            ]
        })
        .collect();
    let record = ingest::NormalizedRecord::new(headers, rows);
    print!("{}", preview::render_record(&record, record.len()));
    Ok(())
}

fn handle_ingest(args: &cli::IngestArgs) -> Result<()> {
    let catalog = load_catalog(&args.catalog)?;
    let category = catalog.find(&args.category)?;
    let bytes = io_utils::read_input(&args.input)?;
    let filename = input_name(&args.input, args.filename.as_deref());
    let result = ingest::ingest_file(&filename, &bytes, Some(category))
        .with_context(|| format!("Ingesting {:?}", args.input))?;
    for warning in &result.errors {
        warn!("{warning}");
    }

    match &args.output {
        Some(path) => {
            let mut writer = io_utils::open_csv_writer(Some(path.as_path()))?;
            writer.write_record(result.record.headers())?;
            for row in result.record.rows() {
                writer.write_record(row)?;
            }
            writer.flush().context("Flushing output")?;
            info!(
                "Wrote {} normalized row(s) to {path:?}",
                result.record.len()
            );
        }
        None => print!("{}", preview::render_record(&result.record, args.preview)),
    }
    info!(
        "'{filename}': {} of {} row(s) kept, {} blank, mapped={}",
        result.record.len(),
        result.total_rows,
        result.skipped_rows,
        result.column_mapped
    );
    if !result.is_valid() {
        bail!("'{filename}' produced no data rows for {}", category.name);
    }
    Ok(())
}

fn handle_load(args: &cli::LoadArgs) -> Result<()> {
    let context = import_context(&args.catalog, &args.warehouse)?;
    let bytes = io_utils::read_input(&args.input)?;
    let filename = input_name(&args.input, None);
    let outcome = context.process_file(&args.category, &args.brand, &filename, &bytes);
    print_json(&outcome)?;
    if let Some(reason) = outcome.failure_reason {
        bail!("import of '{filename}' failed ({reason})");
    }
    Ok(())
}

fn handle_batch(args: &cli::BatchArgs) -> Result<()> {
    let context = import_context(&args.catalog, &args.warehouse)?;
    let files = args
        .files
        .iter()
        .map(|(brand, path)| {
            Ok(InputFile {
                brand_code: brand.clone(),
                filename: input_name(path, None),
                bytes: io_utils::read_input(path)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let outcome = context.process_batch(&args.category, &files);
    print_json(&outcome)?;
    if let Some(reason) = outcome.failure_reason {
        bail!("batch for '{}' failed ({reason})", args.category);
    }
    Ok(())
}
