use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Normalize marketplace exports and load them into category tables",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List the categories defined in a catalog
    Categories(CategoriesArgs),
    /// Normalize one file for a category without loading it
    Ingest(IngestArgs),
    /// Normalize one file and load it for a brand
    Load(LoadArgs),
    /// Normalize several files of one category and load them together
    Batch(BatchArgs),
}

#[derive(Debug, Args)]
pub struct CatalogArgs {
    /// YAML catalog describing categories, headers and aliases
    #[arg(short = 'c', long)]
    pub catalog: PathBuf,
}

#[derive(Debug, Args)]
pub struct CategoriesArgs {
    #[command(flatten)]
    pub catalog: CatalogArgs,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[command(flatten)]
    pub catalog: CatalogArgs,
    /// Category name as listed in the catalog
    #[arg(short = 'k', long)]
    pub category: String,
    /// Input file (csv, tsv, xlsx, xls, xlsb, ods); '-' reads stdin
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Name used for format detection when reading stdin
    #[arg(long)]
    pub filename: Option<String>,
    /// Write the normalized rows to this CSV file ('-' for stdout)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
    /// Number of rows to preview
    #[arg(long, default_value_t = 10)]
    pub preview: usize,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[command(flatten)]
    pub catalog: CatalogArgs,
    #[arg(short = 'k', long)]
    pub category: String,
    /// Brand code the rows belong to
    #[arg(short = 'b', long)]
    pub brand: String,
    /// Directory holding the destination warehouse
    #[arg(short = 'w', long)]
    pub warehouse: PathBuf,
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    #[command(flatten)]
    pub catalog: CatalogArgs,
    #[arg(short = 'k', long)]
    pub category: String,
    #[arg(short = 'w', long)]
    pub warehouse: PathBuf,
    /// Repeatable BRAND=PATH pairs
    #[arg(short = 'f', long = "file", value_parser = parse_brand_file, required = true)]
    pub files: Vec<(String, PathBuf)>,
}

pub fn parse_brand_file(value: &str) -> Result<(String, PathBuf), String> {
    let (brand, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected BRAND=PATH, got '{value}'"))?;
    let brand = brand.trim();
    let path = path.trim();
    if brand.is_empty() || path.is_empty() {
        return Err(format!("expected BRAND=PATH, got '{value}'"));
    }
    Ok((brand.to_string(), PathBuf::from(path)))
}
