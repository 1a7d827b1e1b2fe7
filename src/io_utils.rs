//! Byte-level input handling and CSV reader/writer construction.
//!
//! - **Decoding**: delimited text is tried as UTF-8 (a leading BOM is
//!   dropped) and falls back to Windows-1252, which covers Latin-1 exports.
//! - **Delimiters**: `.tsv` files are tab-separated, everything else uses a
//!   comma.
//! - **stdin/stdout**: the `-` path convention routes through standard streams.

use std::{
    fs::File,
    io::{self, BufWriter, Read, Write},
    path::Path,
};

use anyhow::{Context, Result};
use csv::QuoteStyle;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use thiserror::Error;

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input contains NUL bytes and does not look like text")]
    Binary,
}

/// Text decoded from raw bytes along with the encoding that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    pub text: String,
    pub encoding: &'static Encoding,
}

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn resolve_delimiter(filename: &str) -> u8 {
    match file_extension(filename).as_deref() {
        Some("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    }
}

/// Reads a whole input into memory; `-` reads stdin.
pub fn read_input(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    if is_dash(path) {
        io::stdin()
            .lock()
            .read_to_end(&mut bytes)
            .context("Reading stdin")?;
    } else {
        File::open(path)
            .with_context(|| format!("Opening input file {path:?}"))?
            .read_to_end(&mut bytes)
            .with_context(|| format!("Reading input file {path:?}"))?;
    }
    Ok(bytes)
}

pub fn decode_text(bytes: &[u8]) -> Result<DecodedText, DecodeError> {
    if bytes.contains(&0) {
        return Err(DecodeError::Binary);
    }
    let (text, had_errors) = UTF_8.decode_with_bom_removal(bytes);
    if !had_errors {
        return Ok(DecodedText {
            text: text.into_owned(),
            encoding: UTF_8,
        });
    }
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    Ok(DecodedText {
        text: text.into_owned(),
        encoding: WINDOWS_1252,
    })
}

/// Header-less, ragged-row tolerant reader; the ingestor locates the header
/// row itself.
pub fn open_csv_reader<R>(reader: R, delimiter: u8) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub fn csv_writer<W: Write>(writer: W, delimiter: u8) -> csv::Writer<W> {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(delimiter)
        .quote_style(QuoteStyle::Necessary)
        .double_quote(true);
    builder.from_writer(writer)
}

pub fn open_csv_writer(path: Option<&Path>) -> Result<csv::Writer<Box<dyn Write>>> {
    let (base, delimiter): (Box<dyn Write>, u8) = match path {
        Some(p) if !is_dash(p) => (
            Box::new(BufWriter::new(
                File::create(p).with_context(|| format!("Creating output file {p:?}"))?,
            )),
            resolve_delimiter(&p.to_string_lossy()),
        ),
        _ => (Box::new(io::stdout()), DEFAULT_CSV_DELIMITER),
    };
    Ok(csv_writer(base, delimiter))
}
