//! Cell normalization: best-effort locale-aware number parsing plus the plain
//! string form every value takes on its way into the all-text destination.
//!
//! Parsing never fails loudly. Anything that cannot be read as a number
//! yields `None`, which callers treat as "skip this value".
//!
//! ## Separator heuristics
//!
//! Marketplace exports mix Indonesian (`1.234.567,89`) and English
//! (`1,234,567.89`) conventions. The order of checks is significant:
//!
//! 1. More than one `.`, or a `.` that precedes the last `,`: dots are
//!    thousands separators and the comma is the decimal point.
//! 2. Both separators with the comma first: commas are thousands separators.
//! 3. Several commas and no dot: commas are thousands separators.
//! 4. A single comma followed by exactly three digits is a thousands
//!    separator, otherwise it is the decimal point.

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

use crate::data::Cell;

const NULL_SENTINELS: &[&str] = &["-", "\u{2014}", "\u{2013}", "N/A", "n/a", "#N/A"];
const CURRENCY_SYMBOLS: &[char] = &['$', '\u{20AC}', '\u{00A3}', '\u{00A5}'];
const RUPIAH_MARKERS: &[&str] = &["Rp", "RP", "rp"];

/// Tokens that stand for "no value" in marketplace exports.
pub fn is_null_sentinel(value: &str) -> bool {
    NULL_SENTINELS.contains(&value.trim())
}

/// Parses a cell into a decimal value.
///
/// Numeric cells pass through unchanged. Blank cells, null sentinels and
/// anything unparseable return `None`; zero is never substituted.
pub fn parse_number(cell: &Cell) -> Option<Decimal> {
    match cell {
        Cell::Empty | Cell::Boolean(_) | Cell::DateTime(_) => None,
        Cell::Integer(value) => Some(Decimal::from(*value)),
        Cell::Float(value) => {
            if !value.is_finite() {
                return None;
            }
            Decimal::from_str(&value.to_string())
                .ok()
                .or_else(|| Decimal::from_f64(*value))
        }
        Cell::Text(text) => parse_number_str(text),
    }
}

pub fn parse_number_str(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || is_null_sentinel(trimmed) {
        return None;
    }

    let mut body = strip_currency(trimmed);
    let mut negative = false;
    if body.len() > 2 && body.starts_with('(') && body.ends_with(')') {
        negative = true;
        body = body[1..body.len() - 1].to_string();
    }

    let is_percentage = body.contains('%');
    if is_percentage {
        body = body.replace('%', "");
    }
    if body.is_empty() {
        return None;
    }

    let canonical = canonicalize_separators(&body)?;
    let mut value = Decimal::from_str(&canonical)
        .or_else(|_| Decimal::from_scientific(&canonical))
        .ok()?;
    if is_percentage {
        value = value.checked_div(Decimal::ONE_HUNDRED)?;
    }
    if negative {
        value = -value;
    }
    Some(value.normalize())
}

/// Renders a parsed number: whole values without a fractional part,
/// everything else with trailing zeros removed.
pub fn format_number(value: Decimal) -> String {
    if value.is_zero() {
        return "0".to_string();
    }
    let normalized = value.normalize();
    if normalized.fract().is_zero() {
        normalized.trunc().to_string()
    } else {
        normalized.to_string()
    }
}

/// The string every stored value goes through: stringify and trim.
///
/// No type coercion happens here; sentinel tokens such as `-` survive.
pub fn normalize_cell(cell: &Cell) -> String {
    match cell {
        Cell::Empty => String::new(),
        Cell::Text(text) => text.trim().to_string(),
        other => other.as_display().trim().to_string(),
    }
}

fn strip_currency(value: &str) -> String {
    let mut stripped = value.to_string();
    for marker in RUPIAH_MARKERS {
        stripped = stripped.replace(marker, "");
    }
    stripped
        .chars()
        .filter(|ch| !ch.is_whitespace() && !CURRENCY_SYMBOLS.contains(ch))
        .collect()
}

fn canonicalize_separators(body: &str) -> Option<String> {
    let dots = body.matches('.').count();
    let commas = body.matches(',').count();
    let dot_before_comma = match (body.rfind('.'), body.rfind(',')) {
        (Some(dot), Some(comma)) => dot < comma,
        _ => false,
    };

    if dots > 1 || (dots == 1 && commas >= 1 && dot_before_comma) {
        return Some(drop_grouping(body, '.')?.replace(',', "."));
    }
    if commas == 0 {
        return Some(body.to_string());
    }
    if dots == 1 || commas > 1 {
        return drop_grouping(body, ',');
    }

    let fraction = body.rsplit(',').next().unwrap_or_default();
    if fraction.len() == 3 && fraction.chars().all(|c| c.is_ascii_digit()) {
        drop_grouping(body, ',')
    } else {
        Some(body.replace(',', "."))
    }
}

/// Removes a thousands separator; every group around it must be non-empty.
fn drop_grouping(body: &str, separator: char) -> Option<String> {
    if body.split(separator).any(str::is_empty) {
        return None;
    }
    Some(body.replace(separator, ""))
}
