use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A single raw cell as read from a delimited-text file or a spreadsheet.
///
/// Cells keep the type the source gave them: CSV input is always `Text`,
/// spreadsheets may hand back numbers, booleans and datetimes. Nothing here
/// guesses types; numeric interpretation lives in [`crate::normalize`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    DateTime(NaiveDateTime),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// True for `Empty` and for text made only of whitespace.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_display(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Integer(i) => i.to_string(),
            Cell::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            Cell::Boolean(b) => b.to_string(),
            Cell::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Integer(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

/// Builds a row of text cells; handy for CSV input and tests.
pub fn text_row<I, S>(values: I) -> Vec<Cell>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(|v| Cell::Text(v.into())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn display_drops_fraction_for_whole_floats() {
        assert_eq!(Cell::Float(12.0).as_display(), "12");
        assert_eq!(Cell::Float(12.5).as_display(), "12.5");
        assert_eq!(Cell::Integer(-3).as_display(), "-3");
    }

    #[test]
    fn display_formats_datetimes() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(Cell::DateTime(dt).as_display(), "2024-01-15 08:30:00");
    }

    #[test]
    fn blank_detection_covers_whitespace_text() {
        assert!(Cell::Empty.is_blank());
        assert!(Cell::text("  \t").is_blank());
        assert!(!Cell::text(" - ").is_blank());
        assert!(!Cell::Integer(0).is_blank());
    }
}
