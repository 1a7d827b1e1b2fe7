use std::fmt::Write as _;

use crate::ingest::NormalizedRecord;

/// Cells wider than this are cut and marked with `~`.
pub const MAX_CELL_WIDTH: usize = 40;

/// Renders the first `limit` rows of `record` as an aligned text table with
/// a leading row-number column.
pub fn render_record(record: &NormalizedRecord, limit: usize) -> String {
    let mut headers = vec!["#".to_string()];
    headers.extend(record.headers().iter().map(|h| clip(h)));
    let rows: Vec<Vec<String>> = record
        .rows()
        .iter()
        .take(limit)
        .enumerate()
        .map(|(idx, row)| {
            let mut line = vec![(idx + 1).to_string()];
            line.extend(row.iter().map(|v| clip(v)));
            line
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (width, value) in widths.iter_mut().zip(row) {
            *width = (*width).max(value.chars().count());
        }
    }

    let mut out = String::new();
    push_line(&mut out, &headers, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_line(&mut out, &rule, &widths);
    for row in &rows {
        push_line(&mut out, row, &widths);
    }
    if record.len() > limit {
        let _ = writeln!(out, "... {} more row(s)", record.len() - limit);
    }
    out
}

fn clip(value: &str) -> String {
    let flat: String = value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if flat.chars().count() <= MAX_CELL_WIDTH {
        flat
    } else {
        let mut cut: String = flat.chars().take(MAX_CELL_WIDTH - 1).collect();
        cut.push('~');
        cut
    }
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join(" | ");
    let _ = writeln!(out, "{}", line.trim_end());
}
