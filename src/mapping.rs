//! Column mapping engine.
//!
//! Reconciles an arbitrary source header row with a category's canonical
//! header list. The mapping is planned once per file ([`ColumnMapper::plan`])
//! and the resulting [`ColumnMapping`] projects every row without repeating
//! any header matching.
//!
//! ## Claim order
//!
//! Output headers are the canonical headers in configured order followed by
//! newly discovered dynamic headers. Each output header, in that order:
//!
//! 1. claims the leftmost unclaimed source column with the same normalized
//!    name, or
//! 2. falls back to its [`ColumnRule`]: `CoalesceExact` and
//!    `CoalesceStartsWith` claim the first alias that still has an unclaimed
//!    column, `SumStartsWith` reads every matching column of the untouched
//!    index and claims nothing, or
//! 3. stays unmatched and projects to an empty string.
//!
//! A claimed column is never handed to a later header in the same pass.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use log::{debug, info, warn};
use regex::Regex;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::CategoryConfig;
use crate::data::Cell;
use crate::normalize::{format_number, normalize_cell, parse_number};

/// Numbered name/image pairs beyond this count are ignored.
pub const MAX_DYNAMIC_PAIRS: usize = 15;

/// Trailing marker that turns an alias into a prefix pattern.
pub const PREFIX_WILDCARD: char = '*';

const SPECIAL_HEADER_MARKERS: &[&str] = &["foto panduan ukuran", "size guide"];

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("column rule for '{header}' has no aliases")]
    NoAliases { header: String },
    #[error("column rule for '{header}' contains an empty alias pattern")]
    EmptyPattern { header: String },
    #[error("dynamic header pattern is invalid: {0}")]
    Pattern(String),
}

/// Case-folds and trims a header. Every header comparison goes through here.
pub fn normalize_header(header: &str) -> String {
    header.to_lowercase().trim().to_string()
}

/// Normalized header text mapped to the source positions that carry it,
/// leftmost first. Keys keep first-appearance order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHeaderIndex {
    keys: Vec<String>,
    positions: HashMap<String, VecDeque<usize>>,
}

impl SourceHeaderIndex {
    pub fn build<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut index = Self::default();
        for (idx, header) in headers.iter().enumerate() {
            let key = normalize_header(header.as_ref());
            if key.is_empty() {
                continue;
            }
            index
                .positions
                .entry(key.clone())
                .or_insert_with(|| {
                    index.keys.push(key);
                    VecDeque::new()
                })
                .push_back(idx);
        }
        index
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Positions still available under `key` (already normalized).
    pub fn positions(&self, key: &str) -> Vec<usize> {
        self.positions
            .get(key)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn unclaimed(&self) -> usize {
        self.positions.values().map(VecDeque::len).sum()
    }

    /// Removes and returns the leftmost position under `key`.
    pub fn claim(&mut self, key: &str) -> Option<usize> {
        self.positions.get_mut(key)?.pop_front()
    }

    /// Claims from the first key (in source order) that starts with `prefix`
    /// and still has an unclaimed position.
    pub fn claim_prefix(&mut self, prefix: &str) -> Option<usize> {
        let key = self.keys.iter().find(|key| {
            key.starts_with(prefix)
                && self
                    .positions
                    .get(key.as_str())
                    .is_some_and(|p| !p.is_empty())
        })?;
        self.positions.get_mut(key.as_str())?.pop_front()
    }

    /// Every position under every key starting with `prefix`, key order first.
    pub fn prefix_positions(&self, prefix: &str) -> Vec<usize> {
        self.keys
            .iter()
            .filter(|key| key.starts_with(prefix))
            .flat_map(|key| self.positions(key))
            .collect()
    }
}

/// How a canonical header is filled when no source column carries its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRule {
    DirectMatch,
    CoalesceExact { aliases: Vec<String> },
    CoalesceStartsWith { prefixes: Vec<String> },
    SumStartsWith { prefixes: Vec<String> },
}

impl ColumnRule {
    /// Compiles configured alias strings for `header`.
    ///
    /// Aliases ending in `*` are prefixes. Prefix aliases sum when the header
    /// name mentions `sum` or `total` and coalesce otherwise. Exact aliases
    /// win over prefixes when a header mixes both.
    pub fn from_aliases<S: AsRef<str>>(header: &str, aliases: &[S]) -> Result<Self, MappingError> {
        if aliases.is_empty() {
            return Err(MappingError::NoAliases {
                header: header.to_string(),
            });
        }
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        for alias in aliases {
            let alias = alias.as_ref().trim();
            let (pattern, target) = match alias.strip_suffix(PREFIX_WILDCARD) {
                Some(prefix) => (normalize_header(prefix), &mut prefixes),
                None => (normalize_header(alias), &mut exact),
            };
            if pattern.is_empty() {
                return Err(MappingError::EmptyPattern {
                    header: header.to_string(),
                });
            }
            target.push(pattern);
        }

        if !exact.is_empty() {
            if !prefixes.is_empty() {
                warn!(
                    "Column '{header}' mixes exact and prefix aliases; prefix aliases {prefixes:?} are ignored"
                );
            }
            return Ok(ColumnRule::CoalesceExact { aliases: exact });
        }
        let lowered = header.to_lowercase();
        if lowered.contains("sum") || lowered.contains("total") {
            Ok(ColumnRule::SumStartsWith { prefixes })
        } else {
            Ok(ColumnRule::CoalesceStartsWith { prefixes })
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ColumnRule::DirectMatch => "DIRECT_MATCH",
            ColumnRule::CoalesceExact { .. } => "COALESCE_EXACT",
            ColumnRule::CoalesceStartsWith { .. } => "COALESCE_STARTS_WITH",
            ColumnRule::SumStartsWith { .. } => "SUM_STARTS_WITH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    Column(usize),
    Sum { columns: Vec<usize> },
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedColumn {
    pub header: String,
    pub source: ColumnSource,
}

/// The per-file projection produced by [`ColumnMapper::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    columns: Vec<MappedColumn>,
}

impl ColumnMapping {
    pub fn columns(&self) -> &[MappedColumn] {
        &self.columns
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.header.clone()).collect()
    }

    pub fn resolved_count(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| !matches!(c.source, ColumnSource::Unmatched))
            .count()
    }

    /// Source positions claimed by direct matches and coalesce rules.
    pub fn claimed_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .filter_map(|c| match c.source {
                ColumnSource::Column(idx) => Some(idx),
                _ => None,
            })
            .collect()
    }

    pub fn project(&self, row: &[Cell]) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| match &column.source {
                ColumnSource::Column(idx) => row.get(*idx).map(normalize_cell).unwrap_or_default(),
                ColumnSource::Sum { columns } => sum_cells(row, columns),
                ColumnSource::Unmatched => String::new(),
            })
            .collect()
    }
}

fn sum_cells(row: &[Cell], columns: &[usize]) -> String {
    let mut total = Decimal::ZERO;
    let mut contributed = false;
    for value in columns.iter().filter_map(|idx| row.get(*idx).and_then(parse_number)) {
        match total.checked_add(value) {
            Some(next) => {
                total = next;
                contributed = true;
            }
            None => {
                warn!("Sum over columns {columns:?} overflows; leaving the total empty");
                return String::new();
            }
        }
    }
    if contributed {
        format_number(total)
    } else {
        String::new()
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMapper {
    canonical_headers: Vec<String>,
    rules: HashMap<String, ColumnRule>,
    include_dynamic: bool,
}

impl ColumnMapper {
    pub fn new(canonical_headers: Vec<String>, include_dynamic: bool) -> Self {
        Self {
            canonical_headers,
            rules: HashMap::new(),
            include_dynamic,
        }
    }

    pub fn with_rule(mut self, header: &str, rule: ColumnRule) -> Self {
        self.rules.insert(normalize_header(header), rule);
        self
    }

    pub fn for_category(category: &CategoryConfig) -> Result<Self, MappingError> {
        let mut mapper = Self::new(category.required_headers.clone(), category.dynamic_headers);
        for (header, aliases) in &category.column_aliases {
            let rule = ColumnRule::from_aliases(header, aliases)?;
            debug!(
                "Column '{header}' uses {} with {} alias(es)",
                rule.action(),
                aliases.len()
            );
            mapper = mapper.with_rule(header, rule);
        }
        Ok(mapper)
    }

    pub fn canonical_headers(&self) -> &[String] {
        &self.canonical_headers
    }

    pub fn rule(&self, header: &str) -> Option<&ColumnRule> {
        self.rules.get(&normalize_header(header))
    }

    /// Resolves every output header against `source_headers` once.
    pub fn plan<S: AsRef<str>>(&self, source_headers: &[S]) -> Result<ColumnMapping, MappingError> {
        let index = SourceHeaderIndex::build(source_headers);
        let mut output = self.canonical_headers.clone();
        if self.include_dynamic {
            let mut seen: HashSet<String> = output.iter().map(|h| normalize_header(h)).collect();
            for header in detect_dynamic_headers(source_headers)? {
                if seen.insert(normalize_header(&header)) {
                    output.push(header);
                }
            }
        }

        let mut working = index.clone();
        let columns = output
            .into_iter()
            .map(|header| {
                let source = self.resolve(&header, &index, &mut working);
                MappedColumn { header, source }
            })
            .collect();
        Ok(ColumnMapping { columns })
    }

    /// Plans the mapping and projects every row through it.
    pub fn map_rows<S: AsRef<str>>(
        &self,
        source_headers: &[S],
        rows: &[Vec<Cell>],
    ) -> Result<(Vec<String>, Vec<Vec<String>>), MappingError> {
        let mapping = self.plan(source_headers)?;
        info!(
            "Column mapping: {}/{} header(s) resolved from {} source column(s)",
            mapping.resolved_count(),
            mapping.columns().len(),
            source_headers.len()
        );
        let projected = rows.iter().map(|row| mapping.project(row)).collect();
        Ok((mapping.headers(), projected))
    }

    fn resolve(
        &self,
        header: &str,
        index: &SourceHeaderIndex,
        working: &mut SourceHeaderIndex,
    ) -> ColumnSource {
        let key = normalize_header(header);
        if let Some(idx) = working.claim(&key) {
            return ColumnSource::Column(idx);
        }
        let claimed = match self.rules.get(&key) {
            Some(ColumnRule::CoalesceExact { aliases }) => {
                aliases.iter().find_map(|alias| working.claim(alias))
            }
            Some(ColumnRule::CoalesceStartsWith { prefixes }) => {
                prefixes.iter().find_map(|prefix| working.claim_prefix(prefix))
            }
            Some(ColumnRule::SumStartsWith { prefixes }) => {
                let columns = prefixes
                    .iter()
                    .flat_map(|prefix| index.prefix_positions(prefix))
                    .collect();
                return ColumnSource::Sum { columns };
            }
            Some(ColumnRule::DirectMatch) | None => None,
        };
        claimed.map_or(ColumnSource::Unmatched, ColumnSource::Column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairSlot {
    Name,
    Image,
}

fn dynamic_patterns() -> Result<&'static [(Regex, PairSlot)], MappingError> {
    static PATTERNS: OnceLock<Result<Vec<(Regex, PairSlot)>, regex::Error>> = OnceLock::new();
    let compiled = PATTERNS.get_or_init(|| {
        [
            (r"nama\s*variasi\s*(\d+)", PairSlot::Name),
            (r"foto\s*variasi\s*(\d+)", PairSlot::Image),
            (r"option\s*(\d+)\s*name", PairSlot::Name),
            (r"option\s*(\d+)\s*image", PairSlot::Image),
            (r"^name\s*(\d+)$", PairSlot::Name),
            (r"^image\s*(\d+)$", PairSlot::Image),
        ]
        .into_iter()
        .map(|(pattern, slot)| Regex::new(pattern).map(|re| (re, slot)))
        .collect()
    });
    compiled
        .as_deref()
        .map_err(|err| MappingError::Pattern(err.to_string()))
}

/// Finds repeating name/image header families outside the canonical schema.
///
/// Returns the special size-guide header first (if any), then name/image
/// pairs by ascending number, capped at [`MAX_DYNAMIC_PAIRS`] numbers. A
/// number with only one side present still contributes that side. When two
/// headers share a number and side, the later one is kept.
pub fn detect_dynamic_headers<S: AsRef<str>>(headers: &[S]) -> Result<Vec<String>, MappingError> {
    let patterns = dynamic_patterns()?;
    let mut special: Option<String> = None;
    let mut names: BTreeMap<u32, String> = BTreeMap::new();
    let mut images: BTreeMap<u32, String> = BTreeMap::new();

    for header in headers {
        let raw = header.as_ref();
        let key = normalize_header(raw);
        if key.is_empty() {
            continue;
        }
        if SPECIAL_HEADER_MARKERS.iter().any(|marker| key.contains(marker)) {
            special.get_or_insert_with(|| raw.to_string());
            continue;
        }
        let matched = patterns.iter().find_map(|(re, slot)| {
            let number = re.captures(&key)?.get(1)?.as_str().parse::<u32>().ok()?;
            Some((number, *slot))
        });
        match matched {
            Some((number, PairSlot::Name)) => {
                names.insert(number, raw.to_string());
            }
            Some((number, PairSlot::Image)) => {
                images.insert(number, raw.to_string());
            }
            None => {}
        }
    }

    let numbers: BTreeSet<u32> = names.keys().chain(images.keys()).copied().collect();
    let mut detected: Vec<String> = special.into_iter().collect();
    for number in numbers.into_iter().take(MAX_DYNAMIC_PAIRS) {
        detected.extend(names.remove(&number));
        detected.extend(images.remove(&number));
    }
    Ok(detected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::text_row;

    #[test]
    fn index_keeps_duplicate_positions_in_order() {
        let index = SourceHeaderIndex::build(&["SKU", " sku ", "Name", ""]);
        assert_eq!(index.positions("sku"), vec![0, 1]);
        assert_eq!(index.keys().collect::<Vec<_>>(), vec!["sku", "name"]);
        assert_eq!(index.unclaimed(), 3);
    }

    #[test]
    fn claim_prefix_follows_source_order() {
        let mut index = SourceHeaderIndex::build(&["Stock B", "Stock A", "Other"]);
        assert_eq!(index.claim_prefix("stock"), Some(0));
        assert_eq!(index.claim_prefix("stock"), Some(1));
        assert_eq!(index.claim_prefix("stock"), None);
    }

    #[test]
    fn rule_compilation_classifies_aliases() {
        let rule = ColumnRule::from_aliases("Total Qty", &["Qty*"]).unwrap();
        assert_eq!(
            rule,
            ColumnRule::SumStartsWith {
                prefixes: vec!["qty".to_string()]
            }
        );

        let rule = ColumnRule::from_aliases("Stock", &["Stok*", "Qty*"]).unwrap();
        assert_eq!(rule.action(), "COALESCE_STARTS_WITH");

        let rule = ColumnRule::from_aliases("Price", &["Harga", "Price*"]).unwrap();
        assert_eq!(
            rule,
            ColumnRule::CoalesceExact {
                aliases: vec!["harga".to_string()]
            }
        );
    }

    #[test]
    fn malformed_rules_are_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            ColumnRule::from_aliases("Price", &empty),
            Err(MappingError::NoAliases { .. })
        ));
        assert!(matches!(
            ColumnRule::from_aliases("Price", &[" * "]),
            Err(MappingError::EmptyPattern { .. })
        ));
    }

    #[test]
    fn sum_skips_sentinels_and_unparseable_cells() {
        let row = text_row(["10", "-", "abc", "2,5"]);
        assert_eq!(sum_cells(&row, &[0, 1, 2, 3]), "12.5");
        assert_eq!(sum_cells(&row, &[1, 2]), "");
        assert_eq!(sum_cells(&row, &[9]), "");
    }

    #[test]
    fn sum_overflow_leaves_the_total_empty() {
        let row = vec![
            Cell::text(Decimal::MAX.to_string()),
            Cell::text(Decimal::MAX.to_string()),
            Cell::text("1"),
        ];
        assert_eq!(sum_cells(&row, &[0, 1, 2]), "");
        assert_eq!(sum_cells(&row, &[0]), format_number(Decimal::MAX));
    }

    #[test]
    fn later_header_wins_for_a_repeated_number() {
        let detected = detect_dynamic_headers(&["Nama Variasi 1", "Option 1 Name", "Foto Variasi 1"]).unwrap();
        assert_eq!(detected, vec!["Option 1 Name", "Foto Variasi 1"]);
    }

    #[test]
    fn dynamic_detection_caps_pairs() {
        let headers: Vec<String> = (1..=20).map(|n| format!("Nama Variasi {n}")).collect();
        let detected = detect_dynamic_headers(&headers).unwrap();
        assert_eq!(detected.len(), MAX_DYNAMIC_PAIRS);
        assert_eq!(detected.last().map(String::as_str), Some("Nama Variasi 15"));
    }
}
