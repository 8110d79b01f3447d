//! Reference range harvesting
//!
//! Reports print their own reference interval next to each result, as in
//! `GLICOSE  95 mg/dL  70 a 99 mg/dL`. Harvesting collects those intervals
//! across a directory of reports, keeps the most frequent one per test, and
//! merges them into a flat reference table that the loader accepts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{LabError, Result};
use crate::pipeline::ingestion::{discover_documents, open_document, source_file_name};
use crate::pipeline::processing::aggregate::SkipRecord;

static RANGE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+[.,]?\d*)\s*a\s*(\d+[.,]?\d*)").expect("range pattern is a valid regex")
});
static COLUMN_GAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s{2,}").expect("column gap pattern is a valid regex"));
static UNIT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s\d]\S*").expect("unit token pattern is a valid regex"));
static NUMERIC_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\d,.]+$").expect("numeric token pattern is a valid regex"));

/// One printed interval, bounds rounded to two decimals
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestedRange {
    pub test_name: String,
    pub min: f64,
    pub max: f64,
    /// Empty when nothing follows the interval
    pub unit: String,
}

fn parse_bound(raw: &str) -> Option<f64> {
    let value: f64 = raw.replace(',', ".").parse().ok()?;
    Some((value * 100.0).round() / 100.0)
}

/// Token right after the interval, unless it starts with a digit. A token of
/// separators and digits only (`,0` left over from `14,5,0`) marks a
/// percentage.
fn unit_after(tail: &str) -> String {
    match UNIT_TOKEN.find(tail.trim()) {
        Some(token) if NUMERIC_TOKEN.is_match(token.as_str()) => "%".to_string(),
        Some(token) => token.as_str().to_string(),
        None => String::new(),
    }
}

/// Text before the interval up to the first column gap or the first number,
/// whichever comes first, upper-cased.
fn test_name_before(head: &str) -> String {
    let column = COLUMN_GAP.split(head.trim_end()).next().unwrap_or_default();
    column
        .split_whitespace()
        .take_while(|token| !NUMERIC_TOKEN.is_match(token))
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Every `<min> a <max>` interval in `text`, at most one per line. Lines
/// whose name part is empty or ends in a colon are label lines such as
/// `Valor de referência: 70 a 99` and are ignored.
pub fn extract_ranges(text: &str) -> Vec<HarvestedRange> {
    let mut found = Vec::new();
    for line in text.lines() {
        if !line.contains(" a ") {
            continue;
        }
        let Some(caps) = RANGE_PATTERN.captures(line) else {
            continue;
        };
        let (Some(whole), Some(min), Some(max)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let (Some(min), Some(max)) = (parse_bound(min.as_str()), parse_bound(max.as_str())) else {
            continue;
        };

        let test_name = test_name_before(&line[..whole.start()]);
        if test_name.is_empty() || test_name.ends_with(':') {
            continue;
        }
        found.push(HarvestedRange {
            test_name,
            min,
            max,
            unit: unit_after(&line[whole.end()..]),
        });
    }
    found
}

/// Occurrence counts per test, candidates kept in first-seen order
#[derive(Debug, Default)]
pub struct RangeTally {
    candidates: BTreeMap<String, Vec<(HarvestedRange, usize)>>,
}

impl RangeTally {
    pub fn add(&mut self, range: HarvestedRange) {
        let seen = self.candidates.entry(range.test_name.clone()).or_default();
        match seen.iter_mut().find(|(r, _)| *r == range) {
            Some((_, count)) => *count += 1,
            None => seen.push((range, 1)),
        }
    }

    pub fn extend(&mut self, ranges: impl IntoIterator<Item = HarvestedRange>) {
        for range in ranges {
            self.add(range);
        }
    }

    /// Most frequent interval per test, sorted by test name. Ties go to the
    /// interval seen first.
    pub fn most_common(&self) -> Vec<HarvestedRange> {
        self.candidates
            .values()
            .filter_map(|seen| {
                seen.iter()
                    .fold(None, |best: Option<&(HarvestedRange, usize)>, candidate| match best {
                        Some(b) if b.1 >= candidate.1 => Some(b),
                        _ => Some(candidate),
                    })
                    .map(|(range, _)| range.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Outcome of harvesting a directory
#[derive(Debug, Default)]
pub struct Harvest {
    pub documents: usize,
    pub ranges: Vec<HarvestedRange>,
    pub skipped: Vec<SkipRecord>,
}

/// Harvest every supported document in `input_dir`. Unreadable documents
/// are logged and skipped.
pub fn harvest_dir(input_dir: &Path) -> Result<Harvest> {
    let paths = discover_documents(input_dir)?;
    let mut tally = RangeTally::default();
    let mut harvest = Harvest {
        documents: paths.len(),
        ..Harvest::default()
    };

    for path in paths {
        let source_file = source_file_name(&path);
        match open_document(&path) {
            Ok(document) => {
                let ranges = extract_ranges(&document.pages.into_text());
                debug!(file = %source_file, intervals = ranges.len(), "Harvested document");
                tally.extend(ranges);
            }
            Err(e) => {
                warn!(file = %source_file, "Skipping document: {}", e);
                harvest.skipped.push(SkipRecord::from_error(&source_file, &e));
            }
        }
    }

    harvest.ranges = tally.most_common();
    info!(
        documents = harvest.documents,
        tests = harvest.ranges.len(),
        skipped = harvest.skipped.len(),
        "Harvest finished"
    );
    Ok(harvest)
}

/// Flat reference table entries, `[name, {ref_min, ref_max, unit}]`
pub type FlatEntries = Vec<(String, Map<String, Value>)>;

/// Read a flat-list reference table, keeping every field of each entry
pub fn read_flat_entries(path: &Path) -> Result<FlatEntries> {
    let content = fs::read_to_string(path).map_err(|e| {
        LabError::Config(format!("Failed to read base table '{}': {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        LabError::RuleSchema(format!(
            "base table '{}' is not a list of [name, info] pairs: {}",
            path.display(),
            e
        ))
    })
}

/// Overlay harvested intervals on `base`. Names are upper-cased; an
/// existing entry keeps its other fields and gets new bounds and unit. The
/// result is sorted by name.
pub fn merge_ranges(base: FlatEntries, harvested: &[HarvestedRange]) -> FlatEntries {
    let mut merged: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for (name, info) in base {
        merged.insert(name.to_uppercase(), info);
    }

    for range in harvested {
        let info = merged.entry(range.test_name.clone()).or_default();
        info.insert("ref_min".to_string(), Value::from(range.min));
        info.insert("ref_max".to_string(), Value::from(range.max));
        if range.unit.is_empty() {
            info.remove("unit");
        } else {
            info.insert("unit".to_string(), Value::from(range.unit.clone()));
        }
    }

    merged.into_iter().collect()
}

pub fn write_flat_entries(path: &Path, entries: &FlatEntries) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(entries)?)?;
    info!(path = %path.display(), tests = entries.len(), "Wrote harvested reference table");
    Ok(())
}
