//! Strips identity, institutional header and signature noise from report text
//! before test extraction.

use regex::{Regex, RegexSet, RegexSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::AnonymizerConfig;
use crate::error::Result;
use crate::pipeline::ingestion::{discover_documents, open_document, source_file_name};
use crate::pipeline::processing::aggregate::SkipRecord;
use crate::pipeline::processing::patient::IDENTITY_PATTERN;

/// Outcome of exporting anonymized text for a directory
#[derive(Debug, Default)]
pub struct ExportSummary {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<SkipRecord>,
}

/// Write `<out_dir>/<stem>.txt` with the anonymized text of every document in
/// `input_dir`. Unreadable documents are logged and skipped.
pub fn export_anonymized(anonymizer: &Anonymizer, input_dir: &Path, out_dir: &Path) -> Result<ExportSummary> {
    let paths = discover_documents(input_dir)?;
    fs::create_dir_all(out_dir)?;

    let mut summary = ExportSummary::default();
    for path in paths {
        let source_file = source_file_name(&path);
        let document = match open_document(&path) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(file = %source_file, "Skipping document: {}", e);
                summary.skipped.push(SkipRecord::from_error(&source_file, &e));
                continue;
            }
        };

        let text = anonymizer.anonymize(&document.pages.into_text());
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_file.clone());
        let target = out_dir.join(format!("{}.txt", stem));
        fs::write(&target, text)?;
        info!(file = %source_file, target = %target.display(), "Wrote anonymized text");
        summary.written.push(target);
    }

    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct Anonymizer {
    headers: RegexSet,
    release_prefixes: Vec<String>,
    signature_markers: Vec<String>,
    hex_line: Regex,
}

impl Anonymizer {
    pub fn from_config(config: &AnonymizerConfig) -> Result<Self> {
        let headers = RegexSetBuilder::new(&config.header_markers)
            .case_insensitive(true)
            .build()?;
        let hex_line = Regex::new(&format!(r"^[A-Fa-f0-9]{{{},}}$", config.min_hex_len.max(1)))?;

        Ok(Self {
            headers,
            release_prefixes: config
                .release_prefixes
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            signature_markers: config
                .signature_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            hex_line,
        })
    }

    /// Remove the identity block, then filter line by line. The skip state
    /// for release lines lives only for the duration of one call.
    pub fn anonymize(&self, text: &str) -> String {
        let without_identity = IDENTITY_PATTERN.replace_all(text, "");

        let mut kept: Vec<&str> = Vec::new();
        let mut skip_next = false;
        for line in without_identity.lines() {
            if skip_next {
                skip_next = false;
                continue;
            }

            let trimmed = line.trim();
            if self.headers.is_match(trimmed) {
                continue;
            }
            if self.is_release_line(trimmed) {
                // the credential line (CRM/CRF) that follows goes too
                skip_next = true;
                continue;
            }
            if self.is_signature_marker(trimmed) || self.hex_line.is_match(trimmed) {
                continue;
            }
            kept.push(line);
        }

        kept.join("\n").trim().to_string()
    }

    fn is_release_line(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        self.release_prefixes.iter().any(|p| lower.starts_with(p.as_str()))
    }

    fn is_signature_marker(&self, line: &str) -> bool {
        let lower = line.trim_end_matches(':').trim().to_lowercase();
        self.signature_markers.iter().any(|m| *m == lower)
    }
}
