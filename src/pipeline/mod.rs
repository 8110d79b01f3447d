// Document pipeline: ingestion, processing, and the batch runner

pub mod ingestion;
pub mod processing;
pub mod runner;

use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info_span};

use crate::config::Config;
use crate::error::Result;
use crate::types::{EvaluatedResult, PatientRecord};
use processing::aggregate::AggregatedRecord;
use processing::anonymize::Anonymizer;
use processing::extract::TestCatalog;
use processing::normalize::normalize_value;
use processing::patient::{GenderDirectory, PatientParser};
use processing::reference::{load_reference_table, GenderPolicy, ReferenceEngine, ReferenceTable};

/// Static configuration tables, loaded once and shared read-only by workers
#[derive(Debug, Clone)]
pub struct Tables {
    pub catalog: TestCatalog,
    pub references: ReferenceTable,
    pub genders: GenderDirectory,
    pub anonymizer: Anonymizer,
}

impl Tables {
    pub fn load(config: &Config) -> Result<Self> {
        let catalog = TestCatalog::load(&config.tables.tests)?;
        let references = load_reference_table(&config.tables.references)?;
        let genders = match &config.tables.genders {
            Some(path) => GenderDirectory::load(path)?,
            None => GenderDirectory::default(),
        };
        let anonymizer = Anonymizer::from_config(&config.anonymizer)?;

        Ok(Self {
            catalog,
            references,
            genders,
            anonymizer,
        })
    }

    /// Names present in one table but not the other
    pub fn alignment(&self) -> TableAlignment {
        let extracted: BTreeSet<&str> = self.catalog.names().collect();
        let referenced: BTreeSet<&str> = self.references.test_names().collect();

        TableAlignment {
            missing_references: extracted
                .difference(&referenced)
                .map(|s| s.to_string())
                .collect(),
            unused_references: referenced
                .difference(&extracted)
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableAlignment {
    /// Extractable tests with no reference rules
    pub missing_references: Vec<String>,
    /// Reference rule sets no extraction rule produces
    pub unused_references: Vec<String>,
}

impl TableAlignment {
    pub fn is_aligned(&self) -> bool {
        self.missing_references.is_empty() && self.unused_references.is_empty()
    }
}

/// Turns one document into one aggregated record
pub struct DocumentPipeline<'a> {
    tables: &'a Tables,
    processing_date: NaiveDate,
    gender_policy: GenderPolicy,
}

impl<'a> DocumentPipeline<'a> {
    pub fn new(tables: &'a Tables, processing_date: NaiveDate, gender_policy: GenderPolicy) -> Self {
        Self {
            tables,
            processing_date,
            gender_policy,
        }
    }

    /// Read, decode and process the document at `path`
    pub fn process_path(&self, path: &Path) -> Result<AggregatedRecord> {
        let document = ingestion::open_document(path)?;
        let span = info_span!(
            "document",
            file = %document.source_file,
            sha256 = %document.fingerprint
        );
        let _guard = span.enter();

        let text = document.pages.into_text();
        self.process_text(&document.source_file, &text)
    }

    /// Identity parsing runs on the full text; tests are extracted from the
    /// anonymized text.
    pub fn process_text(&self, source_file: &str, text: &str) -> Result<AggregatedRecord> {
        let patient = PatientParser::new(self.processing_date, &self.tables.genders)
            .parse(text, source_file)?;

        let anonymized = self.tables.anonymizer.anonymize(text);
        let results = self.evaluate(&anonymized, &patient);
        debug!(tests = results.len(), "Evaluated document");

        Ok(AggregatedRecord::new(source_file.to_string(), patient, results))
    }

    pub fn evaluate(&self, text: &str, patient: &PatientRecord) -> Vec<EvaluatedResult> {
        let engine = ReferenceEngine::new(&self.tables.references, self.gender_policy);
        let context = patient.context();

        self.tables
            .catalog
            .extract_all(text)
            .into_iter()
            .map(|found| {
                let value = normalize_value(&found.raw_value);
                let evaluation = engine.evaluate(&found.test_name, &value, &context);
                EvaluatedResult {
                    test_name: found.test_name,
                    column_key: found.column_key,
                    raw_value: found.raw_value,
                    value,
                    unit: found.unit,
                    status: evaluation.status,
                    reference: evaluation.reference,
                }
            })
            .collect()
    }
}
