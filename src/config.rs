use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::error::{LabError, Result};
use crate::pipeline::processing::reference::GenderPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tables: TablesConfig,
    pub processing: ProcessingConfig,
    pub anonymizer: AnonymizerConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Locations of the static extraction and reference tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TablesConfig {
    pub tests: PathBuf,
    pub references: PathBuf,
    /// Optional CSV of `patient_key,gender` rows
    pub genders: Option<PathBuf>,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            tests: PathBuf::from("config/tests.toml"),
            references: PathBuf::from("config/references.json"),
            genders: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Maximum number of documents processed at once
    pub workers: usize,
    /// Per-document deadline; documents exceeding it are skipped
    pub document_timeout_secs: u64,
    /// Date used for age derivation; defaults to today
    pub as_of: Option<NaiveDate>,
    pub gender_policy: GenderPolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            document_timeout_secs: 30,
            as_of: None,
            gender_policy: GenderPolicy::default(),
        }
    }
}

impl ProcessingConfig {
    pub fn processing_date(&self) -> NaiveDate {
        self.as_of
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }
}

/// Line filters applied when stripping identity and signature noise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnonymizerConfig {
    /// Regexes; any line matching one of them is dropped
    pub header_markers: Vec<String>,
    /// Case-insensitive prefixes; the matching line and the next one are dropped
    pub release_prefixes: Vec<String>,
    /// Lines consisting solely of one of these tokens are dropped
    pub signature_markers: Vec<String>,
    pub min_hex_len: usize,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            header_markers: constants::DEFAULT_HEADER_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            release_prefixes: constants::DEFAULT_RELEASE_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            signature_markers: constants::DEFAULT_SIGNATURE_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_hex_len: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub table: PathBuf,
    pub skipped: PathBuf,
    pub delimiter: char,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            table: PathBuf::from("all_lab_results.csv"),
            skipped: PathBuf::from("skipped_documents.json"),
            delimiter: ',',
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name: "lab_scraper.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from `config.toml` when no path is
    /// given. An explicitly requested file must exist; the default one may be
    /// absent, in which case built-in defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(constants::DEFAULT_CONFIG_PATH), false),
        };

        if !config_path.exists() {
            if required {
                return Err(LabError::Config(format!(
                    "Config file '{}' does not exist",
                    config_path.display()
                )));
            }
            return Ok(Self::default());
        }

        let config_content = fs::read_to_string(&config_path).map_err(|e| {
            LabError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path.display(),
                e
            ))
        })?;

        Self::from_toml(&config_content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that hold whether values come from the file or the command line
    pub fn validate(&self) -> Result<()> {
        if self.processing.workers == 0 {
            return Err(LabError::Config("processing.workers must be at least 1".into()));
        }
        if self.processing.document_timeout_secs == 0 {
            return Err(LabError::Config(
                "processing.document_timeout_secs must be at least 1".into(),
            ));
        }
        if !self.output.delimiter.is_ascii() {
            return Err(LabError::Config("output.delimiter must be an ASCII character".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.tables.tests, PathBuf::from("config/tests.toml"));
        assert_eq!(config.processing.document_timeout_secs, 30);
        assert_eq!(config.anonymizer.min_hex_len, 30);
        assert_eq!(config.processing.gender_policy, GenderPolicy::FailOpen);
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            [processing]
            workers = 2
            as_of = "2024-01-01"
            gender_policy = "exclude"

            [output]
            table = "out/results.csv"
            delimiter = ";"
            "#,
        )
        .unwrap();

        assert_eq!(config.processing.workers, 2);
        assert_eq!(
            config.processing.processing_date(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
        assert_eq!(config.processing.gender_policy, GenderPolicy::Exclude);
        assert_eq!(config.output.delimiter, ';');
        // untouched sections keep their defaults
        assert_eq!(config.logging.file_name, "lab_scraper.log");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = Config::from_toml("[processing]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
    }

    #[test]
    fn zero_document_timeout_is_rejected() {
        let err = Config::from_toml("[processing]\ndocument_timeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, LabError::Config(ref m) if m.contains("document_timeout_secs")));
    }

    #[test]
    fn validate_catches_values_set_after_loading() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.processing.document_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
    }
}
