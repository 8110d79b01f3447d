use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Failed to read document {path}: {reason}")]
    DocumentRead { path: PathBuf, reason: String },

    #[error("Patient identity block not found in {source_file}")]
    PatientParse { source_file: String },

    #[error("Input unavailable: {0}")]
    InputUnavailable(String),

    #[error("Document {source_file} exceeded the {seconds}s processing deadline")]
    DocumentTimeout { source_file: String, seconds: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("Reference table does not match schema: {0}")]
    RuleSchema(String),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// Short machine-friendly label used for metrics and the skip report.
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::DocumentRead { .. } => "document_read",
            LabError::PatientParse { .. } => "patient_parse",
            LabError::InputUnavailable(_) => "input_unavailable",
            LabError::DocumentTimeout { .. } => "timeout",
            LabError::Config(_) => "config",
            LabError::Task(_) => "task",
            LabError::RuleSchema(_) => "rule_schema",
            LabError::Json(_) => "json",
            LabError::Toml(_) => "toml",
            LabError::Csv(_) => "csv",
            LabError::Regex(_) => "regex",
            LabError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, LabError>;
