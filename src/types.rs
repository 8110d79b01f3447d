use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pipeline::processing::reference::Status;

/// Patient gender as supplied by the external attribute source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Gender {
    pub fn code(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "m" | "male" | "masculino" | "masc" => Ok(Gender::Male),
            "f" | "female" | "feminino" | "fem" => Ok(Gender::Female),
            other => Err(format!("unrecognised gender '{}'", other)),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A captured test value after normalization: numeric when the capture
/// parsed as a number, otherwise the trimmed text (qualitative results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabValue {
    Number(f64),
    Text(String),
}

impl LabValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            LabValue::Number(n) => Some(*n),
            LabValue::Text(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, LabValue::Number(_))
    }
}

impl fmt::Display for LabValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabValue::Number(n) => write!(f, "{}", n),
            LabValue::Text(s) => f.write_str(s),
        }
    }
}

/// Demographic fields parsed from a report's identity block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub name: String,
    pub id_document: Option<String>,
    pub os_code: String,
    /// Birth date exactly as printed on the report
    pub birth_date: String,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub tax_id: String,
    pub physician: String,
    pub visit_id: String,
    pub payer: String,
    pub exam_count: u32,
}

impl PatientRecord {
    pub fn context(&self) -> PatientContext {
        PatientContext {
            age: self.age,
            gender: self.gender,
        }
    }
}

/// The slice of a patient the reference engine needs to pick a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatientContext {
    pub age: Option<u32>,
    pub gender: Option<Gender>,
}

impl PatientContext {
    pub fn new(age: Option<u32>, gender: Option<Gender>) -> Self {
        Self { age, gender }
    }
}

/// One test found in one document, evaluated against its reference rules
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatedResult {
    pub test_name: String,
    /// `"<name> (<unit>)"` or `"<name>"`; base of the flattened columns
    pub column_key: String,
    pub raw_value: String,
    pub value: LabValue,
    pub unit: Option<String>,
    pub status: Status,
    pub reference: String,
}

/// Whole years between `birth` and `on`, or `None` when born after `on`.
pub fn age_on(birth: NaiveDate, on: NaiveDate) -> Option<u32> {
    use chrono::Datelike;

    let mut years = on.year() - birth.year();
    if (on.month(), on.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}
