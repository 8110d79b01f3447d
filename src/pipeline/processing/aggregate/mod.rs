//! Record aggregation and tabular output
//!
//! Each document becomes one flat row: the patient columns in a fixed order,
//! followed by `<key>`, `<key>_status` and `<key>_ref` for every extracted
//! test. The batch's column universe is the union across all rows, test
//! columns sorted alphabetically; cells a row lacks are written empty.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::constants::{self, PATIENT_COLUMNS, REFERENCE_SUFFIX, STATUS_SUFFIX};
use crate::error::{LabError, Result};
use crate::types::{EvaluatedResult, PatientRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRecord {
    pub source_file: String,
    pub patient: PatientRecord,
    pub results: Vec<EvaluatedResult>,
}

impl AggregatedRecord {
    pub fn new(source_file: String, patient: PatientRecord, results: Vec<EvaluatedResult>) -> Self {
        Self {
            source_file,
            patient,
            results,
        }
    }

    fn patient_cell(&self, column: &str) -> String {
        let p = &self.patient;
        match column {
            constants::COL_SOURCE_FILE => self.source_file.clone(),
            constants::COL_NAME => p.name.clone(),
            constants::COL_ID_DOCUMENT => p.id_document.clone().unwrap_or_default(),
            constants::COL_OS_CODE => p.os_code.clone(),
            constants::COL_BIRTH_DATE => p.birth_date.clone(),
            constants::COL_AGE => p.age.map(|a| a.to_string()).unwrap_or_default(),
            constants::COL_GENDER => p.gender.map(|g| g.code().to_string()).unwrap_or_default(),
            constants::COL_TAX_ID => p.tax_id.clone(),
            constants::COL_PHYSICIAN => p.physician.clone(),
            constants::COL_VISIT_ID => p.visit_id.clone(),
            constants::COL_PAYER => p.payer.clone(),
            constants::COL_EXAM_COUNT => p.exam_count.to_string(),
            _ => String::new(),
        }
    }

    /// Flattened per-test cells keyed by column name
    pub fn test_cells(&self) -> BTreeMap<String, String> {
        let mut cells = BTreeMap::new();
        for result in &self.results {
            let key = &result.column_key;
            cells.insert(key.clone(), result.value.to_string());
            cells.insert(format!("{}{}", key, STATUS_SUFFIX), result.status.symbol().to_string());
            cells.insert(format!("{}{}", key, REFERENCE_SUFFIX), result.reference.clone());
        }
        cells
    }
}

/// A document left out of the table, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipRecord {
    pub source_file: String,
    pub reason: String,
    pub detail: String,
}

impl SkipRecord {
    pub fn from_error(source_file: &str, error: &LabError) -> Self {
        Self {
            source_file: source_file.to_string(),
            reason: error.kind().to_string(),
            detail: error.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SkipReport<'a> {
    run_id: &'a str,
    generated_at: DateTime<Utc>,
    skipped: &'a [SkipRecord],
}

pub fn write_skip_report(path: &Path, run_id: &str, skipped: &[SkipRecord]) -> Result<()> {
    ensure_parent(path)?;
    let report = SkipReport {
        run_id,
        generated_at: Utc::now(),
        skipped,
    };
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &report)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// All records of one run
#[derive(Debug, Clone, Default)]
pub struct Batch {
    records: Vec<AggregatedRecord>,
}

impl Batch {
    pub fn push(&mut self, record: AggregatedRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[AggregatedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Order rows by source file name
    pub fn sort_by_source(&mut self) {
        self.records.sort_by(|a, b| a.source_file.cmp(&b.source_file));
    }

    pub fn columns(&self) -> Vec<String> {
        let test_columns: BTreeSet<String> = self
            .records
            .iter()
            .flat_map(|r| r.test_cells().into_keys())
            .collect();

        PATIENT_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(test_columns)
            .collect()
    }

    pub fn rows(&self, columns: &[String]) -> Vec<Vec<String>> {
        self.records
            .iter()
            .map(|record| {
                let cells = record.test_cells();
                columns
                    .iter()
                    .map(|column| {
                        if PATIENT_COLUMNS.contains(&column.as_str()) {
                            record.patient_cell(column)
                        } else {
                            cells.get(column).cloned().unwrap_or_default()
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Write the header and one row per record; returns the column count
    pub fn write_csv<W: Write>(&self, writer: W, delimiter: u8) -> Result<usize> {
        let columns = self.columns();
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(writer);

        wtr.write_record(&columns)?;
        for row in self.rows(&columns) {
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(columns.len())
    }

    pub fn write_to_path(&self, path: &Path, delimiter: u8) -> Result<usize> {
        ensure_parent(path)?;
        let file = File::create(path)?;
        self.write_csv(file, delimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::reference::Status;
    use crate::types::{Gender, LabValue};

    fn patient(name: &str) -> PatientRecord {
        PatientRecord {
            name: name.to_string(),
            id_document: None,
            os_code: "OS-1".to_string(),
            birth_date: "17/04/2015".to_string(),
            age: Some(8),
            gender: Some(Gender::Female),
            tax_id: "111".to_string(),
            physician: "DR X".to_string(),
            visit_id: "V1".to_string(),
            payer: "UNIMED".to_string(),
            exam_count: 2,
        }
    }

    fn result(key: &str, value: LabValue, status: Status, reference: &str) -> EvaluatedResult {
        EvaluatedResult {
            test_name: key.split(" (").next().unwrap_or(key).to_string(),
            column_key: key.to_string(),
            raw_value: value.to_string(),
            value,
            unit: None,
            status,
            reference: reference.to_string(),
        }
    }

    fn batch() -> Batch {
        let mut batch = Batch::default();
        batch.push(AggregatedRecord::new(
            "b.pdf".into(),
            patient("BEATRIZ"),
            vec![result("UREIA (MG/DL)", LabValue::Number(30.0), Status::Normal, "Geral: 15-50 MG/DL")],
        ));
        batch.push(AggregatedRecord::new(
            "a.pdf".into(),
            patient("ANA"),
            vec![result(
                "GLICOSE (MG/DL)",
                LabValue::Number(250.0),
                Status::Above,
                "Normal: 70-99 MG/DL",
            )],
        ));
        batch
    }

    #[test]
    fn columns_are_patient_fields_then_sorted_tests() {
        let columns = batch().columns();
        assert_eq!(&columns[..PATIENT_COLUMNS.len()], &PATIENT_COLUMNS.map(String::from));
        assert_eq!(
            &columns[PATIENT_COLUMNS.len()..],
            &[
                "GLICOSE (MG/DL)",
                "GLICOSE (MG/DL)_ref",
                "GLICOSE (MG/DL)_status",
                "UREIA (MG/DL)",
                "UREIA (MG/DL)_ref",
                "UREIA (MG/DL)_status",
            ]
        );
    }

    #[test]
    fn missing_cells_are_empty() {
        let mut batch = batch();
        batch.sort_by_source();
        let columns = batch.columns();
        let rows = batch.rows(&columns);

        let ureia = columns.iter().position(|c| c == "UREIA (MG/DL)").unwrap();
        let status = columns.iter().position(|c| c == "GLICOSE (MG/DL)_status").unwrap();
        assert_eq!(rows[0][0], "a.pdf");
        assert_eq!(rows[0][ureia], "");
        assert_eq!(rows[0][status], "↑");
        assert_eq!(rows[1][ureia], "30");
    }

    #[test]
    fn csv_output_has_header_and_rows() {
        let mut buf = Vec::new();
        let width = batch().write_csv(&mut buf, b';').unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(width, PATIENT_COLUMNS.len() + 6);
        assert!(lines[0].starts_with("source_file;name;id_document"));
        assert!(lines[2].contains("ANA"));
        assert!(lines[2].contains(";F;"));
    }

    #[test]
    fn skip_records_carry_error_kind() {
        let err = LabError::PatientParse {
            source_file: "x.pdf".into(),
        };
        let skip = SkipRecord::from_error("x.pdf", &err);
        assert_eq!(skip.reason, "patient_parse");
        assert!(skip.detail.contains("x.pdf"));
    }
}
