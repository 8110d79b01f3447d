//! Patient identity block parsing

pub mod gender;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

use crate::error::{LabError, Result};
use crate::types::{age_on, PatientRecord};

pub use gender::GenderDirectory;

/// The identity block printed at the top of every report. Group 2 (RG) is
/// optional; the rest are mandatory.
pub(crate) static IDENTITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?s)Nome\s*:\s*(.*?)\s*",
        r"(?:RG\s*:\s*(.*?)\s*)?",
        r"Código da OS\s*:\s*(.*?)\s*",
        r"DN\s*:\s*(.*?)\s*",
        r"CPF\s*:\s*(.*?)\s*",
        r"Médico\s*:\s*(.*?)\s*",
        r"Atendimento\s*:\s*(.*?)\s*",
        r"Convênio:\s*(.*?)\s*",
        r"Qnt de exames:\s*(\d+)",
    ))
    .expect("identity pattern is a valid regex")
});

static AGE_ANNOTATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\((\d+)\s*ano").expect("age pattern is a valid regex"));

const BIRTH_DATE_FORMATS: [&str; 2] = ["%d/%m/%Y", "%Y-%m-%d"];

/// Parses the identity block and derives age against a fixed processing date
pub struct PatientParser<'a> {
    processing_date: NaiveDate,
    genders: &'a GenderDirectory,
}

impl<'a> PatientParser<'a> {
    pub fn new(processing_date: NaiveDate, genders: &'a GenderDirectory) -> Self {
        Self {
            processing_date,
            genders,
        }
    }

    pub fn parse(&self, text: &str, source_file: &str) -> Result<PatientRecord> {
        let caps = IDENTITY_PATTERN
            .captures(text)
            .ok_or_else(|| LabError::PatientParse {
                source_file: source_file.to_string(),
            })?;

        let field = |i: usize| group(&caps, i);
        let birth_date = field(4);
        let age = derive_age(&birth_date, self.processing_date);
        let exam_count = field(9).parse::<u32>().map_err(|_| LabError::PatientParse {
            source_file: source_file.to_string(),
        })?;

        let tax_id = field(5);
        let os_code = field(3);
        let visit_id = field(7);
        let gender = self.genders.lookup(&[&tax_id, &os_code, &visit_id]);
        if gender.is_none() {
            debug!(source_file, "No gender on file for patient");
        }

        Ok(PatientRecord {
            name: field(1),
            id_document: caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty()),
            os_code,
            birth_date,
            age,
            gender,
            tax_id,
            physician: field(6),
            visit_id,
            payer: field(8),
            exam_count,
        })
    }
}

fn group(caps: &Captures<'_>, i: usize) -> String {
    caps.get(i)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Age from the printed birth date, falling back to a "(N anos)" annotation.
pub fn derive_age(birth_date: &str, processing_date: NaiveDate) -> Option<u32> {
    let date_token = birth_date.split_whitespace().next().unwrap_or("");
    let parsed = BIRTH_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_token, fmt).ok());

    if let Some(birth) = parsed {
        return age_on(birth, processing_date);
    }

    AGE_ANNOTATION
        .captures(birth_date)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Gender;

    const IDENTITY: &str = "Nome: MARIA DA SILVA RG: 12.345.678\n\
        Código da OS: 0042-7781 DN: 17/04/2015\n\
        CPF: 123.456.789-00 Médico: DR. JOSE PEREIRA\n\
        Atendimento: 889911 Convênio: UNIMED Qnt de exames: 12\n";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn identity_fields_are_extracted() {
        let genders = GenderDirectory::default();
        let record = PatientParser::new(today(), &genders)
            .parse(IDENTITY, "a.pdf")
            .unwrap();

        assert_eq!(record.name, "MARIA DA SILVA");
        assert_eq!(record.id_document.as_deref(), Some("12.345.678"));
        assert_eq!(record.os_code, "0042-7781");
        assert_eq!(record.birth_date, "17/04/2015");
        assert_eq!(record.age, Some(8));
        assert_eq!(record.tax_id, "123.456.789-00");
        assert_eq!(record.physician, "DR. JOSE PEREIRA");
        assert_eq!(record.visit_id, "889911");
        assert_eq!(record.payer, "UNIMED");
        assert_eq!(record.exam_count, 12);
        assert_eq!(record.gender, None);
    }

    #[test]
    fn rg_is_optional() {
        let text = IDENTITY.replace(" RG: 12.345.678", "");
        let genders = GenderDirectory::default();
        let record = PatientParser::new(today(), &genders).parse(&text, "a.pdf").unwrap();
        assert_eq!(record.name, "MARIA DA SILVA");
        assert_eq!(record.id_document, None);
    }

    #[test]
    fn gender_comes_from_directory() {
        let genders = GenderDirectory::from_reader("patient_key,gender\n12345678900,F\n".as_bytes()).unwrap();
        let record = PatientParser::new(today(), &genders).parse(IDENTITY, "a.pdf").unwrap();
        assert_eq!(record.gender, Some(Gender::Female));
    }

    #[test]
    fn missing_identity_block_is_a_parse_error() {
        let genders = GenderDirectory::default();
        let err = PatientParser::new(today(), &genders)
            .parse("GLICOSE 95 mg/dL", "broken.pdf")
            .unwrap_err();
        match err {
            LabError::PatientParse { source_file } => assert_eq!(source_file, "broken.pdf"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn age_annotation_is_used_when_date_is_unreadable() {
        assert_eq!(derive_age("??/04/2015 (7 anos)", today()), Some(7));
        assert_eq!(derive_age("desconhecida", today()), None);
    }

    #[test]
    fn iso_birth_dates_are_accepted() {
        assert_eq!(derive_age("2015-04-17", today()), Some(8));
    }
}
