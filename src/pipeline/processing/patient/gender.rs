use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{LabError, Result};
use crate::types::Gender;

#[derive(Debug, Deserialize)]
struct GenderRow {
    patient_key: String,
    gender: String,
}

/// Per-patient gender attributes supplied outside the reports.
///
/// Keys are compared on their alphanumeric characters only, so a tax id
/// printed as `123.456.789-00` matches a file entry of `12345678900`.
#[derive(Debug, Clone, Default)]
pub struct GenderDirectory {
    entries: HashMap<String, Gender>,
}

fn canonical_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

impl GenderDirectory {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut entries = HashMap::new();

        for (line, row) in rdr.deserialize::<GenderRow>().enumerate() {
            let row = row?;
            let gender = match row.gender.parse::<Gender>() {
                Ok(g) => g,
                Err(e) => {
                    warn!(row = line + 1, patient_key = %row.patient_key, "Ignoring gender entry: {}", e);
                    continue;
                }
            };
            let key = canonical_key(&row.patient_key);
            if !key.is_empty() {
                entries.insert(key, gender);
            }
        }

        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            LabError::Config(format!(
                "Failed to open gender file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let directory = Self::from_reader(file)?;
        info!(path = %path.display(), patients = directory.len(), "Loaded gender directory");
        Ok(directory)
    }

    /// First hit among `keys`, tried in order
    pub fn lookup(&self, keys: &[&str]) -> Option<Gender> {
        keys.iter()
            .map(|k| canonical_key(k))
            .filter(|k| !k.is_empty())
            .find_map(|k| self.entries.get(&k).copied())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
