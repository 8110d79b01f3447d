//! Test result extraction
//!
//! Every [`TestDefinition`] is searched independently over the whole
//! (anonymized) text; the first match wins and a miss only means the test's
//! columns are absent for that document.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{LabError, Result};

const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    tests: Vec<CatalogEntry>,
}

fn default_version() -> u32 {
    CATALOG_VERSION
}

fn default_value_group() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    pattern: String,
    #[serde(default = "default_value_group")]
    value_group: usize,
    #[serde(default)]
    unit_group: Option<usize>,
    #[serde(default)]
    implicit_unit: Option<String>,
}

/// Extraction rule for one canonical test name
#[derive(Debug, Clone)]
pub struct TestDefinition {
    pub name: String,
    pattern: Regex,
    value_group: usize,
    unit_group: Option<usize>,
    implicit_unit: Option<String>,
}

impl TestDefinition {
    /// Compile a definition. Patterns always match case-insensitively and
    /// `.` spans line breaks.
    pub fn new(
        name: &str,
        pattern: &str,
        value_group: usize,
        unit_group: Option<usize>,
        implicit_unit: Option<&str>,
    ) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()?;

        let groups = regex.captures_len() - 1;
        if value_group == 0 || value_group > groups {
            return Err(LabError::Config(format!(
                "test '{}': value_group {} but pattern has {} capture groups",
                name, value_group, groups
            )));
        }
        if let Some(unit) = unit_group {
            if unit == 0 || unit > groups {
                return Err(LabError::Config(format!(
                    "test '{}': unit_group {} but pattern has {} capture groups",
                    name, unit, groups
                )));
            }
        }

        Ok(Self {
            name: name.to_string(),
            pattern: regex,
            value_group,
            unit_group,
            implicit_unit: implicit_unit
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
        })
    }

    /// First match of this definition in `text`
    pub fn extract(&self, text: &str) -> Option<ExtractedTest> {
        let caps = self.pattern.captures(text)?;
        let raw_value = caps.get(self.value_group)?.as_str().trim().to_string();

        let captured_unit = self
            .unit_group
            .and_then(|g| caps.get(g))
            .map(|m| m.as_str().trim())
            .filter(|u| !u.is_empty());
        let unit = captured_unit
            .or(self.implicit_unit.as_deref())
            .map(str::to_uppercase);

        let column_key = match &unit {
            Some(u) => format!("{} ({})", self.name, u),
            None => self.name.clone(),
        };

        Some(ExtractedTest {
            test_name: self.name.clone(),
            column_key,
            raw_value,
            unit,
        })
    }
}

/// A raw capture before normalization and evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedTest {
    pub test_name: String,
    pub column_key: String,
    pub raw_value: String,
    pub unit: Option<String>,
}

/// Ordered, read-only set of test definitions
#[derive(Debug, Clone, Default)]
pub struct TestCatalog {
    definitions: Vec<TestDefinition>,
}

impl TestCatalog {
    /// Build from definitions; a repeated name replaces the earlier
    /// definition but keeps its position.
    pub fn new(definitions: impl IntoIterator<Item = TestDefinition>) -> Self {
        let mut ordered: Vec<TestDefinition> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for def in definitions {
            match positions.get(&def.name) {
                Some(&i) => {
                    warn!(test = %def.name, "Duplicate test definition; the later one replaces the earlier");
                    ordered[i] = def;
                }
                None => {
                    positions.insert(def.name.clone(), ordered.len());
                    ordered.push(def);
                }
            }
        }
        Self {
            definitions: ordered,
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        if file.version != CATALOG_VERSION {
            return Err(LabError::Config(format!(
                "unsupported test catalog version {} (expected {})",
                file.version, CATALOG_VERSION
            )));
        }

        let definitions = file
            .tests
            .into_iter()
            .map(|e| {
                TestDefinition::new(
                    &e.name,
                    &e.pattern,
                    e.value_group,
                    e.unit_group,
                    e.implicit_unit.as_deref(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(definitions))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            LabError::Config(format!(
                "Failed to read test catalog '{}': {}",
                path.display(),
                e
            ))
        })?;
        let catalog = Self::from_toml(&content)?;
        info!(path = %path.display(), tests = catalog.len(), "Loaded test catalog");
        Ok(catalog)
    }

    pub fn definitions(&self) -> &[TestDefinition] {
        &self.definitions
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Run every definition over `text`, in declaration order.
    pub fn extract_all(&self, text: &str) -> Vec<ExtractedTest> {
        self.definitions
            .iter()
            .filter_map(|def| {
                let found = def.extract(text);
                if found.is_none() {
                    debug!(test = %def.name, "No match");
                }
                found
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "GLICOSE\nMaterial: Soro\nResultado: 95,0 mg/dL\n\
                          HEMOGLOBINA ............: 13,5 g/dL\n\
                          CULTURA DE URINA\nResultado: Negativa\n";

    fn catalog() -> TestCatalog {
        TestCatalog::from_toml(
            r#"
            version = 1

            [[tests]]
            name = "GLICOSE"
            pattern = 'GLICOSE\s.*?Resultado\s*:\s*([\d.,]+)\s*(mg/dL)'
            unit_group = 2

            [[tests]]
            name = "HEMOGLOBINA"
            pattern = 'HEMOGLOBINA[\s.:]*([\d.,]+)'
            implicit_unit = "g/dL"

            [[tests]]
            name = "CULTURA DE URINA"
            pattern = 'CULTURA DE URINA\s.*?Resultado\s*:\s*(\S+)'

            [[tests]]
            name = "TSH"
            pattern = 'TSH\s*:\s*([\d.,]+)'
            implicit_unit = "µUI/mL"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn captured_unit_is_upper_cased_into_the_key() {
        let found = catalog().extract_all(REPORT);
        let glicose = &found[0];
        assert_eq!(glicose.test_name, "GLICOSE");
        assert_eq!(glicose.raw_value, "95,0");
        assert_eq!(glicose.unit.as_deref(), Some("MG/DL"));
        assert_eq!(glicose.column_key, "GLICOSE (MG/DL)");
    }

    #[test]
    fn implicit_unit_applies_when_no_group() {
        let found = catalog().extract_all(REPORT);
        assert_eq!(found[1].column_key, "HEMOGLOBINA (G/DL)");
        assert_eq!(found[1].raw_value, "13,5");
    }

    #[test]
    fn no_unit_means_bare_name() {
        let found = catalog().extract_all(REPORT);
        assert_eq!(found[2].column_key, "CULTURA DE URINA");
        assert_eq!(found[2].raw_value, "Negativa");
    }

    #[test]
    fn a_miss_does_not_affect_other_tests() {
        let found = catalog().extract_all(REPORT);
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|t| t.test_name != "TSH"));
    }

    #[test]
    fn matching_ignores_case() {
        let found = catalog().extract_all("glicose em jejum\nresultado: 101 MG/DL");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw_value, "101");
    }

    #[test]
    fn out_of_range_group_is_rejected_at_load() {
        let err = TestDefinition::new("X", r"X\s*(\d+)", 2, None, None).unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
    }

    #[test]
    fn invalid_pattern_is_a_regex_error() {
        let err = TestDefinition::new("X", r"X(\d+", 1, None, None).unwrap_err();
        assert!(matches!(err, LabError::Regex(_)));
    }

    #[test]
    fn duplicate_name_keeps_position_with_later_pattern() {
        let catalog = TestCatalog::new([
            TestDefinition::new("UREIA", r"UREIA\s*(\d+)", 1, None, None).unwrap(),
            TestDefinition::new("TSH", r"TSH\s*(\d+)", 1, None, None).unwrap(),
            TestDefinition::new("UREIA", r"UREIA\s*:\s*(\d+)", 1, None, Some("mg/dL")).unwrap(),
        ]);
        let names: Vec<&str> = catalog.names().collect();
        assert_eq!(names, vec!["UREIA", "TSH"]);
        let found = catalog.extract_all("UREIA: 30");
        assert_eq!(found[0].column_key, "UREIA (MG/DL)");
    }
}
