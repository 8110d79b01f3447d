//! Reference table loading
//!
//! The current format is a versioned document validated against
//! `schemas/reference_rules.v2.json`:
//!
//! ```json
//! { "schema_version": 2,
//!   "tests": [ { "name": "GLICOSE", "unit": "mg/dL",
//!                "references": [ { "condition": "Normal", "type": "range", "min": 70, "max": 99 } ] } ] }
//! ```
//!
//! Two older layouts are still accepted and adapted on load: a flat list of
//! `[name, {ref_min, ref_max, unit}]` / `[name, {expected}]` pairs, and the
//! conditional list of `[name, {unit, references: [...]}]` pairs.

use jsonschema::JSONSchema;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{ComparisonKind, ReferenceRule, ReferenceRuleSet, ReferenceTable};
use crate::constants::REFERENCE_SCHEMA_VERSION;
use crate::error::{LabError, Result};
use crate::types::Gender;

const REFERENCE_SCHEMA: &str = include_str!("../../../../schemas/reference_rules.v2.json");

static SCHEMA_DOC: OnceCell<Value> = OnceCell::new();
static SCHEMA: OnceCell<JSONSchema> = OnceCell::new();

fn compiled_schema() -> Result<&'static JSONSchema> {
    SCHEMA.get_or_try_init(|| {
        let doc: &'static Value =
            SCHEMA_DOC.get_or_try_init(|| serde_json::from_str::<Value>(REFERENCE_SCHEMA))?;
        JSONSchema::options()
            .compile(doc)
            .map_err(|e| LabError::RuleSchema(format!("bundled schema does not compile: {}", e)))
    })
}

#[derive(Debug, Deserialize)]
struct ReferenceDocument {
    schema_version: u32,
    tests: Vec<TestEntry>,
}

#[derive(Debug, Deserialize)]
struct TestEntry {
    name: String,
    #[serde(default)]
    unit: Option<String>,
    references: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct ConditionalInfo {
    #[serde(default)]
    unit: Option<String>,
    references: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct FlatInfo {
    #[serde(default)]
    ref_min: Option<f64>,
    #[serde(default)]
    ref_max: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    expected: Option<Expected>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    age_min: Option<u32>,
    #[serde(default)]
    age_max: Option<u32>,
    #[serde(rename = "type", default)]
    kind: ComparisonKind,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    expected: Option<Expected>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    unit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expected {
    One(String),
    Many(Vec<String>),
}

impl Expected {
    fn into_vec(self) -> Vec<String> {
        match self {
            Expected::One(s) => vec![s],
            Expected::Many(v) => v,
        }
    }
}

impl RuleEntry {
    fn into_rule(self, test_name: &str) -> Result<ReferenceRule> {
        let gender = match self.gender.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(code) => Some(code.parse::<Gender>().map_err(|e| {
                LabError::RuleSchema(format!("{}: {}", test_name, e))
            })?),
        };
        Ok(ReferenceRule {
            condition: self.condition.unwrap_or_else(|| "Geral".to_string()),
            gender,
            age_min: self.age_min,
            age_max: self.age_max,
            kind: self.kind,
            min: self.min,
            max: self.max,
            expected: self.expected.map(Expected::into_vec).unwrap_or_default(),
            priority: self.priority,
            unit: self.unit,
        })
    }
}

fn rule_set(name: String, unit: Option<String>, entries: Vec<RuleEntry>) -> Result<ReferenceRuleSet> {
    let rules = entries
        .into_iter()
        .map(|entry| entry.into_rule(&name))
        .collect::<Result<Vec<_>>>()?;
    Ok(ReferenceRuleSet {
        test_name: name,
        unit,
        rules,
    })
}

/// First-generation flat entry: a single general range or expected value list
fn flat_rule_set(name: String, info: FlatInfo) -> Result<ReferenceRuleSet> {
    let rule = if let Some(expected) = info.expected {
        ReferenceRule {
            kind: ComparisonKind::Qualitative,
            min: None,
            max: None,
            expected: expected.into_vec(),
            ..ReferenceRule::range("Geral", 0.0, 0.0)
        }
    } else if info.ref_min.is_some() || info.ref_max.is_some() {
        ReferenceRule {
            min: info.ref_min,
            max: info.ref_max,
            ..ReferenceRule::range("Geral", 0.0, 0.0)
        }
    } else {
        return Err(LabError::RuleSchema(format!(
            "{}: legacy entry has neither ref_min/ref_max nor expected",
            name
        )));
    };

    Ok(ReferenceRuleSet {
        test_name: name,
        unit: info.unit,
        rules: vec![rule],
    })
}

fn legacy_entry(name: String, info: Value) -> Result<ReferenceRuleSet> {
    if info.get("references").is_some() {
        let info: ConditionalInfo = serde_json::from_value(info)?;
        rule_set(name, info.unit, info.references)
    } else {
        let info: FlatInfo = serde_json::from_value(info)?;
        flat_rule_set(name, info)
    }
}

fn parse_current(doc: &Value) -> Result<Vec<ReferenceRuleSet>> {
    let schema = compiled_schema()?;
    if let Err(errors) = schema.validate(doc) {
        let messages: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(LabError::RuleSchema(messages.join("; ")));
    }

    let document: ReferenceDocument = serde_json::from_value(doc.clone())?;
    if document.schema_version != REFERENCE_SCHEMA_VERSION {
        return Err(LabError::RuleSchema(format!(
            "unsupported schema_version {} (expected {})",
            document.schema_version, REFERENCE_SCHEMA_VERSION
        )));
    }

    document
        .tests
        .into_iter()
        .map(|t| rule_set(t.name, t.unit, t.references))
        .collect()
}

fn parse_legacy_list(items: Vec<Value>) -> Result<Vec<ReferenceRuleSet>> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let (name, info): (String, Value) = serde_json::from_value(item).map_err(|e| {
                LabError::RuleSchema(format!("entry {} is not a [name, info] pair: {}", i, e))
            })?;
            legacy_entry(name, info)
        })
        .collect()
}

/// Parse reference rules from JSON text in any supported layout.
pub fn parse_reference_table(content: &str) -> Result<ReferenceTable> {
    let doc: Value = serde_json::from_str(content)?;

    let versioned = matches!(&doc, Value::Object(map) if map.contains_key("schema_version"));
    let sets = match doc {
        _ if versioned => parse_current(&doc)?,
        Value::Array(items) => {
            debug!("Adapting legacy list-shaped reference table");
            parse_legacy_list(items)?
        }
        Value::Object(map) => {
            debug!("Adapting legacy map-shaped reference table");
            map.into_iter()
                .map(|(name, info)| legacy_entry(name, info))
                .collect::<Result<Vec<_>>>()?
        }
        _ => {
            return Err(LabError::RuleSchema(
                "reference table must be a JSON object or array".to_string(),
            ))
        }
    };

    let mut table = ReferenceTable::default();
    for set in sets {
        let name = set.test_name.clone();
        if table.insert(set).is_some() {
            warn!(test = %name, "Duplicate reference entry; the later one replaces the earlier");
        }
    }
    Ok(table)
}

pub fn load_reference_table(path: &Path) -> Result<ReferenceTable> {
    let content = fs::read_to_string(path).map_err(|e| {
        LabError::Config(format!(
            "Failed to read reference table '{}': {}",
            path.display(),
            e
        ))
    })?;
    let table = parse_reference_table(&content)?;
    info!(path = %path.display(), tests = table.len(), "Loaded reference table");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_document_is_loaded() {
        let table = parse_reference_table(
            r#"{
                "schema_version": 2,
                "tests": [
                    { "name": "HEMOGLOBINA", "unit": "g/dL", "references": [
                        { "condition": "Homens", "gender": "M", "type": "range", "min": 13.0, "max": 16.5, "priority": 2 },
                        { "condition": "Geral", "min": 12.0, "max": 17.5 }
                    ]},
                    { "name": "HIV", "references": [
                        { "condition": "Geral", "type": "qualitative", "expected": "Não Reagente" }
                    ]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(table.len(), 2);
        let hb = table.get("HEMOGLOBINA").unwrap();
        assert_eq!(hb.unit.as_deref(), Some("g/dL"));
        assert_eq!(hb.rules[0].gender, Some(Gender::Male));
        assert_eq!(hb.rules[0].priority, 2);
        assert_eq!(hb.rules[1].kind, ComparisonKind::Range);

        let hiv = table.get("HIV").unwrap();
        assert_eq!(hiv.rules[0].kind, ComparisonKind::Qualitative);
        assert_eq!(hiv.rules[0].expected, vec!["Não Reagente".to_string()]);
    }

    #[test]
    fn textual_alias_maps_to_open_lower_range() {
        let table = parse_reference_table(
            r#"{"schema_version": 2, "tests": [{ "name": "TSH", "references": [
                { "condition": "Adultos", "type": "textual_range_inclusive_lower_bound", "min": 0.1, "max": 4.0 }
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(table.get("TSH").unwrap().rules[0].kind, ComparisonKind::OpenLowerRange);
    }

    #[test]
    fn schema_violation_is_reported() {
        let err = parse_reference_table(
            r#"{"schema_version": 2, "tests": [{ "name": "TSH", "references": [
                { "condition": "Adultos", "type": "sideways" }
            ]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, LabError::RuleSchema(_)), "{err}");
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = parse_reference_table(r#"{"schema_version": 3, "tests": []}"#).unwrap_err();
        assert!(matches!(err, LabError::RuleSchema(_)));
    }

    #[test]
    fn flat_legacy_list_is_adapted() {
        let table = parse_reference_table(
            r#"[
                ["GLICOSE", {"ref_min": 70, "ref_max": 99, "unit": "mg/dL"}],
                ["HBsAg", {"expected": ["Não Reagente"]}]
            ]"#,
        )
        .unwrap();

        let glicose = table.get("GLICOSE").unwrap();
        assert_eq!(glicose.rules.len(), 1);
        assert_eq!(glicose.rules[0].min, Some(70.0));
        assert_eq!(glicose.rules[0].max, Some(99.0));
        assert!(glicose.rules[0].is_general());

        let hbsag = table.get("HBsAg").unwrap();
        assert_eq!(hbsag.rules[0].kind, ComparisonKind::Qualitative);
    }

    #[test]
    fn conditional_legacy_list_is_adapted() {
        let table = parse_reference_table(
            r#"[["CREATININA", {"unit": "mg/dL", "references": [
                {"condition": "Homens", "gender": "M", "age_min": 18, "min": 0.7, "max": 1.3},
                {"condition": "Mulheres", "gender": "F", "age_min": 18, "min": 0.6, "max": 1.1}
            ]}]]"#,
        )
        .unwrap();
        let set = table.get("CREATININA").unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[1].gender, Some(Gender::Female));
        assert_eq!(set.rules[1].age_min, Some(18));
    }

    #[test]
    fn later_duplicate_replaces_earlier() {
        let table = parse_reference_table(
            r#"[
                ["UREIA", {"ref_min": 10, "ref_max": 40, "unit": "mg/dL"}],
                ["UREIA", {"ref_min": 15, "ref_max": 45, "unit": "mg/dL"}]
            ]"#,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("UREIA").unwrap().rules[0].min, Some(15.0));
    }

    #[test]
    fn legacy_entry_without_bounds_is_rejected() {
        let err = parse_reference_table(r#"[["X", {"unit": "U/L"}]]"#).unwrap_err();
        assert!(matches!(err, LabError::RuleSchema(_)));
    }
}
