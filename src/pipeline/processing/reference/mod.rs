//! Reference rule engine
//!
//! Picks the clinically applicable reference rule for a test given the
//! patient's age and gender, then compares the value against it. Selection is
//! split in two steps so each can be checked on its own: [`rank_rules`]
//! returns a totally ordered candidate list and the engine takes its head;
//! [`compare`] turns the chosen rule and the value into a status.

pub mod loader;

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

use crate::constants::GENERAL_RULE_LABELS;
use crate::types::{Gender, LabValue, PatientContext};

pub use loader::{load_reference_table, parse_reference_table};

/// How gender-scoped rules behave when the patient's gender is unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenderPolicy {
    /// Gender-scoped rules stay applicable
    #[default]
    FailOpen,
    /// Gender-scoped rules are excluded
    Exclude,
}

/// Comparison type declared on a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonKind {
    #[default]
    #[serde(rename = "range")]
    Range,
    #[serde(rename = "min_inclusive")]
    MinOnly,
    #[serde(rename = "max_inclusive")]
    MaxOnly,
    /// Printed on reports as "< X a Y"
    #[serde(
        rename = "range_inclusive_lower_bound",
        alias = "textual_range_inclusive_lower_bound"
    )]
    OpenLowerRange,
    #[serde(rename = "qualitative")]
    Qualitative,
}

/// One scoped entry in a test's reference table
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRule {
    pub condition: String,
    pub gender: Option<Gender>,
    pub age_min: Option<u32>,
    pub age_max: Option<u32>,
    pub kind: ComparisonKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub expected: Vec<String>,
    pub priority: i32,
    pub unit: Option<String>,
}

impl ReferenceRule {
    /// A general range rule with no scoping; handy for building tables in code.
    pub fn range(condition: &str, min: f64, max: f64) -> Self {
        Self {
            condition: condition.to_string(),
            gender: None,
            age_min: None,
            age_max: None,
            kind: ComparisonKind::Range,
            min: Some(min),
            max: Some(max),
            expected: Vec::new(),
            priority: 0,
            unit: None,
        }
    }

    pub fn qualitative(condition: &str, expected: &[&str]) -> Self {
        Self {
            kind: ComparisonKind::Qualitative,
            min: None,
            max: None,
            expected: expected.iter().map(|s| s.to_string()).collect(),
            ..Self::range(condition, 0.0, 0.0)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_gender(mut self, gender: Gender) -> Self {
        self.gender = Some(gender);
        self
    }

    pub fn with_ages(mut self, age_min: Option<u32>, age_max: Option<u32>) -> Self {
        self.age_min = age_min;
        self.age_max = age_max;
        self
    }

    pub fn with_kind(mut self, kind: ComparisonKind) -> Self {
        self.kind = kind;
        self
    }

    /// Applicability predicate. Age bounds are inclusive and fail open when
    /// the patient's age is unknown.
    pub fn is_applicable(&self, patient: &PatientContext, policy: GenderPolicy) -> bool {
        let gender_ok = match (self.gender, patient.gender) {
            (None, _) => true,
            (Some(required), Some(actual)) => required == actual,
            (Some(_), None) => policy == GenderPolicy::FailOpen,
        };
        if !gender_ok {
            return false;
        }

        let Some(age) = patient.age else {
            return true;
        };
        self.age_min.map_or(true, |min| age >= min) && self.age_max.map_or(true, |max| age <= max)
    }

    /// Explicitly labelled general/default, or carrying no gender and no age scope.
    pub fn is_general(&self) -> bool {
        let label = self.condition.trim().to_lowercase();
        GENERAL_RULE_LABELS.contains(&label.as_str())
            || (self.gender.is_none() && self.age_min.is_none() && self.age_max.is_none())
    }

    /// Typed view of the bounds this rule needs for its comparison kind.
    pub fn comparison(&self) -> Result<Comparison<'_>, RuleDefect> {
        match self.kind {
            ComparisonKind::Range => match (self.min, self.max) {
                (Some(min), Some(max)) => Ok(Comparison::Range { min, max }),
                _ => Err(RuleDefect::InvalidRange),
            },
            ComparisonKind::MinOnly => self
                .min
                .map(|min| Comparison::MinOnly { min })
                .ok_or(RuleDefect::InvalidMinimum),
            ComparisonKind::MaxOnly => self
                .max
                .map(|max| Comparison::MaxOnly { max })
                .ok_or(RuleDefect::InvalidMaximum),
            ComparisonKind::OpenLowerRange => match (self.min, self.max) {
                (Some(min), Some(max)) => Ok(Comparison::OpenLowerRange { min, max }),
                _ => Err(RuleDefect::InvalidRange),
            },
            ComparisonKind::Qualitative => {
                if self.expected.is_empty() {
                    Err(RuleDefect::NoExpectedValues)
                } else {
                    Ok(Comparison::Qualitative {
                        expected: &self.expected,
                    })
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparison<'a> {
    Range { min: f64, max: f64 },
    MinOnly { min: f64 },
    MaxOnly { max: f64 },
    OpenLowerRange { min: f64, max: f64 },
    Qualitative { expected: &'a [String] },
}

/// A rule whose declared kind lacks the bounds it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDefect {
    InvalidRange,
    InvalidMinimum,
    InvalidMaximum,
    NoExpectedValues,
}

impl fmt::Display for RuleDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RuleDefect::InvalidRange => "invalid range",
            RuleDefect::InvalidMinimum => "invalid minimum",
            RuleDefect::InvalidMaximum => "invalid maximum",
            RuleDefect::NoExpectedValues => "no expected values defined",
        };
        f.write_str(text)
    }
}

/// All rules declared for one canonical test name, in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRuleSet {
    pub test_name: String,
    pub unit: Option<String>,
    pub rules: Vec<ReferenceRule>,
}

/// Immutable reference configuration, keyed by canonical test name
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    sets: HashMap<String, ReferenceRuleSet>,
}

impl ReferenceTable {
    pub fn new(sets: impl IntoIterator<Item = ReferenceRuleSet>) -> Self {
        let mut table = Self::default();
        for set in sets {
            table.insert(set);
        }
        table
    }

    /// Insert a rule set, returning the one it replaced
    pub fn insert(&mut self, set: ReferenceRuleSet) -> Option<ReferenceRuleSet> {
        self.sets.insert(set.test_name.clone(), set)
    }

    pub fn get(&self, test_name: &str) -> Option<&ReferenceRuleSet> {
        self.sets.get(test_name)
    }

    pub fn contains(&self, test_name: &str) -> bool {
        self.sets.contains_key(test_name)
    }

    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Outcome of comparing a value to its selected rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Below,
    Above,
    Normal,
    /// Value is one of the expected values; `sole` when exactly one was expected
    Match { sole: bool },
    Mismatch,
    Indeterminate,
    UnknownReference,
}

impl Status {
    /// Symbol written to the status column
    pub fn symbol(&self) -> &'static str {
        match self {
            Status::Below => "↓",
            Status::Above => "↑",
            Status::Normal => "",
            Status::Match { sole: true } => "OK",
            Status::Match { sole: false } => "",
            Status::Mismatch => "≠",
            Status::Indeterminate | Status::UnknownReference => "?",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Status::Below => "below",
            Status::Above => "above",
            Status::Normal => "normal",
            Status::Match { .. } => "match",
            Status::Mismatch => "mismatch",
            Status::Indeterminate => "indeterminate",
            Status::UnknownReference => "unknown-reference",
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Why a candidate sits in the ranked list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionBasis {
    Applicable,
    GeneralFallback,
    FirstDeclared,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedRule<'a> {
    /// Position in the declared rule list
    pub index: usize,
    pub rule: &'a ReferenceRule,
    pub basis: SelectionBasis,
}

/// Order the candidate rules for a patient.
///
/// Applicable rules come first, by descending priority and then declaration
/// order. When none apply the list holds the general rules in declaration
/// order followed by the first declared rule. The head is the selection; the
/// list is empty only when `rules` is.
pub fn rank_rules<'a>(
    rules: &'a [ReferenceRule],
    patient: &PatientContext,
    policy: GenderPolicy,
) -> Vec<RankedRule<'a>> {
    let mut ranked: Vec<RankedRule<'a>> = rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.is_applicable(patient, policy))
        .map(|(index, rule)| RankedRule {
            index,
            rule,
            basis: SelectionBasis::Applicable,
        })
        .collect();

    if !ranked.is_empty() {
        ranked.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then(a.index.cmp(&b.index))
        });
        return ranked;
    }

    ranked.extend(
        rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_general())
            .map(|(index, rule)| RankedRule {
                index,
                rule,
                basis: SelectionBasis::GeneralFallback,
            }),
    );
    if let Some(first) = rules.first() {
        if !ranked.iter().any(|r| r.index == 0) {
            ranked.push(RankedRule {
                index: 0,
                rule: first,
                basis: SelectionBasis::FirstDeclared,
            });
        }
    }
    ranked
}

/// Compare a value against one rule. `unit` is the rule's unit or, when it
/// declares none, the test's.
pub fn compare(rule: &ReferenceRule, value: &LabValue, unit: Option<&str>) -> (Status, String) {
    let unit = unit.unwrap_or("");
    let prefix = format!("{}: ", rule.condition);

    let comparison = match rule.comparison() {
        Ok(c) => c,
        Err(defect) => return (Status::Indeterminate, format!("{}{}", prefix, defect)),
    };

    let (status, bounds) = match comparison {
        Comparison::Range { min, max } => (
            numeric_status(value, |n| {
                if n < min {
                    Status::Below
                } else if n > max {
                    Status::Above
                } else {
                    Status::Normal
                }
            }),
            format!("{}-{} {}", min, max, unit),
        ),
        Comparison::MinOnly { min } => (
            numeric_status(value, |n| if n < min { Status::Below } else { Status::Normal }),
            format!(">={} {}", min, unit),
        ),
        Comparison::MaxOnly { max } => (
            numeric_status(value, |n| if n > max { Status::Above } else { Status::Normal }),
            format!("<={} {}", max, unit),
        ),
        Comparison::OpenLowerRange { min, max } => (
            numeric_status(value, |n| {
                if n < min {
                    Status::Below
                } else if n > max {
                    Status::Above
                } else {
                    Status::Normal
                }
            }),
            format!("<{} to {} {}", min, max, unit),
        ),
        Comparison::Qualitative { expected } => {
            let observed = value.to_string().trim().to_uppercase();
            let found = expected
                .iter()
                .any(|e| e.trim().to_uppercase() == observed);
            let status = if found {
                Status::Match {
                    sole: expected.len() == 1,
                }
            } else {
                Status::Mismatch
            };
            (status, expected.join(", "))
        }
    };

    (status, format!("{}{}", prefix, bounds.trim_end()))
}

fn numeric_status(value: &LabValue, classify: impl Fn(f64) -> Status) -> Status {
    match value.as_number() {
        Some(n) => classify(n),
        None => Status::Indeterminate,
    }
}

/// Status plus the human-readable reference for one evaluated value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub status: Status,
    pub reference: String,
    /// Label of the chosen rule, when one was chosen
    pub condition: Option<String>,
    pub basis: Option<SelectionBasis>,
}

impl Evaluation {
    fn unknown() -> Self {
        Self {
            status: Status::UnknownReference,
            reference: "no reference configured".to_string(),
            condition: None,
            basis: None,
        }
    }
}

/// Pure evaluator over an injected reference table
#[derive(Debug, Clone, Copy)]
pub struct ReferenceEngine<'a> {
    table: &'a ReferenceTable,
    policy: GenderPolicy,
}

impl<'a> ReferenceEngine<'a> {
    pub fn new(table: &'a ReferenceTable, policy: GenderPolicy) -> Self {
        Self { table, policy }
    }

    pub fn evaluate(&self, test_name: &str, value: &LabValue, patient: &PatientContext) -> Evaluation {
        let Some(set) = self.table.get(test_name) else {
            return Evaluation::unknown();
        };

        let ranked = rank_rules(&set.rules, patient, self.policy);
        let Some(chosen) = ranked.first() else {
            return Evaluation::unknown();
        };

        let unit = chosen.rule.unit.as_deref().or(set.unit.as_deref());
        let (status, reference) = compare(chosen.rule, value, unit);
        Evaluation {
            status,
            reference,
            condition: Some(chosen.rule.condition.clone()),
            basis: Some(chosen.basis),
        }
    }
}
