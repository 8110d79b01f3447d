//! Value normalization
//!
//! Lab reports print numbers in the pt-BR convention (`1.234,5`). A capture
//! containing a comma is treated as decimal-comma: `.` thousands separators
//! are dropped and the comma becomes the decimal point. Anything that still
//! fails to parse is kept as trimmed text so qualitative results survive.

use crate::types::LabValue;

/// Convert a raw captured string into a number or, failing that, text.
pub fn normalize_value(raw: &str) -> LabValue {
    let trimmed = raw.trim();
    match parse_locale_number(trimmed) {
        Some(n) => LabValue::Number(n),
        None => LabValue::Text(trimmed.to_string()),
    }
}

/// Normalize an already-normalized value. Numbers pass through unchanged and
/// text is re-examined, which makes the operation idempotent.
pub fn renormalize(value: &LabValue) -> LabValue {
    match value {
        LabValue::Number(n) => LabValue::Number(*n),
        LabValue::Text(s) => normalize_value(s),
    }
}

fn parse_locale_number(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }

    let canonical = if s.contains(',') {
        s.replace('.', "").replace(',', ".")
    } else {
        s.to_string()
    };

    // f64::from_str accepts "inf"/"nan"; lab values never mean that
    if !canonical
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return None;
    }

    canonical.parse::<f64>().ok().filter(|n| n.is_finite())
}
