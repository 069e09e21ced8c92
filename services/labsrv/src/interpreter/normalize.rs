//! Result value decision table, status classification and timestamps

use chrono::{Local, NaiveDate, NaiveDateTime};

/// Output format for every stored timestamp
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Literal stored for undetected targets
pub const TARGET_NOT_DETECTED: &str = "Target Not Detected";
/// Literal stored when the titer exceeds the measurable range
pub const ABOVE_RANGE: &str = "> 10000000";
pub const FAILED: &str = "Failed";
pub const INCOMPLETE: &str = "Incomplete";

/// Classification of a raw result before value mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Final,
    Incomplete,
    Error,
}

/// Value and unit as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedValue {
    pub value: String,
    pub unit: String,
}

impl NormalizedValue {
    fn new(value: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            unit: unit.into(),
        }
    }
}

fn is_failure_outcome(outcome: &str) -> bool {
    let outcome = outcome.trim();
    outcome.eq_ignore_ascii_case("failed") || outcome.eq_ignore_ascii_case("invalid")
}

/// Classify by status/flag code and outcome.
///
/// `X` or a failed/invalid outcome is an error, `I`/`R` are incomplete.
pub fn classify(status_code: &str, outcome: &str) -> ResultClass {
    let code = status_code.trim().to_ascii_uppercase();
    if code == "X" || is_failure_outcome(outcome) {
        ResultClass::Error
    } else if code == "I" || code == "R" {
        ResultClass::Incomplete
    } else {
        ResultClass::Final
    }
}

/// First non-empty candidate, trimmed
pub fn first_non_empty<'a>(candidates: &[&'a str]) -> &'a str {
    candidates
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .unwrap_or("")
}

/// Map a raw outcome to the stored value and unit.
///
/// | outcome                                  | value                 | unit            |
/// |------------------------------------------|-----------------------|-----------------|
/// | `Titer`                                  | `numeric`             | first unit      |
/// | `<20`, `< 20`, `Target Not Detected`     | `Target Not Detected` | empty           |
/// | `> Titer max`                            | `> 10000000`          | first unit      |
/// | `Failed`, `Invalid`, `Not Detected`      | outcome as-is         | empty           |
/// | anything else                            | outcome as-is         | first unit      |
pub fn normalize_value(outcome: &str, numeric: &str, units: &[&str]) -> NormalizedValue {
    let outcome = outcome.trim();
    let unit = first_non_empty(units);
    match outcome {
        "Titer" => NormalizedValue::new(numeric.trim(), unit),
        "<20" | "< 20" | TARGET_NOT_DETECTED => NormalizedValue::new(TARGET_NOT_DETECTED, ""),
        "> Titer max" => NormalizedValue::new(ABOVE_RANGE, unit),
        "Failed" | "Invalid" | "Not Detected" => NormalizedValue::new(outcome, ""),
        _ => NormalizedValue::new(outcome, unit),
    }
}

/// Classification first; error and incomplete results short-circuit to
/// fixed literals.
pub fn resolve_value(class: ResultClass, outcome: &str, numeric: &str, units: &[&str]) -> NormalizedValue {
    match class {
        ResultClass::Error => NormalizedValue::new(FAILED, ""),
        ResultClass::Incomplete => NormalizedValue::new(INCOMPLETE, ""),
        ResultClass::Final => normalize_value(outcome, numeric, units),
    }
}

/// Render an instrument timestamp (`YYYYMMDD[HHMM[SS]]`, optional
/// fraction and zone suffix) as `YYYY-MM-DD HH:MM:SS`. Empty or
/// unparsable input yields the current local time.
pub fn format_instrument_timestamp(raw: &str) -> String {
    parse_instrument_timestamp(raw)
        .unwrap_or_else(|| Local::now().naive_local())
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

fn parse_instrument_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.len() {
        14 => NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M%S").ok(),
        12 => NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M").ok(),
        8 => NaiveDate::parse_from_str(&digits, "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_table() {
        let units = ["", "cp/mL", "IU/mL"];
        assert_eq!(
            normalize_value("Titer", "4.5E+03", &units),
            NormalizedValue::new("4.5E+03", "cp/mL")
        );
        for outcome in ["<20", "< 20", "Target Not Detected"] {
            assert_eq!(
                normalize_value(outcome, "", &units),
                NormalizedValue::new(TARGET_NOT_DETECTED, "")
            );
        }
        assert_eq!(
            normalize_value("> Titer max", "", &units).value,
            "> 10000000"
        );
        for outcome in ["Failed", "Invalid", "Not Detected"] {
            assert_eq!(
                normalize_value(outcome, "", &units),
                NormalizedValue::new(outcome, "")
            );
        }
        assert_eq!(
            normalize_value("12345", "", &units),
            NormalizedValue::new("12345", "cp/mL")
        );
    }

    #[test]
    fn test_classification_short_circuits() {
        assert_eq!(classify("X", "12345"), ResultClass::Error);
        assert_eq!(classify("F", "Invalid"), ResultClass::Error);
        assert_eq!(classify("I", "12345"), ResultClass::Incomplete);
        assert_eq!(classify("r", "12345"), ResultClass::Incomplete);
        assert_eq!(classify("F", "12345"), ResultClass::Final);
        assert_eq!(classify("", "Titer"), ResultClass::Final);

        let units = ["cp/mL"];
        assert_eq!(resolve_value(ResultClass::Error, "Titer", "1", &units).value, "Failed");
        assert_eq!(
            resolve_value(ResultClass::Incomplete, "Titer", "1", &units),
            NormalizedValue::new("Incomplete", "")
        );
        assert_eq!(resolve_value(ResultClass::Final, "Titer", "1", &units).value, "1");
    }

    #[test]
    fn test_first_non_empty() {
        assert_eq!(first_non_empty(&["", "  ", "a", "b"]), "a");
        assert_eq!(first_non_empty(&[]), "");
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(format_instrument_timestamp("20240105101502"), "2024-01-05 10:15:02");
        assert_eq!(format_instrument_timestamp("202401051015"), "2024-01-05 10:15:00");
        assert_eq!(format_instrument_timestamp("20240105"), "2024-01-05 00:00:00");
        assert_eq!(
            format_instrument_timestamp("20240105101502.123+0100"),
            "2024-01-05 10:15:02"
        );
    }

    #[test]
    fn test_timestamp_fallback_is_now() {
        for raw in ["", "garbage", "20241345"] {
            let formatted = format_instrument_timestamp(raw);
            assert!(NaiveDateTime::parse_from_str(&formatted, TIMESTAMP_FORMAT).is_ok());
        }
    }
}
