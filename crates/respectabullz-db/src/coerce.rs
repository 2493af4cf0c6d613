//! Field coercion from loosely typed snapshot values to column values.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use thiserror::Error;

use crate::collections::FieldKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot read {value} as {expected}")]
pub struct CoercionError {
    pub expected: &'static str,
    pub value: String,
}

impl CoercionError {
    fn new(expected: &'static str, value: &Value) -> Self {
        let mut value = value.to_string();
        if value.len() > 80 {
            let mut end = 77;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            value.truncate(end);
            value.push_str("...");
        }
        Self { expected, value }
    }
}

/// Shapes a legacy date field is found in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DateInput<'a> {
    Absent,
    Text(&'a str),
    EpochMillis(i64),
    /// `{"$date": ...}` as written by some serializers.
    Tagged(&'a Value),
    Unsupported(&'a Value),
}

impl<'a> DateInput<'a> {
    pub fn from_value(value: Option<&'a Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::String(text)) if text.trim().is_empty() => Self::Absent,
            Some(Value::String(text)) => Self::Text(text.trim()),
            Some(number @ Value::Number(n)) => match n.as_i64() {
                Some(millis) => Self::EpochMillis(millis),
                #[allow(clippy::cast_possible_truncation)]
                None => n
                    .as_f64()
                    .filter(|millis| millis.is_finite())
                    .map_or(Self::Unsupported(number), |millis| {
                        Self::EpochMillis(millis.trunc() as i64)
                    }),
            },
            Some(Value::Object(map)) if map.len() == 1 && map.contains_key("$date") => {
                map.get("$date").map_or(Self::Absent, Self::Tagged)
            }
            Some(other) => Self::Unsupported(other),
        }
    }
}

/// Shapes a legacy boolean field is found in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoolInput<'a> {
    Absent,
    Bool(bool),
    Number(f64),
    Text(&'a str),
    Unsupported(&'a Value),
}

impl<'a> BoolInput<'a> {
    pub fn from_value(value: Option<&'a Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::Bool(flag)) => Self::Bool(*flag),
            Some(number @ Value::Number(n)) => {
                n.as_f64().map_or(Self::Unsupported(number), Self::Number)
            }
            Some(Value::String(text)) if text.trim().is_empty() => Self::Absent,
            Some(Value::String(text)) => Self::Text(text.trim()),
            Some(other) => Self::Unsupported(other),
        }
    }
}

pub fn canonical_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Canonical RFC 3339 UTC form of a legacy date, `None` when absent.
///
/// # Errors
/// Returns an error for values that are present but not a recognizable date.
pub fn coerce_date(input: DateInput<'_>) -> Result<Option<String>, CoercionError> {
    match input {
        DateInput::Absent => Ok(None),
        DateInput::Text(text) => parse_date_text(text)
            .map(|instant| Some(canonical_timestamp(instant)))
            .ok_or_else(|| CoercionError {
                expected: "date",
                value: text.to_string(),
            }),
        DateInput::EpochMillis(millis) => from_epoch_millis(millis)
            .map(|instant| Some(canonical_timestamp(instant)))
            .ok_or_else(|| CoercionError {
                expected: "date",
                value: millis.to_string(),
            }),
        DateInput::Tagged(inner) => match DateInput::from_value(Some(inner)) {
            DateInput::Tagged(nested) => Err(CoercionError::new("date", nested)),
            unwrapped => coerce_date(unwrapped),
        },
        DateInput::Unsupported(value) => Err(CoercionError::new("date", value)),
    }
}

/// Shorter digit strings are compact dates or counters, not epoch millis.
const MIN_EPOCH_MILLIS_DIGITS: usize = 11;

fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }

    if text.len() >= MIN_EPOCH_MILLIS_DIGITS && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse::<i64>().ok().and_then(from_epoch_millis);
    }

    None
}

fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Legacy boolean as a flag, `None` when absent.
///
/// # Errors
/// Returns an error for values that are present but not a recognizable boolean.
pub fn coerce_bool(input: BoolInput<'_>) -> Result<Option<bool>, CoercionError> {
    match input {
        BoolInput::Absent => Ok(None),
        BoolInput::Bool(flag) => Ok(Some(flag)),
        BoolInput::Number(number) if number == 0.0 => Ok(Some(false)),
        BoolInput::Number(number) if (number - 1.0).abs() < f64::EPSILON => Ok(Some(true)),
        BoolInput::Number(number) => Err(CoercionError {
            expected: "boolean",
            value: number.to_string(),
        }),
        BoolInput::Text(text) => match text.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "n" | "off" | "0" => Ok(Some(false)),
            _ => Err(CoercionError {
                expected: "boolean",
                value: text.to_string(),
            }),
        },
        BoolInput::Unsupported(value) => Err(CoercionError::new("boolean", value)),
    }
}

/// # Errors
/// Returns an error for objects and arrays.
pub fn coerce_text(value: Option<&Value>) -> Result<Option<String>, CoercionError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(other) => Err(CoercionError::new("text", other)),
    }
}

/// # Errors
/// Returns an error for values with a fractional part or no numeric reading.
pub fn coerce_integer(value: Option<&Value>) -> Result<Option<i64>, CoercionError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().and_then(whole_number))
            .map(Some)
            .ok_or_else(|| CoercionError::new("integer", &Value::Number(number.clone()))),
        Some(raw @ Value::String(text)) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(whole_number))
                .map(Some)
                .ok_or_else(|| CoercionError::new("integer", raw))
        }
        Some(other) => Err(CoercionError::new("integer", other)),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn whole_number(number: f64) -> Option<i64> {
    let in_range = number.is_finite() && number.fract() == 0.0 && number.abs() < 9.0e15;
    in_range.then_some(number as i64)
}

/// # Errors
/// Returns an error for values with no numeric reading.
pub fn coerce_real(value: Option<&Value>) -> Result<Option<f64>, CoercionError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(raw @ Value::Number(number)) => number
            .as_f64()
            .map(Some)
            .ok_or_else(|| CoercionError::new("number", raw)),
        Some(raw @ Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .map(Some)
            .ok_or_else(|| CoercionError::new("number", raw)),
        Some(other) => Err(CoercionError::new("number", other)),
    }
}

/// Strings verbatim, other values serialized.
pub fn coerce_json(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Column value for `kind`, `None` when the snapshot carries nothing usable.
///
/// Identifier and timestamp defaults are the caller's concern.
///
/// # Errors
/// Returns the coercion failure for present but unreadable values.
pub fn coerce_field(
    kind: FieldKind,
    value: Option<&Value>,
) -> Result<Option<SqlValue>, CoercionError> {
    let coerced = match kind {
        FieldKind::Id | FieldKind::Text | FieldKind::DeferredRef(_) | FieldKind::SoftRef(_) => {
            coerce_text(value)?.map(SqlValue::Text)
        }
        FieldKind::Integer => coerce_integer(value)?.map(SqlValue::Integer),
        FieldKind::Real => coerce_real(value)?.map(SqlValue::Real),
        FieldKind::Date | FieldKind::Timestamp => {
            coerce_date(DateInput::from_value(value))?.map(SqlValue::Text)
        }
        FieldKind::Bool => coerce_bool(BoolInput::from_value(value))?
            .map(|flag| SqlValue::Integer(i64::from(flag))),
        FieldKind::Json => coerce_json(value).map(SqlValue::Text),
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(value: &Value) -> Result<Option<String>, CoercionError> {
        coerce_date(DateInput::from_value(Some(value)))
    }

    fn flag(value: &Value) -> Result<Option<bool>, CoercionError> {
        coerce_bool(BoolInput::from_value(Some(value)))
    }

    #[test]
    fn dates_normalize_to_utc_millis() {
        let expected = Some("2024-03-01T00:00:00.000Z".to_string());
        assert_eq!(date(&json!("2024-03-01T00:00:00Z")), Ok(expected.clone()));
        assert_eq!(date(&json!("2024-03-01T02:00:00+02:00")), Ok(expected.clone()));
        assert_eq!(date(&json!("2024-03-01T00:00:00.000")), Ok(expected.clone()));
        assert_eq!(date(&json!("2024-03-01 00:00:00")), Ok(expected.clone()));
        assert_eq!(date(&json!("2024-03-01")), Ok(expected.clone()));
        assert_eq!(date(&json!("03/01/2024")), Ok(expected.clone()));
        assert_eq!(date(&json!(1_709_251_200_000_i64)), Ok(expected.clone()));
        assert_eq!(date(&json!("1709251200000")), Ok(expected.clone()));
        assert_eq!(date(&json!({"$date": "2024-03-01T00:00:00.000Z"})), Ok(expected));
    }

    #[test]
    fn absent_dates_are_none() {
        assert_eq!(coerce_date(DateInput::from_value(None)), Ok(None));
        assert_eq!(date(&Value::Null), Ok(None));
        assert_eq!(date(&json!("   ")), Ok(None));
    }

    #[test]
    fn unreadable_dates_are_rejected() {
        assert!(date(&json!("next tuesday")).is_err());
        assert!(date(&json!("2024-13-45")).is_err());
        assert!(date(&json!("20240301")).is_err());
        assert!(date(&json!("42")).is_err());
        assert!(date(&json!(true)).is_err());
        assert!(date(&json!(["2024-03-01"])).is_err());
    }

    #[test]
    fn booleans_accept_common_spellings() {
        for truthy in [json!(true), json!(1), json!("YES"), json!("on"), json!("1"), json!("y")] {
            assert_eq!(flag(&truthy), Ok(Some(true)), "{truthy}");
        }
        for falsy in [json!(false), json!(0), json!("No"), json!("off"), json!("0"), json!("n")] {
            assert_eq!(flag(&falsy), Ok(Some(false)), "{falsy}");
        }
        assert_eq!(flag(&Value::Null), Ok(None));
        assert!(flag(&json!(2)).is_err());
        assert!(flag(&json!("maybe")).is_err());
        assert!(flag(&json!({})).is_err());
    }

    #[test]
    fn numbers_and_text() {
        assert_eq!(coerce_integer(Some(&json!(7))), Ok(Some(7)));
        assert_eq!(coerce_integer(Some(&json!(7.0))), Ok(Some(7)));
        assert_eq!(coerce_integer(Some(&json!(" 12 "))), Ok(Some(12)));
        assert!(coerce_integer(Some(&json!(7.5))).is_err());
        assert_eq!(coerce_real(Some(&json!("42.5"))), Ok(Some(42.5)));
        assert!(coerce_real(Some(&json!("heavy"))).is_err());
        assert_eq!(coerce_text(Some(&json!(12))), Ok(Some("12".to_string())));
        assert!(coerce_text(Some(&json!({"a": 1}))).is_err());
    }

    #[test]
    fn json_blobs_keep_strings_verbatim() {
        assert_eq!(
            coerce_json(Some(&json!("{\"akc\":\"x\"}"))),
            Some("{\"akc\":\"x\"}".to_string())
        );
        assert_eq!(coerce_json(Some(&json!({"akc": "x"}))), Some("{\"akc\":\"x\"}".to_string()));
        assert_eq!(coerce_json(Some(&Value::Null)), None);
    }

    #[test]
    fn field_kinds_map_to_sql_values() -> Result<(), CoercionError> {
        assert_eq!(coerce_field(FieldKind::Bool, Some(&json!("yes")))?, Some(SqlValue::Integer(1)));
        assert_eq!(
            coerce_field(FieldKind::Date, Some(&json!("2024-03-01")))?,
            Some(SqlValue::Text("2024-03-01T00:00:00.000Z".to_string()))
        );
        assert_eq!(coerce_field(FieldKind::Real, Some(&json!(3)))?, Some(SqlValue::Real(3.0)));
        assert_eq!(coerce_field(FieldKind::Timestamp, None)?, None);
        Ok(())
    }

    #[test]
    fn long_values_are_truncated_in_errors() {
        let long = json!("x".repeat(200));
        let err = CoercionError::new("date", &long);
        assert!(err.value.ends_with("..."));
        assert!(err.value.len() <= 80);
    }
}
