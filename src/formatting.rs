//! formatting helpers available in alert templates
//!
//! All helpers take the string representation of a value as it appears in
//! alert labels and annotations and turn it into something human readable.

use std::num::ParseFloatError;

use chrono::{format::StrftimeItems, format::Item, DateTime};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use thiserror::Error;

/// units for [format_byte_scale], subdivided by 1024
pub const BYTE_UNITS: [&str; 8] = ["Kb", "Mb", "Gb", "Tb", "Pb", "Eb", "Zb", "Yb"];

/// units for [format_decimal_scale], subdivided by 1000
pub const DECIMAL_UNITS: [&str; 9] = ["", "K", "M", "G", "T", "P", "E", "Z", "Y"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("could not parse {value:?} as number")]
    NumericParse {
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("template time zone is not set but required by str_FormatDate")]
    MissingTimeZone,
    #[error("template time output format is not set but required by str_FormatDate")]
    MissingLayout,
    #[error("invalid time output format {0:?}")]
    InvalidLayout(String),
}

fn parse_number(value: &str) -> Result<f64, FormatError> {
    value.trim().parse().map_err(|source| FormatError::NumericParse {
        value: value.to_owned(),
        source,
    })
}

/// round `x` to `precision` decimal places, halves away from zero
pub fn round_half_away_from_zero(x: f64, precision: i32) -> f64 {
    if x.is_nan() || x.is_infinite() {
        return x;
    }

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let pow = 10f64.powi(precision);
    let intermediate = x.abs() * pow;

    let rounded = if intermediate.fract() >= 0.5 {
        intermediate.ceil()
    } else {
        intermediate.floor()
    };

    rounded / pow * sign
}

/// divide by `divisor` until the value fits the unit, starting at `start_unit`
fn format_scaled(value: f64, start_unit: usize, divisor: f64, units: &[&str]) -> String {
    let top = units.len() - 1;
    let mut value = value;
    let mut unit = start_unit.min(top);

    while value.abs() >= divisor && unit < top {
        value /= divisor;
        unit += 1;
    }

    match units[unit] {
        "" => format!("{value:.2}"),
        suffix => format!("{value:.2} {suffix}"),
    }
}

/// scale a byte count: `1023` → `1023.00 Kb`, `1024` → `1.00 Mb`
pub fn format_byte_scale(value: &str, start_unit: usize) -> Result<String, FormatError> {
    Ok(format_scaled(parse_number(value)?, start_unit, 1024.0, &BYTE_UNITS))
}

/// scale with si prefixes: `1500` → `1.50 K`
pub fn format_decimal_scale(value: &str, start_unit: usize) -> Result<String, FormatError> {
    Ok(format_scaled(parse_number(value)?, start_unit, 1000.0, &DECIMAL_UNITS))
}

/// truncate to an integer, unparseable input becomes `0`
pub fn format_integer(value: &str) -> String {
    let value = value.trim();

    if let Ok(int) = value.parse::<i64>() {
        return int.to_string();
    }

    match value.parse::<f64>() {
        Ok(float) if float.is_finite() => (float.trunc() as i64).to_string(),
        _ => "0".to_owned(),
    }
}

/// round to two decimal places, unparseable input becomes `0`
pub fn format_float(value: &str) -> String {
    let value = value.trim().parse::<f64>().unwrap_or_default();

    round_half_away_from_zero(value, 2).to_string()
}

/// Format `value` according to `unit_spec`.
///
/// `unit_spec` is split by `split_token` into up to three parts:
/// the kind of formatting (`kb`, `s`, `f`, `i`), a suffix appended verbatim
/// and the index of the unit scaling starts at.
///
/// `s|m|1` formats `1500` as `1.50 Mm`.
pub fn format_measure_unit(
    unit_spec: &str,
    value: &str,
    split_token: &str,
) -> Result<String, FormatError> {
    let unit_spec = unit_spec.trim();
    let parts: Vec<&str> = if split_token.is_empty() {
        vec![unit_spec]
    } else {
        unit_spec.splitn(3, split_token).collect()
    };

    let start_unit = match parts.get(2) {
        Some(start) => start.trim().parse::<usize>().unwrap_or_else(|_| {
            tracing::warn!(start, "could not convert start unit to int, starting at 0");
            0
        }),
        None => 0,
    };

    let mut formatted = match parts[0] {
        "kb" => format_byte_scale(value, start_unit)?,
        "s" => format_decimal_scale(value, start_unit)?,
        "f" => format_float(value),
        _ => format_integer(value),
    };

    if let Some(suffix) = parts.get(1) {
        formatted.push_str(suffix);
    }

    Ok(formatted)
}

/// Convert an rfc3339 `timestamp` into `time_zone` and format it with the
/// strftime `layout`.
///
/// Both `time_zone` and `layout` are mandatory. Unknown time zones fall back
/// to utc and unparseable timestamps are returned unchanged.
pub fn format_date(timestamp: &str, time_zone: &str, layout: &str) -> Result<String, FormatError> {
    if time_zone.is_empty() {
        return Err(FormatError::MissingTimeZone);
    }

    if layout.is_empty() {
        return Err(FormatError::MissingLayout);
    }

    let items: Vec<Item> = StrftimeItems::new(layout).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(FormatError::InvalidLayout(layout.to_owned()));
    }

    let time_zone: Tz = time_zone.parse().unwrap_or_else(|err| {
        tracing::warn!(time_zone, "unknown time zone, using UTC: {err}");
        Tz::UTC
    });

    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(time) => Ok(time.with_timezone(&time_zone).format_with_items(items.into_iter()).to_string()),
        Err(err) => {
            tracing::warn!(timestamp, "could not parse timestamp: {err}");
            Ok(timestamp.to_owned())
        }
    }
}

/// capitalize the first letter of every word, words are separated by
/// anything but letters, digits and underscores
pub fn title_case(value: &str) -> String {
    let mut title = String::with_capacity(value.len());
    let mut word_start = true;

    for c in value.chars() {
        if word_start {
            title.extend(c.to_uppercase());
        } else {
            title.push(c);
        }
        word_start = !(c.is_alphanumeric() || c == '_');
    }

    title
}

/// check if `map` contains `key`. Anything but an object doesn't contain any
/// key, and a `null` value counts as missing.
pub fn has_key(map: &Value, key: &str) -> bool {
    map.as_object()
        .and_then(|map: &Map<String, Value>| map.get(key))
        .map_or(false, |value| !value.is_null())
}
