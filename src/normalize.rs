//! Field normalization for registry payloads.
//!
//! The registry validates timestamps against an allowed window and expects
//! plain numeric vitals, while the clinical store delivers naive local
//! datetimes, locale-formatted numeric strings and a combined
//! "systolic/diastolic" blood-pressure field. Everything row-shaped gets
//! funnelled through here before it reaches a payload.

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Earliest instant the registry accepts in a period.
pub fn min_allowed() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2014, 6, 3, 0, 0, 0).unwrap()
}

/// Duration assumed for a visit when no discharge time was recorded.
const FALLBACK_VISIT_HOURS: i64 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unparseable timestamp: {0:?}")]
    UnparseableTimestamp(String),
}

/// Parse a timestamp string in one of the accepted formats, in order:
/// offset-aware ISO-8601, naive ISO-8601, naive `YYYY-MM-DD HH:MM:SS`,
/// then an RFC 3339 fallback. Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, NormalizeError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| NormalizeError::UnparseableTimestamp(raw.to_string()))
}

/// Clamp an instant into the window the registry accepts.
pub fn clamp_to_window(dt: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if dt < min_allowed() {
        min_allowed()
    } else if dt > now {
        now
    } else {
        dt
    }
}

/// Render an instant as ISO-8601 UTC with a trailing `Z`, second precision.
pub fn to_utc_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Encounter period bounds, already clamped and rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub start: String,
    pub end: String,
}

/// Derive the encounter period from raw admission/discharge timestamps.
///
/// An unparseable admission timestamp is a hard error. A missing or
/// unparseable discharge timestamp falls back to admission plus three
/// hours, as does a discharge that precedes admission.
pub fn derive_period(
    admitted_raw: &str,
    discharged_raw: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Period, NormalizeError> {
    let start = clamp_to_window(parse_timestamp(admitted_raw)?, now);

    let fallback_end = || clamp_to_window(start + Duration::hours(FALLBACK_VISIT_HOURS), now);
    let mut end = match discharged_raw {
        Some(raw) => match parse_timestamp(raw) {
            Ok(dt) => clamp_to_window(dt, now),
            Err(_) => {
                warn!("unparseable discharge timestamp {raw:?}, assuming {FALLBACK_VISIT_HOURS}h visit");
                fallback_end()
            }
        },
        None => fallback_end(),
    };
    if end < start {
        end = fallback_end();
    }

    Ok(Period {
        start: to_utc_iso(start),
        end: to_utc_iso(end),
    })
}

/// A measurement value after numeric coercion.
///
/// Genuinely non-numeric input is passed through as text rather than
/// rejected, so a malformed measurement never blocks the remote call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Coerced {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Coerce a locale-formatted numeric string: `,` decimal separators are
/// rewritten to `.`, the result is an integer when no fractional part
/// remains and a float otherwise.
pub fn coerce_numeric(raw: &str) -> Coerced {
    let cleaned = raw.trim().replace(',', ".");
    if cleaned.contains('.') {
        if let Ok(f) = cleaned.parse::<f64>() {
            if f.fract() == 0.0 {
                return Coerced::Int(f as i64);
            }
            return Coerced::Float(f);
        }
    } else if let Ok(i) = cleaned.parse::<i64>() {
        return Coerced::Int(i);
    }
    warn!("non-numeric measurement value passed through unchanged: {raw:?}");
    Coerced::Text(raw.to_string())
}

fn coerce_value(value: &Value) -> Option<Coerced> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Coerced::Int(i))
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 {
                        Coerced::Int(f as i64)
                    } else {
                        Coerced::Float(f)
                    }
                })
            }
        }
        Value::String(s) if !s.trim().is_empty() => Some(coerce_numeric(s)),
        _ => None,
    }
}

/// Vital signs for the visit-completion payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalSigns {
    pub temperature: Coerced,
    pub heart_rate: Coerced,
    pub respiratory_rate: Coerced,
    pub systolic_bp: Coerced,
    pub diastolic_bp: Coerced,
}

impl Default for VitalSigns {
    /// Documented substitution values for measurements absent from the
    /// source data.
    fn default() -> Self {
        Self {
            temperature: Coerced::Int(36),
            heart_rate: Coerced::Int(80),
            respiratory_rate: Coerced::Int(20),
            systolic_bp: Coerced::Int(120),
            diastolic_bp: Coerced::Int(80),
        }
    }
}

/// Keys under which the combined blood-pressure reading has been observed.
const BLOOD_PRESSURE_KEYS: [&str; 3] = ["tekanan_darah", "tekanan-darah", "blood_pressure"];

/// Decompose the physical-exam JSON column into vital signs.
///
/// The column holds a JSON object, occasionally written with single quotes
/// by an older entry form; both spellings are accepted. Any vital absent
/// from the record gets its default so the remote call is never blocked.
pub fn parse_physical_exam(raw: Option<&str>) -> VitalSigns {
    let mut vitals = VitalSigns::default();

    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return vitals;
    };
    let exam: Value = match serde_json::from_str(raw)
        .or_else(|_| serde_json::from_str(&raw.replace('\'', "\"")))
    {
        Ok(value) => value,
        Err(_) => {
            warn!("physical exam record is not valid JSON, using default vitals: {raw:?}");
            return vitals;
        }
    };
    let Some(exam) = exam.as_object() else {
        warn!("physical exam record is not a JSON object, using default vitals");
        return vitals;
    };

    if let Some(v) = exam.get("suhu").and_then(coerce_value) {
        vitals.temperature = v;
    }
    if let Some(v) = exam.get("nadi").and_then(coerce_value) {
        vitals.heart_rate = v;
    }
    if let Some(v) = exam.get("pernapasan").and_then(coerce_value) {
        vitals.respiratory_rate = v;
    }

    let blood_pressure = BLOOD_PRESSURE_KEYS
        .iter()
        .find_map(|key| exam.get(*key))
        .and_then(Value::as_str);
    if let Some((systolic, diastolic)) = blood_pressure.and_then(|bp| bp.split_once('/')) {
        vitals.systolic_bp = coerce_numeric(systolic);
        vitals.diastolic_bp = coerce_numeric(diastolic);
    }

    vitals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 10, 8, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-10T08:30:00+00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-10T08:30:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-10 08:30:00").unwrap(), expected);
    }

    #[test]
    fn test_parse_timestamp_respects_offset() {
        let parsed = parse_timestamp("2024-05-10T08:30:00+07:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 5, 10, 1, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_timestamp_unparseable() {
        assert_eq!(
            parse_timestamp("pertengahan mei").unwrap_err(),
            NormalizeError::UnparseableTimestamp("pertengahan mei".to_string())
        );
    }

    #[test]
    fn test_clamp_raises_to_minimum() {
        let early = Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(clamp_to_window(early, fixed_now()), min_allowed());
        assert_eq!(to_utc_iso(min_allowed()), "2014-06-03T00:00:00Z");
    }

    #[test]
    fn test_clamp_lowers_to_now() {
        let future = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(clamp_to_window(future, fixed_now()), fixed_now());
    }

    #[test]
    fn test_clamp_passes_in_window_value() {
        let ok = Utc.with_ymd_and_hms(2024, 5, 10, 8, 30, 0).unwrap();
        assert_eq!(clamp_to_window(ok, fixed_now()), ok);
    }

    #[test]
    fn test_period_with_discharge() {
        let period =
            derive_period("2024-05-10 08:30:00", Some("2024-05-10 11:00:00"), fixed_now()).unwrap();
        assert_eq!(period.start, "2024-05-10T08:30:00Z");
        assert_eq!(period.end, "2024-05-10T11:00:00Z");
    }

    #[test]
    fn test_period_without_discharge_is_start_plus_three_hours() {
        let period = derive_period("2024-05-10 08:30:00", None, fixed_now()).unwrap();
        assert_eq!(period.end, "2024-05-10T11:30:00Z");
    }

    #[test]
    fn test_period_discharge_before_admission_is_forced_forward() {
        let period =
            derive_period("2024-05-10 08:30:00", Some("2024-05-09 23:00:00"), fixed_now()).unwrap();
        assert_eq!(period.start, "2024-05-10T08:30:00Z");
        assert_eq!(period.end, "2024-05-10T11:30:00Z");
    }

    #[test]
    fn test_period_unparseable_admission_is_an_error() {
        assert!(derive_period("kemarin", None, fixed_now()).is_err());
    }

    #[test]
    fn test_period_unparseable_discharge_falls_back() {
        let period = derive_period("2024-05-10 08:30:00", Some("besok"), fixed_now()).unwrap();
        assert_eq!(period.end, "2024-05-10T11:30:00Z");
    }

    #[test]
    fn test_coerce_integer() {
        assert_eq!(coerce_numeric("110"), Coerced::Int(110));
        assert_eq!(coerce_numeric(" 98 "), Coerced::Int(98));
    }

    #[test]
    fn test_coerce_comma_decimal() {
        assert_eq!(coerce_numeric("120,5"), Coerced::Float(120.5));
        assert_eq!(coerce_numeric("36.8"), Coerced::Float(36.8));
    }

    #[test]
    fn test_coerce_trailing_zero_fraction_is_integer() {
        assert_eq!(coerce_numeric("36,0"), Coerced::Int(36));
    }

    #[test]
    fn test_coerce_non_numeric_passes_through() {
        assert_eq!(coerce_numeric("tinggi"), Coerced::Text("tinggi".to_string()));
    }

    #[test]
    fn test_vitals_blood_pressure_split() {
        let vitals = parse_physical_exam(Some(r#"{"tekanan_darah": "110/70"}"#));
        assert_eq!(vitals.systolic_bp, Coerced::Int(110));
        assert_eq!(vitals.diastolic_bp, Coerced::Int(70));
    }

    #[test]
    fn test_vitals_blood_pressure_comma_decimal() {
        let vitals = parse_physical_exam(Some(r#"{"tekanan_darah": "120,5/80"}"#));
        assert_eq!(vitals.systolic_bp, Coerced::Float(120.5));
        assert_eq!(vitals.diastolic_bp, Coerced::Int(80));
    }

    #[test]
    fn test_vitals_missing_measurements_get_defaults() {
        let vitals = parse_physical_exam(Some(r#"{"nadi": "72"}"#));
        assert_eq!(vitals.heart_rate, Coerced::Int(72));
        assert_eq!(vitals.temperature, Coerced::Int(36));
        assert_eq!(vitals.respiratory_rate, Coerced::Int(20));
        assert_eq!(vitals.systolic_bp, Coerced::Int(120));
        assert_eq!(vitals.diastolic_bp, Coerced::Int(80));
    }

    #[test]
    fn test_vitals_single_quoted_pseudo_json() {
        let vitals = parse_physical_exam(Some("{'suhu': '37,2', 'pernapasan': 18}"));
        assert_eq!(vitals.temperature, Coerced::Float(37.2));
        assert_eq!(vitals.respiratory_rate, Coerced::Int(18));
    }

    #[test]
    fn test_vitals_garbage_record_uses_defaults() {
        assert_eq!(parse_physical_exam(Some("not json at all")), VitalSigns::default());
        assert_eq!(parse_physical_exam(Some("[1, 2]")), VitalSigns::default());
        assert_eq!(parse_physical_exam(None), VitalSigns::default());
    }

    #[test]
    fn test_vitals_alternate_blood_pressure_keys() {
        let vitals = parse_physical_exam(Some(r#"{"blood_pressure": "130/85"}"#));
        assert_eq!(vitals.systolic_bp, Coerced::Int(130));
        assert_eq!(vitals.diastolic_bp, Coerced::Int(85));
    }

    #[test]
    fn test_coerced_serializes_untagged() {
        let vitals = VitalSigns::default();
        let json = serde_json::to_value(&vitals).unwrap();
        assert_eq!(json["temperature"], 36);
        assert_eq!(json["systolic_bp"], 120);
    }
}
