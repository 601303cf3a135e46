//! Inbound sample validation.
//!
//! Checks, in order: the caller is a producer; `hr`, `temp` and `eda` are
//! present and numeric; then normalises the optional timestamp and device id.
//! A missing or unparsable timestamp is never a rejection, it is replaced by
//! the server's current time.

use crate::ingest::IngestError;
use crate::model::SensorReading;
use crate::session::Role;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Device id used when a sample does not name its device.
pub const DEFAULT_DEVICE_ID: &str = "ESP32_Unknown";

/// Fields every sample must carry.
pub const REQUIRED_FIELDS: [&str; 3] = ["hr", "temp", "eda"];

/// Where a sample's timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// Taken from the payload
    Payload,
    /// Payload had none (or an unreadable one); server time substituted
    ServerClock,
}

/// A sample that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidSample {
    pub reading: SensorReading,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub device_id: String,
}

/// Validates raw sample payloads.
#[derive(Debug, Clone)]
pub struct IngestValidator {
    default_device_id: String,
}

impl Default for IngestValidator {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ID)
    }
}

impl IngestValidator {
    pub fn new(default_device_id: impl Into<String>) -> Self {
        Self {
            default_device_id: default_device_id.into(),
        }
    }

    /// Validate a sample submitted by a connection holding `role`.
    pub fn validate(&self, role: Role, raw: &Value) -> Result<ValidSample, IngestError> {
        self.validate_at(role, raw, Utc::now())
    }

    /// Like [`validate`](Self::validate) with an explicit "now".
    pub fn validate_at(
        &self,
        role: Role,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<ValidSample, IngestError> {
        if role != Role::Producer {
            return Err(IngestError::Unauthorized(role));
        }

        let reading = read_sensor_fields(raw)?;

        let (timestamp, timestamp_source) = match raw.get("timestamp").and_then(parse_timestamp) {
            Some(ts) => (ts, TimestampSource::Payload),
            None => (now, TimestampSource::ServerClock),
        };

        let device_id = ["device_id", "deviceId"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(device_id_value))
            .unwrap_or_else(|| self.default_device_id.clone());

        Ok(ValidSample {
            reading,
            timestamp,
            timestamp_source,
            device_id,
        })
    }
}

/// Extract `hr`, `temp` and `eda` from a payload.
///
/// Absent or null fields are reported as missing; present fields that do not
/// coerce to a finite number are reported as invalid.
pub fn read_sensor_fields(raw: &Value) -> Result<SensorReading, IngestError> {
    let object = raw.as_object().ok_or(IngestError::NotAnObject)?;

    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    let mut values = [0.0; 3];

    for (slot, name) in values.iter_mut().zip(REQUIRED_FIELDS) {
        match object.get(name) {
            None | Some(Value::Null) => missing.push(name.to_string()),
            Some(value) => match coerce_number(value) {
                Some(number) => *slot = number,
                None => invalid.push(name.to_string()),
            },
        }
    }

    if !missing.is_empty() {
        return Err(IngestError::MissingFields(missing));
    }
    if !invalid.is_empty() {
        return Err(IngestError::InvalidFields(invalid));
    }

    let [hr, temp, eda] = values;
    Ok(SensorReading { hr, temp, eda })
}

/// Numbers and numeric strings that are finite.
pub fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

/// Parse a payload timestamp: epoch seconds (integer or fractional) or an
/// ISO-8601 string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
            DateTime::from_timestamp(whole as i64, nanos)
        }
        Value::String(s) => parse_iso_datetime(s),
        _ => None,
    }
}

/// Parse an ISO-8601 date or date-time.
///
/// Accepts RFC 3339 (a trailing `Z` or an explicit offset), a naive
/// `YYYY-MM-DDTHH:MM:SS[.fff]` (space separator allowed) and a bare
/// `YYYY-MM-DD`. Naive values are taken as UTC.
pub fn parse_iso_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn device_id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn validator() -> IngestValidator {
        IngestValidator::default()
    }

    #[test]
    fn test_non_producer_is_unauthorized() {
        let sample = json!({"hr": 75.5, "temp": 36.2, "eda": 0.45});
        for role in [Role::Observer, Role::Unknown] {
            assert_eq!(
                validator().validate(role, &sample),
                Err(IngestError::Unauthorized(role))
            );
        }
    }

    #[test]
    fn test_missing_fields_listed_exactly() {
        let result = validator().validate(Role::Producer, &json!({"temp": 36.2}));
        assert_eq!(
            result,
            Err(IngestError::MissingFields(vec!["hr".into(), "eda".into()]))
        );

        let result = validator().validate(Role::Producer, &json!({"hr": 70, "temp": null, "eda": 0.4}));
        assert_eq!(result, Err(IngestError::MissingFields(vec!["temp".into()])));
    }

    #[test]
    fn test_non_numeric_fields_are_invalid() {
        let result =
            validator().validate(Role::Producer, &json!({"hr": "fast", "temp": 36.2, "eda": [1]}));
        assert_eq!(
            result,
            Err(IngestError::InvalidFields(vec!["hr".into(), "eda".into()]))
        );
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let sample = validator()
            .validate(Role::Producer, &json!({"hr": "75.5", "temp": 36, "eda": " 0.45 "}))
            .unwrap();
        assert_eq!(
            sample.reading,
            SensorReading {
                hr: 75.5,
                temp: 36.0,
                eda: 0.45
            }
        );
    }

    #[test]
    fn test_payload_must_be_object() {
        assert_eq!(
            validator().validate(Role::Producer, &json!([75.5, 36.2, 0.45])),
            Err(IngestError::NotAnObject)
        );
    }

    #[test]
    fn test_iso_timestamp_with_z_is_utc() {
        let sample = validator()
            .validate(
                Role::Producer,
                &json!({"hr": 75.5, "temp": 36.2, "eda": 0.45, "timestamp": "2024-12-10T10:30:00Z"}),
            )
            .unwrap();
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 12, 10, 10, 30, 0).unwrap()
        );
        assert_eq!(sample.timestamp_source, TimestampSource::Payload);
    }

    #[test]
    fn test_offset_timestamp_is_normalised() {
        let ts = parse_iso_datetime("2024-12-10T17:30:00+07:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 12, 10, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_epoch_timestamp() {
        let ts = parse_timestamp(&json!(1733826600)).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 12, 10, 10, 30, 0).unwrap());

        let ts = parse_timestamp(&json!(1733826600.5)).unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_missing_or_bad_timestamp_uses_server_time() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for raw in [
            json!({"hr": 70, "temp": 36.5, "eda": 0.4}),
            json!({"hr": 70, "temp": 36.5, "eda": 0.4, "timestamp": "yesterday"}),
            json!({"hr": 70, "temp": 36.5, "eda": 0.4, "timestamp": true}),
        ] {
            let sample = validator().validate_at(Role::Producer, &raw, now).unwrap();
            assert_eq!(sample.timestamp, now);
            assert_eq!(sample.timestamp_source, TimestampSource::ServerClock);
        }
    }

    #[test]
    fn test_device_id_defaults_and_aliases() {
        let base = json!({"hr": 70, "temp": 36.5, "eda": 0.4});
        let sample = validator().validate(Role::Producer, &base).unwrap();
        assert_eq!(sample.device_id, DEFAULT_DEVICE_ID);

        let sample = validator()
            .validate(Role::Producer, &json!({"hr": 70, "temp": 36.5, "eda": 0.4, "deviceId": "ESP32_042"}))
            .unwrap();
        assert_eq!(sample.device_id, "ESP32_042");

        let sample = validator()
            .validate(Role::Producer, &json!({"hr": 70, "temp": 36.5, "eda": 0.4, "device_id": "ESP32_001"}))
            .unwrap();
        assert_eq!(sample.device_id, "ESP32_001");
    }

    #[test]
    fn test_date_only_and_naive_formats() {
        assert_eq!(
            parse_iso_datetime("2024-12-01"),
            Some(Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_iso_datetime("2024-12-01T08:15:30.250").map(|t| t.timestamp_subsec_millis()),
            Some(250)
        );
        assert_eq!(parse_iso_datetime("not a date"), None);
    }
}
