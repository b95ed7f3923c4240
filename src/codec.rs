//! Wire formats of the telemetry document and the twin's desired properties.

use std::num::NonZeroU64;

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::measurement::MeasurementSnapshot;

/// Desired property holding the telemetry cycle in milliseconds.
pub const CADENCE_KEY: &str = "telemetry-cycle-ms";

/// Numbers are pre-rendered so they keep exactly two decimals on the wire.
#[derive(Serialize)]
struct TelemetryDocument {
    temperature: Box<RawValue>,
    temperature_from_humidity: Box<RawValue>,
    temperature_from_pressure: Box<RawValue>,
    humidity: Box<RawValue>,
    pressure: Box<RawValue>,
    #[serde(rename = "capturedAt")]
    captured_at: String,
}

/// Render a snapshot as the JSON telemetry document.
pub fn encode(snapshot: &MeasurementSnapshot) -> Result<String, Error> {
    let document = TelemetryDocument {
        temperature: two_decimals("temperature", snapshot.temperature)?,
        temperature_from_humidity: two_decimals(
            "temperature_from_humidity",
            snapshot.temperature_from_humidity,
        )?,
        temperature_from_pressure: two_decimals(
            "temperature_from_pressure",
            snapshot.temperature_from_pressure,
        )?,
        humidity: two_decimals("humidity", snapshot.humidity)?,
        pressure: two_decimals("pressure", snapshot.pressure)?,
        captured_at: snapshot
            .captured_at
            .to_rfc3339_opts(SecondsFormat::Micros, true),
    };

    Ok(serde_json::to_string(&document)?)
}

fn two_decimals(field: &'static str, value: f64) -> Result<Box<RawValue>, Error> {
    if !value.is_finite() {
        return Err(Error::NonFiniteMeasurement(field));
    }

    Ok(RawValue::from_string(format!("{value:.2}"))?)
}

/// Extract the telemetry cycle from a desired-properties document.
///
/// `Ok(None)` means the update does not touch the cycle, which is the usual
/// case. A `null` value is a property removal and counts as no update too.
pub fn decode_cadence(payload: &str) -> Result<Option<NonZeroU64>, Error> {
    let document: serde_json::Value = serde_json::from_str(payload)?;

    match document.get(CADENCE_KEY) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(NonZeroU64::new)
            .map(Some)
            .ok_or_else(|| Error::InvalidCadence(value.to_string())),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("telemetry-cycle-ms must be a positive integer, got {0}")]
    InvalidCadence(String),

    #[error("{0} is not a finite number")]
    NonFiniteMeasurement(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn snapshot() -> MeasurementSnapshot {
        MeasurementSnapshot {
            temperature: 21.456,
            temperature_from_humidity: 21.456,
            temperature_from_pressure: 20.9,
            humidity: 45.0,
            pressure: 1013.254,
            captured_at: Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap(),
        }
    }

    #[test]
    fn encodes_six_fields_with_two_decimals() {
        let encoded = encode(&snapshot()).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let object = parsed.as_object().unwrap();
        assert_eq!(object.len(), 6);
        assert_eq!(object["temperature"].as_f64(), Some(21.46));
        assert_eq!(object["temperature_from_humidity"].as_f64(), Some(21.46));
        assert_eq!(object["temperature_from_pressure"].as_f64(), Some(20.9));
        assert_eq!(object["humidity"].as_f64(), Some(45.0));
        assert_eq!(object["pressure"].as_f64(), Some(1013.25));

        assert!(encoded.contains(r#""temperature_from_pressure":20.90"#));
        assert!(encoded.contains(r#""humidity":45.00"#));
    }

    #[test]
    fn encodes_utc_timestamp() {
        let encoded = encode(&snapshot()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        let captured_at = parsed["capturedAt"].as_str().unwrap();
        assert_eq!(captured_at, "2024-05-17T08:30:00.000000Z");
        let round_trip: DateTime<Utc> = captured_at.parse().unwrap();
        assert_eq!(round_trip, snapshot().captured_at);
    }

    #[test]
    fn refuses_non_finite_measurements() {
        let mut reading = snapshot();
        reading.humidity = f64::NAN;

        assert!(matches!(
            encode(&reading),
            Err(Error::NonFiniteMeasurement("humidity"))
        ));
    }

    #[test]
    fn cadence_absent_is_no_update() {
        assert_eq!(decode_cadence("{}").unwrap(), None);
        assert_eq!(
            decode_cadence(r#"{"$version": 4, "led": "on"}"#).unwrap(),
            None
        );
        assert_eq!(decode_cadence(r#"{"telemetry-cycle-ms": null}"#).unwrap(), None);
    }

    #[test]
    fn cadence_present_among_other_keys() {
        let decoded = decode_cadence(r#"{"led": "off", "telemetry-cycle-ms": 2000, "$version": 7}"#)
            .unwrap();
        assert_eq!(decoded, NonZeroU64::new(2000));
    }

    #[test]
    fn malformed_payload_is_invalid() {
        assert!(matches!(
            decode_cadence("telemetry-cycle-ms=2000"),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn cadence_must_be_positive_integer() {
        for payload in [
            r#"{"telemetry-cycle-ms": 0}"#,
            r#"{"telemetry-cycle-ms": -5}"#,
            r#"{"telemetry-cycle-ms": 1.5}"#,
            r#"{"telemetry-cycle-ms": "2000"}"#,
        ] {
            assert!(
                matches!(decode_cadence(payload), Err(Error::InvalidCadence(_))),
                "{payload}"
            );
        }
    }
}
