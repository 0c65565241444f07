use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::model::{GeoPoint, TelemetryReading};

/// A device payload after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub reading: TelemetryReading,
    pub location: Option<GeoPoint>,
}

const KNOWN_FIELDS: &[&str] = &[
    "deviceId",
    "timestamp",
    "ts",
    "fillPercent",
    "ultrasonicDistanceCm",
    "ultrasonic_cm",
    "infraredFlag1",
    "ir1",
    "infraredFlag2",
    "ir2",
    "batteryVoltage",
    "battery_voltage",
    "batteryPercent",
    "battery_percent",
    "signalStrength",
    "rssi",
    "firmwareVersion",
    "firmware",
    "location",
];

/// Turns a loose device payload into a reading for `device_id`.
///
/// Missing or `null` fields stay absent and unknown fields are ignored. Numbers may arrive
/// as JSON numbers or numeric strings; anything else in a numeric field is rejected.
/// A malformed `location` is dropped rather than failing the reading.
pub fn normalize(
    device_id: &str,
    payload: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<NormalizedReading> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    let timestamp = match field(payload, &["timestamp", "ts"]) {
        Some(value) => parse_timestamp(value)?,
        None => now,
    };

    let mut reading = TelemetryReading::new(device_id, timestamp);
    reading.fill_percent = number(payload, &["fillPercent"])?;
    reading.ultrasonic_distance_cm = number(payload, &["ultrasonicDistanceCm", "ultrasonic_cm"])?;
    reading.infrared_flag1 = flag(payload, &["infraredFlag1", "ir1"])?;
    reading.infrared_flag2 = flag(payload, &["infraredFlag2", "ir2"])?;
    reading.battery_voltage = number(payload, &["batteryVoltage", "battery_voltage"])?;
    reading.battery_percent = number(payload, &["batteryPercent", "battery_percent"])?;
    reading.signal_strength = number(payload, &["signalStrength", "rssi"])?;
    reading.firmware_version = text(payload, &["firmwareVersion", "firmware"]);

    let location = match payload.get("location") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let point = GeoPoint::from_value(value);
            if point.is_none() {
                warn!(device_id, "Ignoring malformed location: {}", value);
            }
            point
        }
    };

    for key in payload.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            debug!(device_id, "Ignoring unknown telemetry field {}", key);
        }
    }

    Ok(NormalizedReading { reading, location })
}

fn field<'a>(payload: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| payload.get(*name))
        .find(|value| !value.is_null())
}

fn number(payload: &Map<String, Value>, names: &[&str]) -> Result<Option<f64>> {
    let Some(value) = field(payload, names) else {
        return Ok(None);
    };

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(Error::Validation(format!(
            "{} must be a finite number, got {}",
            names[0], value
        ))),
    }
}

fn flag(payload: &Map<String, Value>, names: &[&str]) -> Result<Option<bool>> {
    let Some(value) = field(payload, names) else {
        return Ok(None);
    };

    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Number(n) if n.as_f64() == Some(0.0) => Ok(Some(false)),
        Value::Number(n) if n.as_f64() == Some(1.0) => Ok(Some(true)),
        Value::String(s) if s == "true" => Ok(Some(true)),
        Value::String(s) if s == "false" => Ok(Some(false)),
        other => Err(Error::Validation(format!(
            "{} must be a boolean, got {}",
            names[0], other
        ))),
    }
}

fn text(payload: &Map<String, Value>, names: &[&str]) -> Option<String> {
    match field(payload, names)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// RFC 3339 text or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    let parsed = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    };

    parsed.ok_or_else(|| Error::Validation(format!("Invalid timestamp: {}", value)))
}
