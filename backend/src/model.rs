use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One sensor sample from a bin. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub id: Uuid,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ultrasonic_distance_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrared_flag1: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrared_flag2: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

impl TelemetryReading {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            timestamp,
            fill_percent: None,
            ultrasonic_distance_cm: None,
            infrared_flag1: None,
            infrared_flag2: None,
            battery_voltage: None,
            battery_percent: None,
            signal_strength: None,
            firmware_version: None,
        }
    }
}

/// Geographic point, GeoJSON on the wire: `{"type":"Point","coordinates":[lng,lat]}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "GeoJsonPoint", try_from = "GeoJsonPoint")]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeoJsonPoint {
    #[serde(rename = "type", default = "point_type")]
    kind: String,
    coordinates: Vec<f64>,
}

fn point_type() -> String {
    "Point".to_string()
}

impl From<GeoPoint> for GeoJsonPoint {
    fn from(p: GeoPoint) -> Self {
        Self {
            kind: point_type(),
            coordinates: vec![p.longitude, p.latitude],
        }
    }
}

impl TryFrom<GeoJsonPoint> for GeoPoint {
    type Error = String;

    fn try_from(raw: GeoJsonPoint) -> Result<Self, Self::Error> {
        match raw.coordinates.as_slice() {
            [lng, lat] if lng.is_finite() && lat.is_finite() => Ok(GeoPoint {
                longitude: *lng,
                latitude: *lat,
            }),
            _ => Err("location.coordinates must be [longitude, latitude]".to_string()),
        }
    }
}

impl GeoPoint {
    /// Accepts any value shaped like a GeoJSON point with two finite numeric coordinates.
    pub fn from_value(value: &Value) -> Option<Self> {
        let coords = value.get("coordinates")?.as_array()?;
        match coords.as_slice() {
            [lng, lat] => {
                let longitude = lng.as_f64()?;
                let latitude = lat.as_f64()?;
                (longitude.is_finite() && latitude.is_finite()).then_some(GeoPoint {
                    longitude,
                    latitude,
                })
            }
            _ => None,
        }
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
}

string_enum!(DeviceStatus {
    Active => "active",
    Inactive => "inactive",
    Maintenance => "maintenance",
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_interval_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_alert_threshold_percent: Option<f64>,
    /// Only ever returned by token rotation.
    #[serde(skip_serializing)]
    pub device_auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub location: Option<GeoPoint>,
    pub status: DeviceStatus,
    pub config: DeviceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Minimal registry row, as created by a location upsert for an unknown id.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: None,
            location: None,
            status: DeviceStatus::Active,
            config: DeviceConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Fill,
    Battery,
    Signal,
    Offline,
}

string_enum!(AlertKind {
    Fill => "fill",
    Battery => "battery",
    Signal => "signal",
    Offline => "offline",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

string_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

/// Scalar value in an open-ended details map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Number(v)
    }
}

pub type Details = BTreeMap<String, Scalar>;

/// Alert content produced by the alert engine, before it gets an id and a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDraft {
    pub device_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub details: Details,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub acknowledged: bool,
    #[serde(default)]
    pub details: Details,
}

impl Alert {
    pub fn from_draft(draft: AlertDraft, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: draft.device_id,
            timestamp,
            kind: draft.kind,
            severity: draft.severity,
            message: draft.message,
            acknowledged: false,
            details: draft.details,
        }
    }

    /// One-way: there is no transition back to unacknowledged.
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    #[default]
    Viewer,
}

string_enum!(Role {
    Admin => "admin",
    Operator => "operator",
    Viewer => "viewer",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub name: Option<String>,
}

/// Partial user update; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub role: Option<Role>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token_hash: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Inclusive timestamp bounds; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }
}

/// Aggregate over fill and battery percentages. Empty ranges yield `count: 0` and nulls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    pub avg_fill: Option<f64>,
    pub min_fill: Option<f64>,
    pub max_fill: Option<f64>,
    pub avg_battery: Option<f64>,
    pub min_battery: Option<f64>,
    pub max_battery: Option<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub accepted: bool,
}
