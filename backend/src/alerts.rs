use tracing::info;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::model::{Alert, AlertDraft, AlertKind, Details, Device, Severity, TelemetryReading};
use crate::realtime::{Event, Publisher};
use crate::store::AlertStore;

pub const DEFAULT_FILL_THRESHOLD_PERCENT: f64 = 85.0;
pub const DEFAULT_BATTERY_THRESHOLD_PERCENT: f64 = 15.0;

/// Boundaries a single reading is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Fill alert fires at or above this value.
    pub fill_percent: f64,
    /// Battery alert fires at or below this value.
    pub battery_percent: f64,
    /// Signal alert fires strictly below this value. `None` disables the rule.
    pub signal_strength: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fill_percent: DEFAULT_FILL_THRESHOLD_PERCENT,
            battery_percent: DEFAULT_BATTERY_THRESHOLD_PERCENT,
            signal_strength: None,
        }
    }
}

/// Where thresholds come from: system defaults, optionally overridden per device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertPolicy {
    pub defaults: Thresholds,
    pub use_device_thresholds: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            defaults: Thresholds::default(),
            use_device_thresholds: true,
        }
    }
}

impl AlertPolicy {
    pub fn thresholds_for(&self, device: Option<&Device>) -> Thresholds {
        let mut thresholds = self.defaults;
        if self.use_device_thresholds {
            if let Some(fill) = device.and_then(|d| d.config.fill_alert_threshold_percent) {
                thresholds.fill_percent = fill;
            }
        }
        thresholds
    }
}

type Rule = fn(&TelemetryReading, &Thresholds) -> Option<AlertDraft>;

const RULES: &[Rule] = &[fill_rule, battery_rule, signal_rule];

/// Runs every rule against the reading. Rules are independent, so one reading may raise
/// several alerts. Pure: persistence is up to the caller.
pub fn evaluate(reading: &TelemetryReading, thresholds: &Thresholds) -> Vec<AlertDraft> {
    RULES
        .iter()
        .filter_map(|rule| rule(reading, thresholds))
        .collect()
}

fn fill_rule(reading: &TelemetryReading, thresholds: &Thresholds) -> Option<AlertDraft> {
    let fill = reading.fill_percent?;
    (fill >= thresholds.fill_percent).then(|| {
        draft(
            reading,
            AlertKind::Fill,
            Severity::Critical,
            format!("Fill {}%", fill),
            [("fillPercent", fill), ("threshold", thresholds.fill_percent)],
        )
    })
}

fn battery_rule(reading: &TelemetryReading, thresholds: &Thresholds) -> Option<AlertDraft> {
    let battery = reading.battery_percent?;
    (battery <= thresholds.battery_percent).then(|| {
        draft(
            reading,
            AlertKind::Battery,
            Severity::Warning,
            format!("Battery {}%", battery),
            [
                ("batteryPercent", battery),
                ("threshold", thresholds.battery_percent),
            ],
        )
    })
}

fn signal_rule(reading: &TelemetryReading, thresholds: &Thresholds) -> Option<AlertDraft> {
    let minimum = thresholds.signal_strength?;
    let signal = reading.signal_strength?;
    (signal < minimum).then(|| {
        draft(
            reading,
            AlertKind::Signal,
            Severity::Warning,
            format!("Signal {} dBm", signal),
            [("signalStrength", signal), ("threshold", minimum)],
        )
    })
}

fn draft<const N: usize>(
    reading: &TelemetryReading,
    kind: AlertKind,
    severity: Severity,
    message: String,
    values: [(&str, f64); N],
) -> AlertDraft {
    let details: Details = values
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.into()))
        .collect();

    AlertDraft {
        device_id: reading.device_id.clone(),
        kind,
        severity,
        message,
        details,
    }
}

/// Marks an alert as acknowledged and announces it. Acknowledging twice is a no-op
/// that still returns the alert. A missing alert publishes nothing.
pub async fn acknowledge(
    store: &dyn AlertStore,
    publisher: &dyn Publisher,
    id: Uuid,
) -> Result<Alert> {
    let alert = store
        .acknowledge(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Alert {} not found", id)))?;

    info!(alert_id = %alert.id, device_id = %alert.device_id, "Alert acknowledged");
    publisher.publish(Event::AlertAck(alert.clone()));

    Ok(alert)
}
