use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::alerts::{self, AlertPolicy};
use crate::errors::{Error, Result};
use crate::metrics::{
    ALERTS_RAISED_TOTAL, INGEST_LATENCY_SECONDS, SECONDARY_FAILURES_TOTAL,
    TELEMETRY_ACCEPTED_TOTAL, TELEMETRY_RECEIVED_TOTAL, TELEMETRY_REJECTED_TOTAL,
};
use crate::model::{Acknowledgement, Device, TelemetryReading};
use crate::realtime::{Event, Publisher};
use crate::store::{AlertStore, DeviceRegistry, Stores, TelemetryStore};
use crate::validate::{normalize, NormalizedReading};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestSettings {
    pub policy: AlertPolicy,
    /// Create a minimal device when a reading with a location arrives for an unknown id.
    pub upsert_on_unknown: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            policy: AlertPolicy::default(),
            upsert_on_unknown: true,
        }
    }
}

/// Runs one reading through persistence, registry update, alerting and fan-out.
///
/// Only the telemetry append can fail the call. Everything after it is best-effort:
/// failures are logged, counted and swallowed, and there is no transaction across steps.
#[derive(Clone)]
pub struct IngestPipeline {
    telemetry: Arc<dyn TelemetryStore>,
    devices: Arc<dyn DeviceRegistry>,
    alerts: Arc<dyn AlertStore>,
    publisher: Arc<dyn Publisher>,
    settings: IngestSettings,
}

impl IngestPipeline {
    pub fn new(stores: &Stores, publisher: Arc<dyn Publisher>, settings: IngestSettings) -> Self {
        Self {
            telemetry: stores.telemetry.clone(),
            devices: stores.devices.clone(),
            alerts: stores.alerts.clone(),
            publisher,
            settings,
        }
    }

    pub async fn ingest(&self, device_id: &str, payload: &Value) -> Result<Acknowledgement> {
        TELEMETRY_RECEIVED_TOTAL.inc();
        let timer = INGEST_LATENCY_SECONDS.start_timer();

        let result = self.run(device_id, payload).await;
        timer.observe_duration();

        match &result {
            Ok(_) => TELEMETRY_ACCEPTED_TOTAL.inc(),
            Err(e) => {
                TELEMETRY_REJECTED_TOTAL.inc();
                warn!(device_id, "Rejected telemetry: {}", e);
            }
        }
        result
    }

    async fn run(&self, device_id: &str, payload: &Value) -> Result<Acknowledgement> {
        let object = payload
            .as_object()
            .ok_or_else(|| Error::Validation("Telemetry payload must be a JSON object".into()))?;

        let NormalizedReading { reading, location } = normalize(device_id, object, Utc::now())?;
        let device_id = reading.device_id.clone();

        // Step 1: the only step whose failure reaches the caller.
        let reading = self.telemetry.append(reading).await?;
        debug!(device_id = %device_id, reading_id = %reading.id, "Telemetry stored");

        // Step 2
        let mut device = None;
        if let Some(point) = location {
            match self
                .devices
                .upsert_location(&device_id, point, self.settings.upsert_on_unknown)
                .await
            {
                Ok(Some(updated)) => device = Some(updated),
                Ok(None) => debug!(
                    device_id = %device_id,
                    "Unknown device, location not recorded"
                ),
                Err(e) => secondary_failure("registry", &device_id, &e),
            }
        }

        // Step 3
        self.publisher.publish(Event::Telemetry(reading.clone()));

        // Steps 4 and 5
        let device = match device {
            Some(device) => Some(device),
            None => self.lookup_device(&device_id).await,
        };
        self.raise_alerts(&reading, device.as_ref()).await;

        Ok(Acknowledgement { accepted: true })
    }

    async fn lookup_device(&self, device_id: &str) -> Option<Device> {
        if !self.settings.policy.use_device_thresholds {
            return None;
        }
        match self.devices.get(device_id).await {
            Ok(device) => device,
            Err(e) => {
                secondary_failure("thresholds", device_id, &e);
                None
            }
        }
    }

    async fn raise_alerts(&self, reading: &TelemetryReading, device: Option<&Device>) {
        let thresholds = self.settings.policy.thresholds_for(device);

        for draft in alerts::evaluate(reading, &thresholds) {
            let kind = draft.kind;
            match self.alerts.insert(draft).await {
                Ok(alert) => {
                    ALERTS_RAISED_TOTAL.with_label_values(&[kind.as_str()]).inc();
                    info!(
                        device_id = %alert.device_id,
                        kind = %alert.kind,
                        severity = %alert.severity,
                        "Alert raised: {}",
                        alert.message
                    );
                    self.publisher.publish(Event::Alert(alert));
                }
                Err(e) => secondary_failure("alert", &reading.device_id, &e),
            }
        }
    }
}

fn secondary_failure(step: &str, device_id: &str, err: &Error) {
    SECONDARY_FAILURES_TOTAL.with_label_values(&[step]).inc();
    error!(device_id, step, "Ingestion step failed: {}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Alert, AlertDraft, AlertKind, GeoPoint, Severity, TelemetryStats, TimeRange,
    };
    use crate::realtime::RecordingPublisher;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemoryStore>,
        publisher: RecordingPublisher,
        pipeline: IngestPipeline,
    }

    fn harness(settings: IngestSettings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores {
            telemetry: store.clone(),
            devices: store.clone(),
            alerts: store.clone(),
            users: store.clone(),
        };
        harness_with(store, stores, settings)
    }

    fn harness_with(store: Arc<MemoryStore>, stores: Stores, settings: IngestSettings) -> Harness {
        let publisher = RecordingPublisher::new();
        let pipeline = IngestPipeline::new(&stores, Arc::new(publisher.clone()), settings);
        Harness {
            store,
            publisher,
            pipeline,
        }
    }

    struct BrokenTelemetry;

    #[async_trait]
    impl TelemetryStore for BrokenTelemetry {
        async fn append(&self, _: TelemetryReading) -> Result<TelemetryReading> {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }

        async fn query(&self, _: &str, _: TimeRange, _: usize) -> Result<Vec<TelemetryReading>> {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }

        async fn aggregate(&self, _: &str, _: TimeRange) -> Result<TelemetryStats> {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }
    }

    struct BrokenAlerts;

    #[async_trait]
    impl AlertStore for BrokenAlerts {
        async fn insert(&self, _: AlertDraft) -> Result<Alert> {
            Err(Error::Database(sqlx::Error::PoolClosed))
        }

        async fn list(&self, _: bool, _: usize) -> Result<Vec<Alert>> {
            Ok(Vec::new())
        }

        async fn acknowledge(&self, _: Uuid) -> Result<Option<Alert>> {
            Ok(None)
        }
    }

    async fn alerts_for(store: &MemoryStore) -> Vec<Alert> {
        AlertStore::list(store, false, 100).await.unwrap()
    }

    #[tokio::test]
    async fn test_scenario_a_full_bin_raises_critical_fill_alert() {
        let h = harness(IngestSettings::default());

        let ack = h
            .pipeline
            .ingest("bin-1", &json!({"fillPercent": 90}))
            .await
            .unwrap();
        assert!(ack.accepted);

        let readings = h
            .store
            .query("bin-1", TimeRange::default(), 10)
            .await
            .unwrap();
        assert_eq!(readings.len(), 1);

        let alerts = alerts_for(&h.store).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Fill);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].message, "Fill 90%");
        assert!(!alerts[0].acknowledged);

        assert_eq!(h.publisher.event_names(), vec!["telemetry", "alert"]);
    }

    #[tokio::test]
    async fn test_scenario_b_low_battery_only() {
        let h = harness(IngestSettings::default());

        h.pipeline
            .ingest("bin-2", &json!({"fillPercent": 50, "batteryPercent": 10}))
            .await
            .unwrap();

        let alerts = alerts_for(&h.store).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Battery);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].device_id, "bin-2");
    }

    #[tokio::test]
    async fn test_scenario_c_healthy_reading_only_publishes_telemetry() {
        let h = harness(IngestSettings::default());

        h.pipeline
            .ingest("bin-1", &json!({"fillPercent": 50, "batteryPercent": 50}))
            .await
            .unwrap();

        assert!(alerts_for(&h.store).await.is_empty());
        assert_eq!(h.publisher.event_names(), vec!["telemetry"]);
    }

    #[tokio::test]
    async fn test_scenario_e_stats_over_empty_range() {
        let h = harness(IngestSettings::default());
        h.pipeline
            .ingest("bin-1", &json!({"fillPercent": 10}))
            .await
            .unwrap();

        let future = TimeRange::since(Utc::now() + Duration::days(1));
        let stats = h.store.aggregate("bin-1", future).await.unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.avg_fill, None);
        assert_eq!(stats.max_battery, None);
    }

    #[tokio::test]
    async fn test_round_trip_keeps_fields() {
        let h = harness(IngestSettings::default());
        let before = Utc::now() - Duration::seconds(1);

        h.pipeline
            .ingest(
                "bin-1",
                &json!({
                    "fillPercent": 33.5,
                    "ultrasonicDistanceCm": 61.2,
                    "infraredFlag1": false,
                    "batteryVoltage": 3.9,
                    "batteryPercent": 77,
                    "signalStrength": -70,
                    "firmwareVersion": "2.0.1"
                }),
            )
            .await
            .unwrap();

        let range = TimeRange {
            from: Some(before),
            to: Some(Utc::now() + Duration::seconds(1)),
        };
        let rows = h.store.query("bin-1", range, 10).await.unwrap();
        assert_eq!(rows.len(), 1);

        let r = &rows[0];
        assert_eq!(r.fill_percent, Some(33.5));
        assert_eq!(r.ultrasonic_distance_cm, Some(61.2));
        assert_eq!(r.infrared_flag1, Some(false));
        assert_eq!(r.battery_voltage, Some(3.9));
        assert_eq!(r.battery_percent, Some(77.0));
        assert_eq!(r.signal_strength, Some(-70.0));
        assert_eq!(r.firmware_version.as_deref(), Some("2.0.1"));
        assert!(range.contains(r.timestamp));
    }

    #[tokio::test]
    async fn test_validation_error_stores_nothing() {
        let h = harness(IngestSettings::default());

        let result = h
            .pipeline
            .ingest("bin-1", &json!({"fillPercent": "lots"}))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let empty_id = h.pipeline.ingest("  ", &json!({})).await;
        assert!(matches!(empty_id, Err(Error::Validation(_))));

        let not_object = h.pipeline.ingest("bin-1", &json!([1, 2])).await;
        assert!(matches!(not_object, Err(Error::Validation(_))));

        assert!(h
            .store
            .query("bin-1", TimeRange::default(), 10)
            .await
            .unwrap()
            .is_empty());
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_telemetry_storage_failure_fails_ingestion() {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores {
            telemetry: Arc::new(BrokenTelemetry),
            devices: store.clone(),
            alerts: store.clone(),
            users: store.clone(),
        };
        let h = harness_with(store, stores, IngestSettings::default());

        let result = h.pipeline.ingest("bin-1", &json!({"fillPercent": 99})).await;

        assert!(matches!(result, Err(Error::Database(_))));
        assert!(alerts_for(&h.store).await.is_empty());
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_alert_storage_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores {
            telemetry: store.clone(),
            devices: store.clone(),
            alerts: Arc::new(BrokenAlerts),
            users: store.clone(),
        };
        let h = harness_with(store, stores, IngestSettings::default());

        let ack = h
            .pipeline
            .ingest("bin-1", &json!({"fillPercent": 99}))
            .await
            .unwrap();

        assert!(ack.accepted);
        assert_eq!(h.publisher.event_names(), vec!["telemetry"]);
    }

    #[tokio::test]
    async fn test_location_upserts_unknown_device_by_default() {
        let h = harness(IngestSettings::default());

        h.pipeline
            .ingest(
                "bin-7",
                &json!({"location": {"type": "Point", "coordinates": [-8.61, 41.15]}}),
            )
            .await
            .unwrap();

        let device = DeviceRegistry::get(h.store.as_ref(), "bin-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            device.location,
            Some(GeoPoint {
                longitude: -8.61,
                latitude: 41.15
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_device_not_created_when_upsert_disabled() {
        let h = harness(IngestSettings {
            upsert_on_unknown: false,
            ..IngestSettings::default()
        });

        h.pipeline
            .ingest(
                "bin-7",
                &json!({"location": {"type": "Point", "coordinates": [1.0, 2.0]}}),
            )
            .await
            .unwrap();

        assert!(DeviceRegistry::get(h.store.as_ref(), "bin-7")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_location_is_skipped() {
        let h = harness(IngestSettings::default());

        let ack = h
            .pipeline
            .ingest("bin-7", &json!({"location": {"coordinates": [1.0]}}))
            .await
            .unwrap();

        assert!(ack.accepted);
        assert!(DeviceRegistry::list(h.store.as_ref())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_device_threshold_applies_only_when_enabled() {
        for (use_device_thresholds, expected) in [(true, 1), (false, 0)] {
            let h = harness(IngestSettings {
                policy: AlertPolicy {
                    use_device_thresholds,
                    ..AlertPolicy::default()
                },
                ..IngestSettings::default()
            });

            let mut device = Device::new("bin-3", Utc::now());
            device.config.fill_alert_threshold_percent = Some(60.0);
            DeviceRegistry::create(h.store.as_ref(), device).await.unwrap();

            h.pipeline
                .ingest("bin-3", &json!({"fillPercent": 70}))
                .await
                .unwrap();

            assert_eq!(
                alerts_for(&h.store).await.len(),
                expected,
                "use_device_thresholds = {}",
                use_device_thresholds
            );
        }
    }

    #[test]
    fn test_ingest_blocking_caller() {
        let h = harness(IngestSettings::default());
        let ack = tokio_test::block_on(h.pipeline.ingest("bin-1", &json!({"fillPercent": 1})));
        assert!(ack.unwrap().accepted);
    }
}
