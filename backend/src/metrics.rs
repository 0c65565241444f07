use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref TELEMETRY_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "smartbins_telemetry_received_total",
        "Total telemetry payloads received over HTTP and MQTT"
    ))
    .unwrap();
    pub static ref TELEMETRY_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "smartbins_telemetry_accepted_total",
        "Total readings persisted"
    ))
    .unwrap();
    pub static ref TELEMETRY_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "smartbins_telemetry_rejected_total",
        "Total payloads rejected by validation or storage"
    ))
    .unwrap();
    pub static ref ALERTS_RAISED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("smartbins_alerts_raised_total", "Total alerts persisted, by kind"),
        &["kind"]
    )
    .unwrap();
    pub static ref SECONDARY_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "smartbins_ingest_secondary_failures_total",
            "Failures in best-effort ingestion steps, by step"
        ),
        &["step"]
    )
    .unwrap();
    pub static ref EVENTS_PUBLISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("smartbins_events_published_total", "Total fan-out events, by name"),
        &["event"]
    )
    .unwrap();
    pub static ref SOCKET_SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "smartbins_socket_subscribers",
        "Currently connected dashboard sockets"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "smartbins_ingest_latency_seconds",
            "Time taken to run the ingestion pipeline for one reading"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "smartbins_mqtt_channel_full_total",
        "Total number of times the MQTT ingest channel was full"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(register_all);
}

fn register_all() {
    REGISTRY
        .register(Box::new(TELEMETRY_RECEIVED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(TELEMETRY_ACCEPTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(TELEMETRY_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_RAISED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SECONDARY_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(EVENTS_PUBLISHED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SOCKET_SUBSCRIBERS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
