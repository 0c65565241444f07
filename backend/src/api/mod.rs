mod alerts;
mod devices;
mod session;
mod telemetry;
mod users;

use std::sync::Arc;

use axum::{http::HeaderValue, routing::get, Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::auth::AuthService;
use crate::config::Config;
use crate::errors::Result;
use crate::ingest::IngestPipeline;
use crate::metrics;
use crate::realtime::{socket_handler, Broadcaster, Publisher};
use crate::store::Stores;

#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub telemetry: usize,
    pub alerts: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub pipeline: IngestPipeline,
    pub publisher: Arc<dyn Publisher>,
    pub broadcaster: Broadcaster,
    pub auth: AuthService,
    pub limits: QueryLimits,
}

impl AppState {
    pub fn new(stores: Stores, config: &Config) -> Self {
        let broadcaster = Broadcaster::new(config.event_channel_capacity);
        let publisher: Arc<dyn Publisher> = Arc::new(broadcaster.clone());
        let pipeline = IngestPipeline::new(&stores, publisher.clone(), config.ingest);
        let auth = AuthService::new(stores.users.clone(), config.auth.clone());

        Self {
            stores,
            pipeline,
            publisher,
            broadcaster,
            auth,
            limits: QueryLimits {
                telemetry: config.telemetry_query_limit,
                alerts: config.alert_query_limit,
            },
        }
    }
}

/// REST under `/api`, plus `/health`, `/metrics` and the `/socket` fan-out.
pub fn router(state: AppState, frontend_url: Option<&str>) -> Router {
    let api = Router::new()
        .merge(session::routes())
        .merge(telemetry::routes())
        .merge(devices::routes())
        .merge(alerts::routes())
        .merge(users::routes());

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/socket", get(socket_handler))
        .nest("/api", api)
        .layer(cors(frontend_url))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors(frontend_url: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match frontend_url.map(HeaderValue::from_str) {
        Some(Ok(origin)) => layer.allow_origin(origin),
        Some(Err(e)) => {
            warn!("Ignoring invalid FRONTEND_URL: {}", e);
            layer.allow_origin(Any)
        }
        None => layer.allow_origin(Any),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

/// Parses a request body, treating an empty body as `{}`.
fn json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_str("{}")?);
    }
    Ok(serde_json::from_slice(body)?)
}

fn ok() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    #[derive(Debug, serde::Deserialize)]
    struct Body {
        name: Option<String>,
    }

    #[test]
    fn test_json_body_empty_is_object() {
        let body: Body = json_body(b"").unwrap();
        assert!(body.name.is_none());

        let body: Body = json_body(br#"{"name":"x"}"#).unwrap();
        assert_eq!(body.name.as_deref(), Some("x"));
    }

    #[test]
    fn test_json_body_rejects_garbage() {
        let result: Result<Body> = json_body(b"{nope");
        assert!(matches!(result, Err(Error::Json(_))));
    }
}
