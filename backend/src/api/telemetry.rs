use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{Error, Result};
use crate::model::{Acknowledgement, TelemetryReading, TelemetryStats, TimeRange};
use crate::validate::parse_timestamp;

use super::{json_body, AppState};

const DEFAULT_STATS_DAYS: i64 = 7;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/devices/:id/telemetry", get(history).post(ingest))
        .route("/devices/:id/telemetry/stats", get(stats))
}

async fn ingest(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Json<Acknowledgement>> {
    let payload: Value = json_body(&body)?;
    Ok(Json(state.pipeline.ingest(&device_id, &payload).await?))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    from: Option<String>,
    to: Option<String>,
}

/// Query-string bound: RFC 3339 or epoch milliseconds.
fn bound(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let value = match raw.parse::<i64>() {
        Ok(millis) => Value::from(millis),
        Err(_) => Value::from(raw),
    };
    parse_timestamp(&value).map(Some)
}

async fn history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<TelemetryReading>>> {
    let range = TimeRange {
        from: bound(params.from.as_deref())?,
        to: bound(params.to.as_deref())?,
    };

    let rows = state
        .stores
        .telemetry
        .query(&device_id, range, state.limits.telemetry)
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Default, Deserialize)]
struct StatsParams {
    days: Option<String>,
}

fn trailing_days(raw: Option<&str>) -> Result<i64> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(DEFAULT_STATS_DAYS),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|days| (0..=36_500).contains(days))
            .ok_or_else(|| Error::Validation(format!("Invalid days: {}", raw))),
    }
}

async fn stats(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<StatsParams>,
) -> Result<Json<TelemetryStats>> {
    let days = trailing_days(params.days.as_deref())?;
    let range = TimeRange::since(Utc::now() - Duration::days(days));

    let stats = state.stores.telemetry.aggregate(&device_id, range).await?;
    Ok(Json(stats))
}
