use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::auth::{random_hex, AuthUser};
use crate::errors::{Error, Result};
use crate::model::{Device, DeviceConfig, DeviceStatus, GeoPoint, Role};
use crate::realtime::Event;

use super::{json_body, ok, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list).post(create))
        .route("/devices/:id", get(show).put(update).delete(remove))
        .route("/devices/:id/token", post(rotate_token))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigInput {
    telemetry_interval_seconds: Option<u32>,
    fill_alert_threshold_percent: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInput {
    id: Option<String>,
    name: Option<String>,
    location: Option<GeoPoint>,
    status: Option<DeviceStatus>,
    #[serde(default)]
    config: ConfigInput,
}

impl DeviceInput {
    /// Applies every present field; absent fields keep their current value.
    fn apply(self, device: &mut Device) -> Result<()> {
        if let Some(name) = self.name {
            device.name = Some(name);
        }
        if let Some(location) = self.location {
            device.location = Some(location);
        }
        if let Some(status) = self.status {
            device.status = status;
        }
        if let Some(interval) = self.config.telemetry_interval_seconds {
            device.config.telemetry_interval_seconds = Some(interval);
        }
        if let Some(threshold) = self.config.fill_alert_threshold_percent {
            if !threshold.is_finite() {
                return Err(Error::Validation(
                    "fillAlertThresholdPercent must be a finite number".to_string(),
                ));
            }
            device.config.fill_alert_threshold_percent = Some(threshold);
        }
        Ok(())
    }
}

fn generate_device_id() -> String {
    format!("dev-{}", random_hex(8))
}

async fn find(state: &AppState, id: &str) -> Result<Device> {
    state
        .stores
        .devices
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Device {} not found", id)))
}

async fn list(State(state): State<AppState>, _user: AuthUser) -> Result<Json<Vec<Device>>> {
    Ok(Json(state.stores.devices.list().await?))
}

async fn show(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Device>> {
    Ok(Json(find(&state, &id).await?))
}

async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    body: Bytes,
) -> Result<(StatusCode, Json<Device>)> {
    user.require(&[Role::Admin])?;
    let mut input: DeviceInput = json_body(&body)?;

    let id = match input.id.take().map(|id| id.trim().to_string()) {
        Some(id) if id.is_empty() => {
            return Err(Error::Validation("Device ID cannot be empty".to_string()))
        }
        Some(id) => id,
        None => generate_device_id(),
    };

    let mut device = Device::new(id, Utc::now());
    input.apply(&mut device)?;

    let device = state.stores.devices.create(device).await?;
    info!(device_id = %device.id, "Device created");
    state.publisher.publish(Event::DeviceCreated(device.clone()));

    Ok((StatusCode::CREATED, Json(device)))
}

async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Device>> {
    user.require(&[Role::Admin])?;
    let input: DeviceInput = json_body(&body)?;

    let mut device = find(&state, &id).await?;
    input.apply(&mut device)?;
    device.updated_at = Utc::now();

    let device = state
        .stores
        .devices
        .update(device)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Device {} not found", id)))?;

    state.publisher.publish(Event::DeviceUpdated(device.clone()));
    Ok(Json(device))
}

async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    user.require(&[Role::Admin])?;

    if !state.stores.devices.delete(&id).await? {
        return Err(Error::NotFound(format!("Device {} not found", id)));
    }

    info!(device_id = %id, "Device deleted");
    state.publisher.publish(Event::DeviceDeleted { id });
    Ok(ok())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    device_id: String,
    device_auth_token: String,
}

async fn rotate_token(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<TokenResponse>> {
    user.require(&[Role::Admin])?;

    let mut device = find(&state, &id).await?;
    let token = random_hex(32);
    device.config = DeviceConfig {
        device_auth_token: Some(token.clone()),
        ..device.config
    };
    device.updated_at = Utc::now();

    let device = state
        .stores
        .devices
        .update(device)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Device {} not found", id)))?;

    info!(device_id = %device.id, "Device token rotated");
    state.publisher.publish(Event::DeviceUpdated(device.clone()));

    Ok(Json(TokenResponse {
        device_id: device.id,
        device_auth_token: token,
    }))
}
