use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::alerts;
use crate::auth::AuthUser;
use crate::errors::{Error, Result};
use crate::model::{Alert, Role};

use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/alerts", get(list))
        .route("/alerts/:id/ack", post(acknowledge))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    unack: Option<String>,
}

async fn list(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Alert>>> {
    let unacknowledged_only = params.unack.as_deref() == Some("true");
    let rows = state
        .stores
        .alerts
        .list(unacknowledged_only, state.limits.alerts)
        .await?;
    Ok(Json(rows))
}

async fn acknowledge(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Alert>> {
    user.require(&[Role::Admin, Role::Operator])?;

    let id = Uuid::parse_str(&id)
        .map_err(|_| Error::NotFound(format!("Alert {} not found", id)))?;
    let alert =
        alerts::acknowledge(state.stores.alerts.as_ref(), state.publisher.as_ref(), id).await?;
    Ok(Json(alert))
}
