use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};

use crate::auth::{AuthResponse, LoginRequest, RegisterRequest};
use crate::errors::Result;

use super::{json_body, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
}

async fn login(State(state): State<AppState>, body: Bytes) -> Result<Json<AuthResponse>> {
    let request: LoginRequest = json_body(&body)?;
    Ok(Json(state.auth.login(request).await?))
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let request: RegisterRequest = json_body(&body)?;
    let secret = headers
        .get("x-admin-secret")
        .and_then(|value| value.to_str().ok());

    let response = state.auth.register(request, secret).await?;
    Ok((StatusCode::CREATED, Json(response)))
}
