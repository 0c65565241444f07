use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::errors::{Error, Result};
use crate::model::{Role, User, UserUpdate};

use super::{json_body, ok, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list).post(create))
        .route("/users/:id", put(update).delete(remove))
}

#[derive(Debug, Default, Deserialize)]
struct UserInput {
    email: Option<String>,
    password: Option<String>,
    name: Option<String>,
    role: Option<String>,
}

/// Absent stays `None`; an unknown name is a validation error.
fn parse_role(raw: Option<&str>) -> Result<Option<Role>> {
    raw.map(|r| {
        r.parse::<Role>()
            .map_err(|_| Error::Validation(format!("Unknown role: {}", r)))
    })
    .transpose()
}

fn user_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::NotFound(format!("User {} not found", raw)))
}

async fn list(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<User>>> {
    user.require(&[Role::Admin])?;
    Ok(Json(state.stores.users.list().await?))
}

async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    body: Bytes,
) -> Result<(StatusCode, Json<User>)> {
    user.require(&[Role::Admin])?;
    let input: UserInput = json_body(&body)?;

    let (Some(email), Some(password)) = (
        input.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        input.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(Error::Validation(
            "Email and password are required".to_string(),
        ));
    };

    let role = parse_role(input.role.as_deref())?.unwrap_or_default();

    let created = state
        .auth
        .create_user(email, &password, role, input.name)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<User>> {
    user.require(&[Role::Admin])?;
    let id = user_id(&id)?;
    let input: UserInput = json_body(&body)?;

    let role = parse_role(input.role.as_deref())?;
    let password_hash = match input.password.filter(|p| !p.is_empty()) {
        Some(password) => Some(state.auth.hash_password(&password).await?),
        None => None,
    };

    let update = UserUpdate {
        email: input.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        password_hash,
        role,
        name: input.name,
    };

    let updated = state
        .stores
        .users
        .update(id, update)
        .await?
        .ok_or_else(|| Error::NotFound(format!("User {} not found", id)))?;

    info!(user_id = %updated.id, "User updated");
    Ok(Json(updated))
}

async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    user.require(&[Role::Admin])?;
    let id = user_id(&id)?;

    if !state.stores.users.delete(id).await? {
        return Err(Error::NotFound(format!("User {} not found", id)));
    }

    info!(user_id = %id, "User deleted");
    Ok(ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role(None).unwrap(), None);
        assert_eq!(parse_role(Some("operator")).unwrap(), Some(Role::Operator));
        assert!(matches!(parse_role(Some("superuser")), Err(Error::Validation(_))));
    }
}
