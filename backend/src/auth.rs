use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use chrono::{Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::errors::{Error, Result};
use crate::model::{NewUser, Role, Session, User};
use crate::store::UserStore;

/// bcrypt work factor unless `BCRYPT_COST` says otherwise.
pub const DEFAULT_BCRYPT_COST: u32 = 10;
const TOKEN_BYTES: usize = 32;

/// `count` random bytes, hex-encoded.
pub fn random_hex(count: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..count).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Opaque bearer token handed to clients. Only its hash is stored.
pub fn generate_token() -> String {
    random_hex(TOKEN_BYTES)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// bcrypt input. Without a pepper this is the raw password, so plain bcrypt hashes verify.
/// With one, the peppered digest keeps the input under bcrypt's 72-byte limit.
fn peppered(password: &str, pepper: &str) -> String {
    if pepper.is_empty() {
        return password.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn hash_password(password: &str, pepper: &str, cost: u32) -> Result<String> {
    Ok(bcrypt::hash(peppered(password, pepper), cost)?)
}

/// False for a wrong password and for any stored value that is not a bcrypt hash.
pub fn verify_password(password: &str, pepper: &str, stored: &str) -> bool {
    bcrypt::verify(peppered(password, pepper), stored).unwrap_or(false)
}

pub fn has_role(user: &User, roles: &[Role]) -> bool {
    roles.contains(&user.role)
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub pepper: String,
    pub bcrypt_cost: u32,
    pub session_ttl: Duration,
    /// Required to self-register as admin. Admin registration is off when unset.
    pub admin_secret: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            pepper: String::new(),
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            session_ttl: Duration::hours(12),
            admin_secret: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub admin_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

/// Parses a role name; anything unrecognized becomes `viewer`.
pub fn role_or_default(role: Option<&str>) -> Role {
    role.and_then(|r| r.parse().ok()).unwrap_or_default()
}

fn credentials(email: Option<String>, password: Option<String>) -> Result<(String, String)> {
    match (email, password) {
        (Some(email), Some(password)) if !email.trim().is_empty() && !password.is_empty() => {
            Ok((email.trim().to_string(), password))
        }
        _ => Err(Error::Validation(
            "Email and password are required".to_string(),
        )),
    }
}

/// Login, registration and bearer-token resolution over a [`UserStore`].
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    settings: AuthSettings,
    /// Checked when the email is unknown, so both login failures cost one bcrypt run.
    dummy_hash: Arc<str>,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, settings: AuthSettings) -> Self {
        let dummy_hash = hash_password(&random_hex(16), &settings.pepper, settings.bcrypt_cost)
            .unwrap_or_else(|e| {
                warn!("Failed to prepare dummy password hash: {}", e);
                String::new()
            });

        Self {
            users,
            settings,
            dummy_hash: Arc::from(dummy_hash),
        }
    }

    /// bcrypt on the blocking pool.
    pub async fn hash_password(&self, password: &str) -> Result<String> {
        let password = password.to_string();
        let pepper = self.settings.pepper.clone();
        let cost = self.settings.bcrypt_cost;
        tokio::task::spawn_blocking(move || hash_password(&password, &pepper, cost)).await?
    }

    async fn verify_password(&self, password: String, stored: String) -> Result<bool> {
        let pepper = self.settings.pepper.clone();
        let verified =
            tokio::task::spawn_blocking(move || verify_password(&password, &pepper, &stored))
                .await?;
        Ok(verified)
    }

    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse> {
        let (email, password) = credentials(request.email, request.password)?;

        let user = self.users.find_by_email(&email).await?;
        let stored = match &user {
            Some(user) => user.password_hash.clone(),
            None => self.dummy_hash.to_string(),
        };
        let verified = self.verify_password(password, stored).await?;

        let user = match user {
            Some(user) if verified => user,
            _ => {
                warn!(email = %email, "Failed login");
                return Err(Error::Unauthorized("Invalid credentials".to_string()));
            }
        };

        let token = self.issue_session(&user).await?;
        info!(user_id = %user.id, "User logged in");
        Ok(AuthResponse { token, user })
    }

    /// `header_secret` is the `x-admin-secret` header; the body field is the fallback.
    pub async fn register(
        &self,
        request: RegisterRequest,
        header_secret: Option<&str>,
    ) -> Result<AuthResponse> {
        let (email, password) = credentials(request.email, request.password)?;
        let role = role_or_default(request.role.as_deref());

        if role == Role::Admin {
            let Some(expected) = self.settings.admin_secret.as_deref() else {
                return Err(Error::Forbidden(
                    "Admin registration is disabled".to_string(),
                ));
            };
            let provided = header_secret.or(request.admin_secret.as_deref());
            if !provided.is_some_and(|p| constant_time_eq(p.as_bytes(), expected.as_bytes())) {
                return Err(Error::Forbidden(
                    "Invalid admin registration secret".to_string(),
                ));
            }
        }

        let user = self.create_user(email, &password, role, request.name).await?;
        let token = self.issue_session(&user).await?;
        Ok(AuthResponse { token, user })
    }

    pub async fn create_user(
        &self,
        email: String,
        password: &str,
        role: Role,
        name: Option<String>,
    ) -> Result<User> {
        let user = self
            .users
            .create(NewUser {
                email,
                password_hash: self.hash_password(password).await?,
                role,
                name,
            })
            .await?;

        info!(user_id = %user.id, role = %user.role, "User created");
        Ok(user)
    }

    async fn issue_session(&self, user: &User) -> Result<String> {
        self.purge_expired_sessions().await;

        let token = generate_token();
        self.users
            .create_session(Session {
                token_hash: hash_token(&token),
                user_id: user.id,
                expires_at: Utc::now() + self.settings.session_ttl,
            })
            .await?;
        Ok(token)
    }

    pub async fn authenticate(&self, token: &str) -> Result<User> {
        let (session, user) = self
            .users
            .find_session(&hash_token(token))
            .await?
            .ok_or_else(|| Error::Unauthorized("Invalid token".to_string()))?;

        if session.expires_at <= Utc::now() {
            self.purge_expired_sessions().await;
            return Err(Error::Unauthorized("Session expired".to_string()));
        }
        Ok(user)
    }

    /// Best-effort cleanup; a failure only leaves stale rows behind.
    async fn purge_expired_sessions(&self) {
        match self.users.delete_expired_sessions(Utc::now()).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Purged expired sessions"),
            Err(e) => warn!("Failed to purge expired sessions: {}", e),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::Unauthorized("Missing bearer token".to_string()))
}

/// The signed-in user behind the request's bearer token.
pub struct AuthUser(pub User);

impl AuthUser {
    pub fn require(&self, roles: &[Role]) -> Result<()> {
        if has_role(&self.0, roles) {
            Ok(())
        } else {
            Err(Error::Forbidden("Insufficient role".to_string()))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(&parts.headers)?;
        state.auth.authenticate(token).await.map(AuthUser)
    }
}
