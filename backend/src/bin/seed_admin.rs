use std::env;
use std::sync::Arc;

use anyhow::Context;
use smartbins::{
    auth::AuthService,
    config::Config,
    model::Role,
    store::{
        postgres::{redact_url, PgStore},
        UserStore,
    },
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // DATABASE_URL, PASSWORD_PEPPER and BCRYPT_COST come from the server config.
    let config = Config::from_env();
    let email = env::var("SEED_ADMIN_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());
    let password = env::var("SEED_ADMIN_PW").unwrap_or_else(|_| "password".to_string());

    let store = PgStore::connect(&config.database_url, 2)
        .await
        .with_context(|| format!("connecting to {}", redact_url(&config.database_url)))?;
    let users: Arc<dyn UserStore> = Arc::new(store);

    if users.find_by_email(&email).await?.is_some() {
        info!("Admin already exists: {}", email);
        return Ok(());
    }

    let auth = AuthService::new(users, config.auth);
    let admin = auth
        .create_user(email, &password, Role::Admin, Some("Admin".to_string()))
        .await
        .context("creating admin user")?;

    info!("Created admin {} ({})", admin.email, admin.id);
    Ok(())
}
