pub mod alerts;
pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod realtime;
pub mod store;
pub mod validate;
pub mod worker;

use tokio::net::TcpListener;
use tracing::info;

use crate::api::AppState;
use crate::config::{Config, StoreKind};
use crate::errors::Result;
use crate::store::{postgres::PgStore, Stores};

pub async fn build_stores(config: &Config) -> Result<Stores> {
    match config.store {
        StoreKind::Memory => {
            info!("Using in-memory store; nothing survives a restart");
            Ok(Stores::memory())
        }
        StoreKind::Postgres => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections).await?;
            Ok(Stores::postgres(store))
        }
    }
}

/// Serves the full HTTP surface on `listener` until the server fails.
pub async fn serve(listener: TcpListener, state: AppState, frontend_url: Option<&str>) -> Result<()> {
    let app = api::router(state, frontend_url);
    axum::serve(listener, app).await?;
    Ok(())
}
