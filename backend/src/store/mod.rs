pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{
    Alert, AlertDraft, Device, GeoPoint, NewUser, Session, TelemetryReading, TelemetryStats,
    TimeRange, User, UserUpdate,
};

/// Append-only telemetry history.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn append(&self, reading: TelemetryReading) -> Result<TelemetryReading>;

    /// Most recent first, at most `limit` rows.
    async fn query(
        &self,
        device_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TelemetryReading>>;

    async fn aggregate(&self, device_id: &str, range: TimeRange) -> Result<TelemetryStats>;
}

/// Current state per device.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Device>>;
    async fn list(&self) -> Result<Vec<Device>>;
    /// Fails with `Conflict` when the id is taken.
    async fn create(&self, device: Device) -> Result<Device>;
    /// Replaces everything but `id` and `created_at`. `None` when the device is unknown.
    async fn update(&self, device: Device) -> Result<Option<Device>>;
    async fn delete(&self, id: &str) -> Result<bool>;
    /// Refreshes the location. An unknown id gets a minimal row only if `upsert_on_unknown`.
    async fn upsert_location(
        &self,
        id: &str,
        point: GeoPoint,
        upsert_on_unknown: bool,
    ) -> Result<Option<Device>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert(&self, draft: AlertDraft) -> Result<Alert>;
    /// Most recent first, at most `limit` rows.
    async fn list(&self, unacknowledged_only: bool, limit: usize) -> Result<Vec<Alert>>;
    /// Sets `acknowledged`; never clears it. `None` when the alert is unknown.
    async fn acknowledge(&self, id: Uuid) -> Result<Option<Alert>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with `Conflict` when the email is taken.
    async fn create(&self, user: NewUser) -> Result<User>;
    async fn get(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn list(&self) -> Result<Vec<User>>;
    async fn update(&self, id: Uuid, update: UserUpdate) -> Result<Option<User>>;
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn create_session(&self, session: Session) -> Result<()>;
    /// Resolves a token hash to its session and user, expired or not.
    async fn find_session(&self, token_hash: &str) -> Result<Option<(Session, User)>>;
    /// Drops every session that expired at or before `now`. Returns how many went.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// The four stores the server runs on, usually backed by one pool or one map set.
#[derive(Clone)]
pub struct Stores {
    pub telemetry: Arc<dyn TelemetryStore>,
    pub devices: Arc<dyn DeviceRegistry>,
    pub alerts: Arc<dyn AlertStore>,
    pub users: Arc<dyn UserStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self::from_shared(Arc::new(memory::MemoryStore::new()))
    }

    pub fn postgres(store: postgres::PgStore) -> Self {
        Self::from_shared(Arc::new(store))
    }

    fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: TelemetryStore + DeviceRegistry + AlertStore + UserStore + 'static,
    {
        Self {
            telemetry: store.clone(),
            devices: store.clone(),
            alerts: store.clone(),
            users: store,
        }
    }
}
