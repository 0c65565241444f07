use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::model::{
    Alert, AlertDraft, Device, GeoPoint, NewUser, Session, TelemetryReading, TelemetryStats,
    TimeRange, User, UserUpdate,
};

use super::{AlertStore, DeviceRegistry, TelemetryStore, UserStore};

/// Map-backed store for tests and `STORE=memory`. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    telemetry: RwLock<Vec<TelemetryReading>>,
    devices: RwLock<HashMap<String, Device>>,
    alerts: RwLock<HashMap<Uuid, Alert>>,
    users: RwLock<HashMap<Uuid, User>>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn append(&self, reading: TelemetryReading) -> Result<TelemetryReading> {
        self.telemetry.write().await.push(reading.clone());
        Ok(reading)
    }

    async fn query(
        &self,
        device_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TelemetryReading>> {
        let telemetry = self.telemetry.read().await;
        let mut rows: Vec<TelemetryReading> = telemetry
            .iter()
            .filter(|r| r.device_id == device_id && range.contains(r.timestamp))
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn aggregate(&self, device_id: &str, range: TimeRange) -> Result<TelemetryStats> {
        let telemetry = self.telemetry.read().await;
        let rows: Vec<&TelemetryReading> = telemetry
            .iter()
            .filter(|r| r.device_id == device_id && range.contains(r.timestamp))
            .collect();

        let fill = Summary::of(rows.iter().filter_map(|r| r.fill_percent));
        let battery = Summary::of(rows.iter().filter_map(|r| r.battery_percent));

        Ok(TelemetryStats {
            avg_fill: fill.avg(),
            min_fill: fill.min,
            max_fill: fill.max,
            avg_battery: battery.avg(),
            min_battery: battery.min,
            max_battery: battery.max,
            count: rows.len() as u64,
        })
    }
}

/// Running min/max/mean that ignores absent values, like SQL aggregates do.
#[derive(Default)]
struct Summary {
    sum: f64,
    n: usize,
    min: Option<f64>,
    max: Option<f64>,
}

impl Summary {
    fn of(values: impl Iterator<Item = f64>) -> Self {
        values.fold(Summary::default(), |mut s, v| {
            s.sum += v;
            s.n += 1;
            s.min = Some(s.min.map_or(v, |m| m.min(v)));
            s.max = Some(s.max.map_or(v, |m| m.max(v)));
            s
        })
    }

    fn avg(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn create(&self, device: Device) -> Result<Device> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.id) {
            return Err(Error::Conflict(format!("Device {} already exists", device.id)));
        }
        devices.insert(device.id.clone(), device.clone());
        Ok(device)
    }

    async fn update(&self, device: Device) -> Result<Option<Device>> {
        let mut devices = self.devices.write().await;
        let Some(existing) = devices.get_mut(&device.id) else {
            return Ok(None);
        };

        *existing = Device {
            created_at: existing.created_at,
            ..device
        };
        Ok(Some(existing.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.devices.write().await.remove(id).is_some())
    }

    async fn upsert_location(
        &self,
        id: &str,
        point: GeoPoint,
        upsert_on_unknown: bool,
    ) -> Result<Option<Device>> {
        let now = Utc::now();
        let mut devices = self.devices.write().await;

        if let Some(device) = devices.get_mut(id) {
            device.location = Some(point);
            device.updated_at = now;
            return Ok(Some(device.clone()));
        }

        if !upsert_on_unknown {
            return Ok(None);
        }

        let mut device = Device::new(id, now);
        device.location = Some(point);
        devices.insert(id.to_string(), device.clone());
        Ok(Some(device))
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert(&self, draft: AlertDraft) -> Result<Alert> {
        let alert = Alert::from_draft(draft, Utc::now());
        self.alerts.write().await.insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn list(&self, unacknowledged_only: bool, limit: usize) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        let mut rows: Vec<Alert> = alerts
            .values()
            .filter(|a| !unacknowledged_only || !a.acknowledged)
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn acknowledge(&self, id: Uuid) -> Result<Option<Alert>> {
        let mut alerts = self.alerts.write().await;
        Ok(alerts.get_mut(&id).map(|alert| {
            alert.acknowledge();
            alert.clone()
        }))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create(&self, user: NewUser) -> Result<User> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == user.email) {
            return Err(Error::Conflict(format!("User {} already exists", user.email)));
        }

        let created = User {
            id: Uuid::new_v4(),
            email: user.email,
            password_hash: user.password_hash,
            role: user.role,
            name: user.name,
            created_at: Utc::now(),
        };
        users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users)
    }

    async fn update(&self, id: Uuid, update: UserUpdate) -> Result<Option<User>> {
        let mut users = self.users.write().await;

        if let Some(email) = &update.email {
            if users.values().any(|u| u.id != id && &u.email == email) {
                return Err(Error::Conflict(format!("User {} already exists", email)));
            }
        }

        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(hash) = update.password_hash {
            user.password_hash = hash;
        }
        if let Some(role) = update.role {
            user.role = role;
        }
        if let Some(name) = update.name {
            user.name = Some(name);
        }
        Ok(Some(user.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let removed = self.users.write().await.remove(&id).is_some();
        if removed {
            self.sessions.write().await.retain(|_, s| s.user_id != id);
        }
        Ok(removed)
    }

    async fn create_session(&self, session: Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.token_hash.clone(), session);
        Ok(())
    }

    async fn find_session(&self, token_hash: &str) -> Result<Option<(Session, User)>> {
        let Some(session) = self.sessions.read().await.get(token_hash).cloned() else {
            return Ok(None);
        };
        let user = self.users.read().await.get(&session.user_id).cloned();
        Ok(user.map(|user| (session, user)))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        Ok((before - sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertKind, Details, Role, Severity};
    use chrono::Duration;

    fn reading_at(device_id: &str, minutes_ago: i64, fill: Option<f64>) -> TelemetryReading {
        let mut r = TelemetryReading::new(device_id, Utc::now() - Duration::minutes(minutes_ago));
        r.fill_percent = fill;
        r
    }

    fn draft(device_id: &str) -> AlertDraft {
        AlertDraft {
            device_id: device_id.to_string(),
            kind: AlertKind::Fill,
            severity: Severity::Critical,
            message: "Fill 90%".to_string(),
            details: Details::new(),
        }
    }

    #[tokio::test]
    async fn test_query_most_recent_first_with_limit() {
        let store = MemoryStore::new();
        for minutes in [30, 10, 20] {
            store
                .append(reading_at("bin-1", minutes, Some(minutes as f64)))
                .await
                .unwrap();
        }
        store.append(reading_at("bin-2", 5, None)).await.unwrap();

        let rows = store.query("bin-1", TimeRange::default(), 2).await.unwrap();
        let fills: Vec<_> = rows.iter().map(|r| r.fill_percent.unwrap()).collect();
        assert_eq!(fills, vec![10.0, 20.0]);
    }

    #[tokio::test]
    async fn test_query_respects_range() {
        let store = MemoryStore::new();
        store.append(reading_at("bin-1", 120, Some(1.0))).await.unwrap();
        store.append(reading_at("bin-1", 5, Some(2.0))).await.unwrap();

        let range = TimeRange::since(Utc::now() - Duration::minutes(60));
        let rows = store.query("bin-1", range, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fill_percent, Some(2.0));
    }

    #[tokio::test]
    async fn test_aggregate_ignores_missing_values() {
        let store = MemoryStore::new();
        store.append(reading_at("bin-1", 3, Some(20.0))).await.unwrap();
        store.append(reading_at("bin-1", 2, Some(40.0))).await.unwrap();
        store.append(reading_at("bin-1", 1, None)).await.unwrap();

        let stats = store.aggregate("bin-1", TimeRange::default()).await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.avg_fill, Some(30.0));
        assert_eq!(stats.min_fill, Some(20.0));
        assert_eq!(stats.max_fill, Some(40.0));
        assert_eq!(stats.avg_battery, None);
    }

    #[tokio::test]
    async fn test_aggregate_empty_range() {
        let store = MemoryStore::new();
        let stats = store.aggregate("nobody", TimeRange::default()).await.unwrap();
        assert_eq!(stats, TelemetryStats::default());
    }

    #[tokio::test]
    async fn test_create_duplicate_device_conflicts() {
        let store = MemoryStore::new();
        DeviceRegistry::create(&store, Device::new("bin-1", Utc::now())).await.unwrap();

        let result = DeviceRegistry::create(&store, Device::new("bin-1", Utc::now())).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_upsert_location_policy() {
        let store = MemoryStore::new();
        let point = GeoPoint {
            longitude: 1.0,
            latitude: 2.0,
        };

        assert!(store
            .upsert_location("bin-1", point, false)
            .await
            .unwrap()
            .is_none());
        assert!(DeviceRegistry::get(&store, "bin-1").await.unwrap().is_none());

        let created = store
            .upsert_location("bin-1", point, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.location, Some(point));

        let moved = GeoPoint {
            longitude: 3.0,
            latitude: 4.0,
        };
        let updated = store
            .upsert_location("bin-1", moved, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.location, Some(moved));
        assert_eq!(updated.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_update_keeps_created_at() {
        let store = MemoryStore::new();
        let device = DeviceRegistry::create(&store, Device::new("bin-1", Utc::now())).await.unwrap();

        let mut changed = Device::new("bin-1", Utc::now() + Duration::hours(1));
        changed.name = Some("Rua Direita".to_string());
        let updated = DeviceRegistry::update(&store, changed).await.unwrap().unwrap();

        assert_eq!(updated.created_at, device.created_at);
        assert_eq!(updated.name.as_deref(), Some("Rua Direita"));
        assert!(DeviceRegistry::update(&store, Device::new("ghost", Utc::now()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_alert_list_filters_unacknowledged() {
        let store = MemoryStore::new();
        let a = store.insert(draft("bin-1")).await.unwrap();
        store.insert(draft("bin-2")).await.unwrap();
        store.acknowledge(a.id).await.unwrap();

        assert_eq!(AlertStore::list(&store, false, 500).await.unwrap().len(), 2);
        let open = AlertStore::list(&store, true, 500).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].device_id, "bin-2");
    }

    #[tokio::test]
    async fn test_user_email_unique_and_sessions_resolve() {
        let store = MemoryStore::new();
        let user = UserStore::create(
            &store,
            NewUser {
                email: "ops@example.com".to_string(),
                password_hash: "h".to_string(),
                role: Role::Operator,
                name: None,
            },
        )
        .await
        .unwrap();

        let duplicate = UserStore::create(
            &store,
            NewUser {
                email: "ops@example.com".to_string(),
                password_hash: "h".to_string(),
                role: Role::Viewer,
                name: None,
            },
        )
        .await;
        assert!(matches!(duplicate, Err(Error::Conflict(_))));

        store
            .create_session(Session {
                token_hash: "abc".to_string(),
                user_id: user.id,
                expires_at: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap();

        let (_, resolved) = store.find_session("abc").await.unwrap().unwrap();
        assert_eq!(resolved.id, user.id);

        assert!(UserStore::delete(&store, user.id).await.unwrap());
        assert!(store.find_session("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_purged() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (hash, offset) in [("old", -2), ("edge", 0), ("fresh", 2)] {
            store
                .create_session(Session {
                    token_hash: hash.to_string(),
                    user_id: Uuid::new_v4(),
                    expires_at: now + Duration::hours(offset),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.delete_expired_sessions(now).await.unwrap(), 2);
        let remaining: Vec<String> = store.sessions.read().await.keys().cloned().collect();
        assert_eq!(remaining, vec!["fresh".to_string()]);
        assert_eq!(store.delete_expired_sessions(now).await.unwrap(), 0);
    }
}
