use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::info;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::model::{
    Alert, AlertDraft, Details, Device, DeviceConfig, GeoPoint, NewUser, Session,
    TelemetryReading, TelemetryStats, TimeRange, User, UserUpdate,
};

use super::{AlertStore, DeviceRegistry, TelemetryStore, UserStore};

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database at {}", redact_url(database_url));
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Drops the `user:password@` part so URLs can be logged.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Every store backed by one Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        Ok(Self::new(make_pool(database_url, max_connections).await?))
    }
}

fn decode<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| Error::Database(sqlx::Error::Decode(e.into())))
}

#[derive(FromRow)]
struct TelemetryRow {
    id: Uuid,
    device_id: String,
    ts: DateTime<Utc>,
    fill_percent: Option<f64>,
    ultrasonic_distance_cm: Option<f64>,
    infrared_flag1: Option<bool>,
    infrared_flag2: Option<bool>,
    battery_voltage: Option<f64>,
    battery_percent: Option<f64>,
    signal_strength: Option<f64>,
    firmware_version: Option<String>,
}

impl From<TelemetryRow> for TelemetryReading {
    fn from(row: TelemetryRow) -> Self {
        Self {
            id: row.id,
            device_id: row.device_id,
            timestamp: row.ts,
            fill_percent: row.fill_percent,
            ultrasonic_distance_cm: row.ultrasonic_distance_cm,
            infrared_flag1: row.infrared_flag1,
            infrared_flag2: row.infrared_flag2,
            battery_voltage: row.battery_voltage,
            battery_percent: row.battery_percent,
            signal_strength: row.signal_strength,
            firmware_version: row.firmware_version,
        }
    }
}

#[derive(FromRow)]
struct StatsRow {
    avg_fill: Option<f64>,
    min_fill: Option<f64>,
    max_fill: Option<f64>,
    avg_battery: Option<f64>,
    min_battery: Option<f64>,
    max_battery: Option<f64>,
    count: i64,
}

#[derive(FromRow)]
struct DeviceRow {
    id: String,
    name: Option<String>,
    longitude: Option<f64>,
    latitude: Option<f64>,
    status: String,
    telemetry_interval_seconds: Option<i32>,
    fill_alert_threshold_percent: Option<f64>,
    device_auth_token: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let location = match (row.longitude, row.latitude) {
            (Some(longitude), Some(latitude)) => Some(GeoPoint {
                longitude,
                latitude,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.id,
            name: row.name,
            location,
            status: decode(&row.status)?,
            config: DeviceConfig {
                telemetry_interval_seconds: row
                    .telemetry_interval_seconds
                    .and_then(|v| u32::try_from(v).ok()),
                fill_alert_threshold_percent: row.fill_alert_threshold_percent,
                device_auth_token: row.device_auth_token,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AlertRow {
    id: Uuid,
    device_id: String,
    ts: DateTime<Utc>,
    kind: String,
    severity: String,
    message: String,
    acknowledged: bool,
    details: Json<Details>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            device_id: row.device_id,
            timestamp: row.ts,
            kind: decode(&row.kind)?,
            severity: decode(&row.severity)?,
            message: row.message,
            acknowledged: row.acknowledged,
            details: row.details.0,
        })
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    role: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            role: decode(&row.role)?,
            name: row.name,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct SessionRow {
    token_hash: String,
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn append(&self, reading: TelemetryReading) -> Result<TelemetryReading> {
        sqlx::query(
            r#"
            INSERT INTO telemetry (
                id, device_id, ts, fill_percent, ultrasonic_distance_cm,
                infrared_flag1, infrared_flag2, battery_voltage, battery_percent,
                signal_strength, firmware_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(reading.id)
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.fill_percent)
        .bind(reading.ultrasonic_distance_cm)
        .bind(reading.infrared_flag1)
        .bind(reading.infrared_flag2)
        .bind(reading.battery_voltage)
        .bind(reading.battery_percent)
        .bind(reading.signal_strength)
        .bind(&reading.firmware_version)
        .execute(&self.pool)
        .await?;

        Ok(reading)
    }

    async fn query(
        &self,
        device_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TelemetryReading>> {
        let rows: Vec<TelemetryRow> = sqlx::query_as(
            r#"
            SELECT * FROM telemetry
            WHERE device_id = $1
              AND ($2::timestamptz IS NULL OR ts >= $2)
              AND ($3::timestamptz IS NULL OR ts <= $3)
            ORDER BY ts DESC
            LIMIT $4
            "#,
        )
        .bind(device_id)
        .bind(range.from)
        .bind(range.to)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TelemetryReading::from).collect())
    }

    async fn aggregate(&self, device_id: &str, range: TimeRange) -> Result<TelemetryStats> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                AVG(fill_percent) AS avg_fill,
                MIN(fill_percent) AS min_fill,
                MAX(fill_percent) AS max_fill,
                AVG(battery_percent) AS avg_battery,
                MIN(battery_percent) AS min_battery,
                MAX(battery_percent) AS max_battery,
                COUNT(*) AS count
            FROM telemetry
            WHERE device_id = $1
              AND ($2::timestamptz IS NULL OR ts >= $2)
              AND ($3::timestamptz IS NULL OR ts <= $3)
            "#,
        )
        .bind(device_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_one(&self.pool)
        .await?;

        Ok(TelemetryStats {
            avg_fill: row.avg_fill,
            min_fill: row.min_fill,
            max_fill: row.max_fill,
            avg_battery: row.avg_battery,
            min_battery: row.min_battery,
            max_battery: row.max_battery,
            count: u64::try_from(row.count).unwrap_or(0),
        })
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn get(&self, id: &str) -> Result<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as("SELECT * FROM devices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Device::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let rows: Vec<DeviceRow> = sqlx::query_as("SELECT * FROM devices ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Device::try_from).collect()
    }

    async fn create(&self, device: Device) -> Result<Device> {
        let row: DeviceRow = sqlx::query_as(
            r#"
            INSERT INTO devices (
                id, name, longitude, latitude, status, telemetry_interval_seconds,
                fill_alert_threshold_percent, device_auth_token, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(device.location.map(|p| p.longitude))
        .bind(device.location.map(|p| p.latitude))
        .bind(device.status.as_str())
        .bind(interval_param(&device.config))
        .bind(device.config.fill_alert_threshold_percent)
        .bind(&device.config.device_auth_token)
        .bind(device.created_at)
        .bind(device.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_write(e, &format!("Device {}", device.id)))?;

        Device::try_from(row)
    }

    async fn update(&self, device: Device) -> Result<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as(
            r#"
            UPDATE devices SET
                name = $2,
                longitude = $3,
                latitude = $4,
                status = $5,
                telemetry_interval_seconds = $6,
                fill_alert_threshold_percent = $7,
                device_auth_token = $8,
                updated_at = $9
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(device.location.map(|p| p.longitude))
        .bind(device.location.map(|p| p.latitude))
        .bind(device.status.as_str())
        .bind(interval_param(&device.config))
        .bind(device.config.fill_alert_threshold_percent)
        .bind(&device.config.device_auth_token)
        .bind(device.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Device::try_from).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_location(
        &self,
        id: &str,
        point: GeoPoint,
        upsert_on_unknown: bool,
    ) -> Result<Option<Device>> {
        let sql = if upsert_on_unknown {
            r#"
            INSERT INTO devices (id, longitude, latitude, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'active', $4, $4)
            ON CONFLICT (id) DO UPDATE SET
                longitude = EXCLUDED.longitude,
                latitude = EXCLUDED.latitude,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#
        } else {
            r#"
            UPDATE devices SET longitude = $2, latitude = $3, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#
        };

        let row: Option<DeviceRow> = sqlx::query_as(sql)
            .bind(id)
            .bind(point.longitude)
            .bind(point.latitude)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Device::try_from).transpose()
    }
}

fn interval_param(config: &DeviceConfig) -> Option<i32> {
    config
        .telemetry_interval_seconds
        .and_then(|v| i32::try_from(v).ok())
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert(&self, draft: AlertDraft) -> Result<Alert> {
        let alert = Alert::from_draft(draft, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO alerts (id, device_id, ts, kind, severity, message, acknowledged, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(alert.id)
        .bind(&alert.device_id)
        .bind(alert.timestamp)
        .bind(alert.kind.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(alert.acknowledged)
        .bind(Json(&alert.details))
        .execute(&self.pool)
        .await?;

        Ok(alert)
    }

    async fn list(&self, unacknowledged_only: bool, limit: usize) -> Result<Vec<Alert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT * FROM alerts
            WHERE NOT ($1 AND acknowledged)
            ORDER BY ts DESC
            LIMIT $2
            "#,
        )
        .bind(unacknowledged_only)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }

    async fn acknowledge(&self, id: Uuid) -> Result<Option<Alert>> {
        let row: Option<AlertRow> =
            sqlx::query_as("UPDATE alerts SET acknowledged = TRUE WHERE id = $1 RETURNING *")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Alert::try_from).transpose()
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn create(&self, user: NewUser) -> Result<User> {
        let row: UserRow = sqlx::query_as(
            r#"
            INSERT INTO users (id, email, password_hash, role, name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(&user.name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_write(e, &format!("User {}", user.email)))?;

        User::try_from(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM users ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(User::try_from).collect()
    }

    async fn update(&self, id: Uuid, update: UserUpdate) -> Result<Option<User>> {
        let what = update
            .email
            .as_deref()
            .map_or_else(|| "User".to_string(), |email| format!("User {email}"));

        let row: Option<UserRow> = sqlx::query_as(
            r#"
            UPDATE users SET
                email = COALESCE($2, email),
                password_hash = COALESCE($3, password_hash),
                role = COALESCE($4, role),
                name = COALESCE($5, name)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&update.email)
        .bind(&update.password_hash)
        .bind(update.role.map(|r| r.as_str()))
        .bind(&update.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::from_write(e, &what))?;

        row.map(User::try_from).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_session(&self, session: Session) -> Result<()> {
        sqlx::query("INSERT INTO sessions (token_hash, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&session.token_hash)
            .bind(session.user_id)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_session(&self, token_hash: &str) -> Result<Option<(Session, User)>> {
        let session: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;

        let Some(session) = session else {
            return Ok(None);
        };

        let user = UserStore::get(self, session.user_id).await?;
        Ok(user.map(|user| {
            (
                Session {
                    token_hash: session.token_hash,
                    user_id: session.user_id,
                    expires_at: session.expires_at,
                },
                user,
            )
        }))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url_strips_credentials() {
        assert_eq!(
            redact_url("postgres://bins:secret@db:5432/smartbins"),
            "postgres://***@db:5432/smartbins"
        );
        assert_eq!(
            redact_url("postgres://localhost/smartbins"),
            "postgres://localhost/smartbins"
        );
    }

    #[test]
    fn test_decode_rejects_unknown_values() {
        assert!(decode::<crate::model::Role>("admin").is_ok());
        assert!(matches!(
            decode::<crate::model::Role>("root"),
            Err(Error::Database(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Needs a running Postgres at DATABASE_URL
    async fn test_append_and_query_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PgStore::connect(&url, 2).await.unwrap();

        let device_id = format!("test-{}", Uuid::new_v4());
        let mut reading = TelemetryReading::new(device_id.as_str(), Utc::now());
        reading.fill_percent = Some(42.0);
        store.append(reading.clone()).await.unwrap();

        let rows = store
            .query(&device_id, TimeRange::default(), 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fill_percent, Some(42.0));
    }
}
