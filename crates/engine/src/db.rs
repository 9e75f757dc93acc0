//! SQLite history store.  The in-memory registry owns live state; this
//! store exists so the dashboard can replay/query history.  All writes from
//! the hot path are best-effort: a failed insert is logged by the caller
//! and never stalls ingestion.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::alert::Alert;
use crate::mqtt::ActuatorCommand;
use crate::normalize::Reading;
use crate::registry::DeviceStatus;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredDevice {
    pub device_id: String,
    pub zone_id: Option<String>,
    pub status: String,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub id: i64,
    pub device_id: String,
    pub ts: i64,
    pub moisture: Option<f64>,
    pub rain: Option<f64>,
    pub nitrogen: Option<f64>,
    pub phosphorus: Option<f64>,
    pub potassium: Option<f64>,
    pub ec: Option<f64>,
    #[serde(rename = "pH")]
    pub ph: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
    pub voltage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredAlert {
    pub id: i64,
    pub device_id: String,
    pub severity: String,
    pub dimension: String,
    pub from_band: String,
    pub to_band: String,
    pub created_at: i64,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredCommand {
    pub id: i64,
    pub device_id: String,
    pub actuator: String,
    pub action: String,
    pub duration_sec: Option<i64>,
    pub triggered_by: String,
    pub issued_at: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:smartag.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn upsert_device(
        &self,
        device_id: &str,
        zone_id: Option<&str>,
        status: DeviceStatus,
        last_seen: i64,
    ) -> Result<()> {
        let status = match status {
            DeviceStatus::Connected => "CONNECTED",
            DeviceStatus::Disconnected => "DISCONNECTED",
        };
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, zone_id, status, last_seen)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              zone_id=COALESCE(excluded.zone_id, devices.zone_id),
              status=excluded.status,
              last_seen=excluded.last_seen
            "#,
        )
        .bind(device_id)
        .bind(zone_id)
        .bind(status)
        .bind(last_seen)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        sqlx::query_as::<_, StoredDevice>(
            "SELECT device_id, zone_id, status, last_seen FROM devices ORDER BY device_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_devices failed")
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (
              device_id, ts,
              moisture, rain, nitrogen, phosphorus, potassium,
              ec, ph, temperature, humidity, battery, voltage
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.device_id)
        .bind(r.ts.unix_timestamp())
        .bind(r.moisture)
        .bind(r.rain)
        .bind(r.nitrogen)
        .bind(r.phosphorus)
        .bind(r.potassium)
        .bind(r.ec)
        .bind(r.ph)
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.battery)
        .bind(r.voltage)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    pub async fn recent_readings(&self, device_id: &str, limit: i64) -> Result<Vec<StoredReading>> {
        sqlx::query_as::<_, StoredReading>(
            r#"
            SELECT id, device_id, ts,
                   moisture, rain, nitrogen, phosphorus, potassium,
                   ec, ph, temperature, humidity, battery, voltage
            FROM readings
            WHERE device_id = ?
            ORDER BY ts DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn insert_alert(&self, a: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, device_id, severity, dimension, from_band, to_band, created_at, is_read)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(a.id)
        .bind(&a.device_id)
        .bind(a.severity.as_str())
        .bind(a.dimension.as_str())
        .bind(a.from_band.as_str())
        .bind(a.to_band.as_str())
        .bind(a.created_at.unix_timestamp())
        .bind(a.is_read)
        .execute(&self.pool)
        .await
        .context("insert_alert failed")?;
        Ok(())
    }

    /// Returns false when no such alert exists.
    pub async fn mark_alert_read(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE alerts SET is_read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("mark_alert_read failed")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_alerts(&self, unread_only: bool, limit: i64) -> Result<Vec<StoredAlert>> {
        let sql = if unread_only {
            r#"
            SELECT id, device_id, severity, dimension, from_band, to_band, created_at, is_read
            FROM alerts WHERE is_read = 0
            ORDER BY created_at DESC LIMIT ?
            "#
        } else {
            r#"
            SELECT id, device_id, severity, dimension, from_band, to_band, created_at, is_read
            FROM alerts
            ORDER BY created_at DESC LIMIT ?
            "#
        };
        sqlx::query_as::<_, StoredAlert>(sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("list_alerts failed")
    }

    pub async fn max_alert_id(&self) -> Result<i64> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM alerts")
            .fetch_one(&self.pool)
            .await
            .context("max_alert_id failed")?;
        Ok(id)
    }

    // ----------------------------
    // Actuator command log
    // ----------------------------

    pub async fn insert_command(&self, c: &ActuatorCommand) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actuator_commands (device_id, actuator, action, duration_sec, triggered_by, issued_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.device_id)
        .bind(c.actuator.as_str())
        .bind(match c.action {
            crate::mqtt::CommandAction::On => "ON",
            crate::mqtt::CommandAction::Off => "OFF",
        })
        .bind(c.duration_secs as i64)
        .bind(match c.triggered_by {
            crate::mqtt::TriggeredBy::AiSystem => "AI_SYSTEM",
            crate::mqtt::TriggeredBy::Manual => "MANUAL",
        })
        .bind(c.issued_at.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("insert_command failed")?;
        Ok(())
    }

    pub async fn recent_commands(&self, device_id: &str, limit: i64) -> Result<Vec<StoredCommand>> {
        sqlx::query_as::<_, StoredCommand>(
            r#"
            SELECT id, device_id, actuator, action, duration_sec, triggered_by, issued_at
            FROM actuator_commands
            WHERE device_id = ?
            ORDER BY issued_at DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_commands failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;
    use crate::classify::{Band, Dimension};
    use crate::mqtt::{Actuator, CommandAction, TriggeredBy};
    use time::OffsetDateTime;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn sample_reading(device: &str, ts: i64) -> Reading {
        let mut r = Reading::empty(device, OffsetDateTime::from_unix_timestamp(ts).unwrap());
        r.moisture = Some(42.0);
        r.ph = Some(6.5);
        r
    }

    #[tokio::test]
    async fn device_upsert_and_list() {
        let db = test_db().await;
        db.upsert_device("d1", Some("zone-a"), DeviceStatus::Connected, 100)
            .await
            .unwrap();
        db.upsert_device("d1", None, DeviceStatus::Disconnected, 200)
            .await
            .unwrap();

        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].status, "DISCONNECTED");
        assert_eq!(devices[0].last_seen, Some(200));
        // A null zone on re-upsert must not erase the known zone.
        assert_eq!(devices[0].zone_id.as_deref(), Some("zone-a"));
    }

    #[tokio::test]
    async fn readings_round_trip_newest_first() {
        let db = test_db().await;
        for ts in [100, 200, 300] {
            db.insert_reading(&sample_reading("d1", ts)).await.unwrap();
        }
        db.insert_reading(&sample_reading("other", 400)).await.unwrap();

        let rows = db.recent_readings("d1", 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, 300);
        assert_eq!(rows[1].ts, 200);
        assert_eq!(rows[0].moisture, Some(42.0));
        assert_eq!(rows[0].ph, Some(6.5));
        assert_eq!(rows[0].rain, None);
    }

    #[tokio::test]
    async fn alert_insert_ack_and_filtering() {
        let db = test_db().await;
        let alert = Alert {
            id: 7,
            device_id: "d1".into(),
            severity: Severity::Warning,
            dimension: Dimension::Moisture,
            from_band: Band::Optimal,
            to_band: Band::Poor,
            created_at: OffsetDateTime::from_unix_timestamp(1000).unwrap(),
            is_read: false,
        };
        db.insert_alert(&alert).await.unwrap();

        assert_eq!(db.list_alerts(true, 50).await.unwrap().len(), 1);
        assert!(db.mark_alert_read(7).await.unwrap());
        assert!(db.list_alerts(true, 50).await.unwrap().is_empty());
        assert_eq!(db.list_alerts(false, 50).await.unwrap().len(), 1);
        assert_eq!(db.max_alert_id().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn ack_of_unknown_alert_reports_false() {
        let db = test_db().await;
        assert!(!db.mark_alert_read(99).await.unwrap());
    }

    #[tokio::test]
    async fn command_log_round_trip() {
        let db = test_db().await;
        let cmd = ActuatorCommand {
            device_id: "d1".into(),
            actuator: Actuator::Water,
            action: CommandAction::On,
            duration_secs: 300,
            triggered_by: TriggeredBy::Manual,
            issued_at: OffsetDateTime::from_unix_timestamp(500).unwrap(),
        };
        db.insert_command(&cmd).await.unwrap();

        let rows = db.recent_commands("d1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actuator, "WATER");
        assert_eq!(rows[0].action, "ON");
        assert_eq!(rows[0].duration_sec, Some(300));
        assert_eq!(rows[0].triggered_by, "MANUAL");
    }

    #[tokio::test]
    async fn max_alert_id_defaults_to_zero() {
        let db = test_db().await;
        assert_eq!(db.max_alert_id().await.unwrap(), 0);
    }
}
