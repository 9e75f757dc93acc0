//! Owned registry of live system state: devices, their current
//! classifications, standing alerts, and a bounded ring of recent system
//! events.  Components receive this by reference and follow a single-writer
//! discipline per concern: readings/connectivity are written by the
//! ingestion workers, alert state by the alert generator and the
//! acknowledge handler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::alert::Alert;
use crate::classify::{classify_reading, Band, Classification, Dimension, Outcome};
use crate::db::StoredDevice;
use crate::normalize::Reading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub zone_id: Option<String>,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub last_reading: Option<Reading>,
    pub classifications: HashMap<Dimension, Classification>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Alert,
    Command,
    Automation,
    Warning,
    Error,
    System,
}

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub devices: HashMap<String, DeviceState>,
    /// Standing unacknowledged alerts only.  Acknowledged and auto-resolved
    /// alerts are evicted; their full history lives in the store.
    pub alerts: HashMap<i64, Alert>,
    /// Dedup key set: (device, dimension, band) combinations with a standing
    /// unacknowledged alert.
    pub unacked: HashSet<(String, Dimension, Band)>,
    pub next_alert_id: i64,
    pub events: VecDeque<SystemEvent>,
}

// ---------------------------------------------------------------------------
// JSON response (what the status API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub device_count: usize,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            devices: HashMap::new(),
            alerts: HashMap::new(),
            unacked: HashSet::new(),
            next_alert_id: 1,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Continue alert ids after the persisted history.
    pub fn seed_alert_ids(&mut self, max_persisted_id: i64) {
        self.next_alert_id = self.next_alert_id.max(max_persisted_id + 1);
    }

    /// Restore known devices from the persisted table at startup.  They
    /// stay DISCONNECTED until fresh telemetry arrives.
    pub fn seed_devices(&mut self, rows: &[StoredDevice]) {
        for row in rows {
            self.devices
                .entry(row.device_id.clone())
                .or_insert_with(|| DeviceState {
                    zone_id: row.zone_id.clone(),
                    status: DeviceStatus::Disconnected,
                    last_seen: row
                        .last_seen
                        .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
                        .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                    last_reading: None,
                    classifications: HashMap::new(),
                });
        }
    }

    /// Apply a validated reading: create the device on first contact, mark
    /// it connected, store the reading, and reclassify every sensed
    /// dimension.  Returns one [`Outcome`] per classified dimension;
    /// `from` is set on the ones that transitioned.
    pub fn apply_reading(&mut self, reading: &Reading, now: OffsetDateTime) -> Vec<Outcome> {
        let device = self
            .devices
            .entry(reading.device_id.clone())
            .or_insert_with(|| DeviceState {
                zone_id: None,
                status: DeviceStatus::Connected,
                last_seen: now,
                last_reading: None,
                classifications: HashMap::new(),
            });

        if device.status == DeviceStatus::Disconnected {
            device.status = DeviceStatus::Connected;
        }
        device.last_seen = now;

        let mut outcomes = Vec::new();
        for (dimension, value, band) in classify_reading(reading) {
            let prior = device.classifications.get(&dimension).map(|c| c.band);
            let from = match prior {
                Some(p) if p != band => Some(p),
                Some(_) => None,
                None => None,
            };

            let since = match device.classifications.get(&dimension) {
                Some(c) if c.band == band => c.since,
                _ => now,
            };
            device.classifications.insert(
                dimension,
                Classification {
                    dimension,
                    band,
                    value,
                    since,
                },
            );

            outcomes.push(Outcome {
                dimension,
                value,
                band,
                from,
            });
        }

        device.last_reading = Some(reading.clone());
        outcomes
    }

    /// Mark devices silent for longer than `timeout` as disconnected.
    /// Returns the ids that flipped on this sweep.
    pub fn sweep_liveness(&mut self, now: OffsetDateTime, timeout: Duration) -> Vec<String> {
        let mut flipped = Vec::new();
        for (id, device) in self.devices.iter_mut() {
            if device.status == DeviceStatus::Connected && now - device.last_seen > timeout {
                device.status = DeviceStatus::Disconnected;
                flipped.push(id.clone());
            }
        }
        for id in &flipped {
            self.push_event(EventKind::System, format!("{id}: marked DISCONNECTED"));
        }
        flipped
    }

    /// Acknowledge a standing alert: evict it and clear its dedup key so a
    /// later re-entry into the same band raises a fresh alert.
    pub fn acknowledge_alert(&mut self, id: i64) -> bool {
        match self.alerts.remove(&id) {
            Some(alert) => {
                self.unacked
                    .remove(&(alert.device_id, alert.dimension, alert.to_band));
                true
            }
            None => false,
        }
    }

    // -- event ring --------------------------------------------------------

    pub fn record_reading(&mut self, reading: &Reading) {
        self.push_event(
            EventKind::Reading,
            format!("{}: telemetry received", reading.device_id),
        );
    }

    pub fn record_alert(&mut self, detail: String) {
        self.push_event(EventKind::Alert, detail);
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_automation(&mut self, detail: String) {
        self.push_event(EventKind::Automation, detail);
    }

    pub fn record_warning(&mut self, detail: String) {
        self.push_event(EventKind::Warning, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            device_count: self.devices.len(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
