//! Pipeline wiring: telemetry dispatch, per-device ingestion workers, the
//! command observer, and the liveness sweep.
//!
//! Readings for one device are processed strictly in arrival order by a
//! dedicated worker; readings for different devices proceed independently.
//! History writes are best-effort: a database failure is logged and the
//! live path keeps going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alert;
use crate::automation::Automation;
use crate::broadcast::{Broadcaster, ClassificationEvent, LiveEvent};
use crate::broker::{Broker, Message};
use crate::db::Db;
use crate::mqtt::{
    device_id_from_command, device_id_from_telemetry, ActuatorCommand, CommandMsg, CommandSink,
    TriggeredBy, COMMAND_PATTERN, TELEMETRY_PATTERN,
};
use crate::normalize::normalize;
use crate::registry::SharedState;

/// Per-device worker queue depth.  A device whose worker is this far behind
/// starts shedding its own readings without touching other devices.
const WORKER_QUEUE: usize = 64;

pub struct Engine<S: CommandSink> {
    pub broker: Broker,
    pub shared: SharedState,
    pub db: Db,
    pub broadcaster: Broadcaster,
    pub automation: Arc<Automation<S>>,
}

impl<S: CommandSink> Engine<S> {
    pub fn new(
        broker: Broker,
        shared: SharedState,
        db: Db,
        broadcaster: Broadcaster,
        automation: Arc<Automation<S>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            shared,
            db,
            broadcaster,
            automation,
        })
    }

    // ----------------------------
    // Telemetry ingestion
    // ----------------------------

    /// Dispatch telemetry to per-device workers.  Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run_ingest(self: Arc<Self>) {
        let mut rx = self.broker.subscribe(TELEMETRY_PATTERN);
        let mut workers: HashMap<String, mpsc::Sender<Message>> = HashMap::new();

        while let Some(msg) = rx.recv().await {
            let Some(device_id) = device_id_from_telemetry(&msg.topic).map(str::to_string)
            else {
                continue;
            };
            let tx = workers.entry(device_id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE);
                tokio::spawn(Arc::clone(&self).run_device_worker(device_id.clone(), rx));
                tx
            });
            if tx.try_send(msg).is_err() {
                warn!(device = %device_id, "ingestion worker backlogged, reading dropped");
            }
        }
    }

    /// Process one device's readings in order.
    async fn run_device_worker(self: Arc<Self>, device_id: String, mut rx: mpsc::Receiver<Message>) {
        while let Some(msg) = rx.recv().await {
            self.ingest(&device_id, &msg.payload).await;
        }
    }

    /// The full path for one raw telemetry payload.
    async fn ingest(&self, device_id: &str, payload: &[u8]) {
        let now = OffsetDateTime::now_utc();
        let reading = match normalize(device_id, payload, now) {
            Ok(r) => r,
            Err(e) => {
                warn!(device = device_id, "malformed telemetry rejected: {e:#}");
                let mut st = self.shared.write().await;
                st.record_error(format!("{device_id}: malformed telemetry rejected"));
                return;
            }
        };

        // Classify and raise alerts under one lock so no observer sees a
        // reading without its classification.
        let (outcomes, alerts) = {
            let mut st = self.shared.write().await;
            let outcomes = st.apply_reading(&reading, now);
            st.record_reading(&reading);
            let alerts = alert::process_outcomes(&mut st, device_id, &outcomes, now);
            (outcomes, alerts)
        };

        if let Err(e) = self
            .db
            .upsert_device(device_id, None, crate::registry::DeviceStatus::Connected, now.unix_timestamp())
            .await
        {
            warn!(device = device_id, "device upsert failed: {e:#}");
        }
        if let Err(e) = self.db.insert_reading(&reading).await {
            warn!(device = device_id, "reading not persisted: {e:#}");
        }
        for a in &alerts {
            if let Err(e) = self.db.insert_alert(a).await {
                warn!(device = device_id, alert = a.id, "alert not persisted: {e:#}");
            }
        }

        self.broadcaster.publish(LiveEvent::Reading(reading));
        for o in outcomes.iter().filter(|o| o.is_transition()) {
            self.broadcaster
                .publish(LiveEvent::Classification(ClassificationEvent {
                    device_id: device_id.to_string(),
                    dimension: o.dimension,
                    band: o.band,
                    value: o.value,
                    from: o.from,
                }));
        }
        for a in alerts {
            self.broadcaster.publish(LiveEvent::Alert(a));
        }

        self.automation.on_classification(device_id, &outcomes).await;
    }

    // ----------------------------
    // Command observation
    // ----------------------------

    /// Observe every command on the bus, whatever issued it: log it, feed
    /// the live feed, and hand MANUAL ones to the automation controller so
    /// the override window opens.  Intended to be `tokio::spawn`-ed.
    pub async fn run_command_observer(self: Arc<Self>) {
        let mut rx = self.broker.subscribe(COMMAND_PATTERN);
        while let Some(msg) = rx.recv().await {
            let Some(device_id) = device_id_from_command(&msg.topic) else {
                continue;
            };
            let wire: CommandMsg = match serde_json::from_slice(&msg.payload) {
                Ok(w) => w,
                Err(e) => {
                    warn!(device = device_id, "malformed command ignored: {e}");
                    continue;
                }
            };
            let cmd = ActuatorCommand::from_wire(device_id, wire, OffsetDateTime::now_utc());

            {
                let mut st = self.shared.write().await;
                st.record_command(format!(
                    "{device_id}: {} {:?} ({:?})",
                    cmd.actuator.as_str(),
                    cmd.action,
                    cmd.triggered_by
                ));
            }
            if let Err(e) = self.db.insert_command(&cmd).await {
                warn!(device = device_id, "command not persisted: {e:#}");
            }
            self.broadcaster.publish(LiveEvent::Command(cmd.clone()));

            if cmd.triggered_by == TriggeredBy::Manual {
                self.automation.on_manual_command(&cmd).await;
            }
        }
    }

    // ----------------------------
    // Liveness
    // ----------------------------

    /// Periodically mark silent devices disconnected.  Intended to be
    /// `tokio::spawn`-ed.
    pub async fn run_liveness_sweep(self: Arc<Self>, timeout: Duration, sweep_every: Duration) {
        let timeout = time::Duration::try_from(timeout).unwrap_or(time::Duration::minutes(2));
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            let now = OffsetDateTime::now_utc();
            let flipped = {
                let mut st = self.shared.write().await;
                st.sweep_liveness(now, timeout)
            };
            for id in flipped {
                info!(device = %id, "device silent past timeout, marked disconnected");
                if let Err(e) = self
                    .db
                    .upsert_device(&id, None, crate::registry::DeviceStatus::Disconnected, now.unix_timestamp())
                    .await
                {
                    warn!(device = %id, "disconnect not persisted: {e:#}");
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
