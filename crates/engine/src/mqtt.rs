//! MQTT-facing pieces: topic conventions, actuator command wire format, the
//! bridge that feeds external device traffic into the in-process bus, and
//! the production [`CommandSink`].

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::registry::SharedState;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub const TELEMETRY_PATTERN: &str = "device/+/telemetry";
pub const COMMAND_PATTERN: &str = "device/+/command";

pub fn telemetry_topic(device_id: &str) -> String {
    format!("device/{device_id}/telemetry")
}

pub fn command_topic(device_id: &str) -> String {
    format!("device/{device_id}/command")
}

/// Extract device_id from "device/<device_id>/telemetry".
pub fn device_id_from_telemetry(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "device" && parts[2] == "telemetry" {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract device_id from "device/<device_id>/command".
pub fn device_id_from_command(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "device" && parts[2] == "command" {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Actuator commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Actuator {
    Water,
    Fertilizer,
}

impl Actuator {
    pub const ALL: [Actuator; 2] = [Actuator::Water, Actuator::Fertilizer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Actuator::Water => "WATER",
            Actuator::Fertilizer => "FERTILIZER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandAction {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggeredBy {
    AiSystem,
    Manual,
}

/// Payload published on `device/{deviceId}/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMsg {
    pub status: CommandAction,
    #[serde(rename = "type")]
    pub actuator: Actuator,
    #[serde(default)]
    pub duration: u64,
    #[serde(rename = "triggeredBy")]
    pub triggered_by: TriggeredBy,
}

/// A command with full provenance, as tracked by the engine.  Serialized
/// on the live feed and API responses, camelCase like every other payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorCommand {
    pub device_id: String,
    pub actuator: Actuator,
    pub action: CommandAction,
    pub duration_secs: u64,
    pub triggered_by: TriggeredBy,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl ActuatorCommand {
    pub fn wire(&self) -> CommandMsg {
        CommandMsg {
            status: self.action,
            actuator: self.actuator,
            duration: self.duration_secs,
            triggered_by: self.triggered_by,
        }
    }

    pub fn from_wire(device_id: &str, msg: CommandMsg, issued_at: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            actuator: msg.actuator,
            action: msg.status,
            duration_secs: msg.duration,
            triggered_by: msg.triggered_by,
            issued_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Command sink
// ---------------------------------------------------------------------------

/// Outbound command delivery seam.  The automation controller only talks to
/// this; production wires it to MQTT plus the internal bus, tests swap in a
/// mock to exercise delivery-failure handling.
pub trait CommandSink: Send + Sync + 'static {
    fn send(&self, cmd: &ActuatorCommand) -> impl Future<Output = Result<()>> + Send;
}

/// Production sink: publishes the wire payload to the external MQTT broker
/// (the device's command channel) and mirrors it onto the in-process bus so
/// the command observer, broadcaster, and history store all see it.
#[derive(Clone)]
pub struct MqttCommandSink {
    broker: Broker,
    mqtt: Option<AsyncClient>,
}

impl MqttCommandSink {
    pub fn new(broker: Broker, mqtt: Option<AsyncClient>) -> Self {
        Self { broker, mqtt }
    }
}

impl CommandSink for MqttCommandSink {
    fn send(&self, cmd: &ActuatorCommand) -> impl Future<Output = Result<()>> + Send {
        let topic = command_topic(&cmd.device_id);
        let payload = serde_json::to_vec(&cmd.wire());
        let broker = self.broker.clone();
        let mqtt = self.mqtt.clone();
        async move {
            let payload = payload.context("serialize command payload")?;
            broker.publish(&topic, &payload);
            if let Some(client) = mqtt {
                client
                    .publish(&topic, QoS::AtLeastOnce, false, payload)
                    .await
                    .with_context(|| format!("mqtt publish to {topic} failed"))?;
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Forward external MQTT telemetry into the in-process bus and keep the
/// connectivity flag current.  Intended to be `tokio::spawn`-ed from main.
pub async fn run_bridge(
    client: AsyncClient,
    mut eventloop: EventLoop,
    broker: Broker,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if device_id_from_telemetry(&p.topic).is_some() {
                    broker.publish(&p.topic, &p.payload);
                } else {
                    warn!(topic = %p.topic, "unhandled mqtt topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(e) = client.subscribe(TELEMETRY_PATTERN, QoS::AtLeastOnce).await {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
