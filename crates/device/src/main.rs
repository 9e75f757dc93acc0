mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Scenario, TelemetrySim};

/// Payload received on `device/{deviceId}/command`.
#[derive(Debug, Deserialize)]
struct CommandMsg {
    status: String,
    #[serde(rename = "type")]
    actuator: String,
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "field-1".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let scenario = Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_default(),
    );

    let mut mqttoptions = MqttOptions::new(
        format!("smartag-device-{device_id}"),
        broker,
        port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let telemetry_topic = format!("device/{device_id}/telemetry");
    let command_topic = format!("device/{device_id}/command");

    // ── Command listener ────────────────────────────────────────────
    // The eventloop task forwards parsed commands to the sample loop so the
    // simulator can model the actuator response.
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<CommandMsg>();
    {
        let client = client.clone();
        let command_topic = command_topic.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to mqtt");
                        if let Err(e) = client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                            warn!("command subscribe failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        match serde_json::from_slice::<CommandMsg>(&p.payload) {
                            Ok(cmd) => {
                                let _ = cmd_tx.send(cmd);
                            }
                            Err(e) => warn!("bad command json: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. retrying...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    // ── Sample loop ─────────────────────────────────────────────────
    let mut simulator = TelemetrySim::new(scenario);
    info!(device = %device_id, %scenario, "publishing to {telemetry_topic} every {sample_every_s}s");

    loop {
        // Apply any commands that arrived since the last sample.
        while let Ok(cmd) = cmd_rx.try_recv() {
            let on = cmd.status == "ON";
            match cmd.actuator.as_str() {
                "WATER" => {
                    info!(on, "pump command");
                    simulator.set_watering(on);
                }
                "FERTILIZER" => {
                    info!(on, "feed command");
                    simulator.set_fertilizing(on);
                }
                other => warn!("unknown actuator '{other}' ignored"),
            }
        }

        let msg = simulator.sample(now_unix());
        let payload = serde_json::to_vec(&msg)?;
        if let Err(e) = client
            .publish(&telemetry_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("publish error: {e}");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_is_recent() {
        let ts = now_unix();
        assert!(ts > 1_704_067_200, "timestamp too old: {ts}");
        assert!(ts < 2_208_988_800, "timestamp too far in future: {ts}");
    }

    #[test]
    fn command_msg_parses_engine_payload() {
        let cmd: CommandMsg = serde_json::from_str(
            r#"{"status":"ON","type":"WATER","duration":300,"triggeredBy":"AI_SYSTEM"}"#,
        )
        .unwrap();
        assert_eq!(cmd.status, "ON");
        assert_eq!(cmd.actuator, "WATER");
    }

    #[test]
    fn command_msg_rejects_non_json() {
        assert!(serde_json::from_slice::<CommandMsg>(b"OFF").is_err());
    }
}
