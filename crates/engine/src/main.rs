mod alert;
mod automation;
mod broadcast;
mod broker;
mod classify;
mod config;
mod db;
mod engine;
mod mqtt;
mod normalize;
mod registry;
mod weather;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use automation::Automation;
use broadcast::Broadcaster;
use broker::Broker;
use db::Db;
use engine::Engine;
use mqtt::MqttCommandSink;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;

    // Env overrides for containerized deployments.
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }
    if let Ok(url) = env::var("DB_URL") {
        cfg.database.url = url;
    }
    if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.web.port = port;
    }

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;

    // ── Shared state ────────────────────────────────────────────────
    let shared = registry::shared();
    {
        let mut st = shared.write().await;
        st.seed_alert_ids(db.max_alert_id().await?);
        st.seed_devices(&db.list_devices().await?);
        st.record_system("engine started".to_string());
    }

    // ── Transport ───────────────────────────────────────────────────
    let broker = Broker::new(cfg.engine.bus_queue_capacity);
    let broadcaster = Broadcaster::new(cfg.engine.broadcast_capacity);

    let mqtt_client = if cfg.mqtt.enabled {
        let mut options = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 20);
        tokio::spawn(mqtt::run_bridge(
            client.clone(),
            eventloop,
            broker.clone(),
            Arc::clone(&shared),
        ));
        info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "mqtt bridge starting");
        Some(client)
    } else {
        info!("mqtt bridge disabled, internal bus only");
        None
    };

    // ── Weather signal ──────────────────────────────────────────────
    let (rain_tx, rain_rx) = weather::channel();
    if cfg.weather.enabled {
        tokio::spawn(weather::run_poller(cfg.weather_settings(), rain_tx));
    }

    // ── Automation ──────────────────────────────────────────────────
    let sink = MqttCommandSink::new(broker.clone(), mqtt_client);
    let automation = Arc::new(Automation::new(
        sink.clone(),
        cfg.automation_settings(),
        rain_rx,
        Arc::clone(&shared),
    ));
    tokio::spawn(
        Arc::clone(&automation).run(Duration::from_secs(cfg.automation.tick_interval_secs)),
    );

    // ── Pipeline ────────────────────────────────────────────────────
    let engine = Engine::new(
        broker.clone(),
        Arc::clone(&shared),
        db.clone(),
        broadcaster.clone(),
        Arc::clone(&automation),
    );
    tokio::spawn(Arc::clone(&engine).run_ingest());
    tokio::spawn(Arc::clone(&engine).run_command_observer());
    tokio::spawn(Arc::clone(&engine).run_liveness_sweep(
        Duration::from_secs(cfg.engine.liveness_timeout_secs),
        Duration::from_secs(cfg.engine.liveness_sweep_secs),
    ));

    // ── Query API + live feed ───────────────────────────────────────
    web::serve(
        AppState {
            shared,
            db,
            automation,
            broadcaster,
            sink,
        },
        cfg.web.port,
    )
    .await
}
