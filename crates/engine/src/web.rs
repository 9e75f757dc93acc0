//! HTTP query API and the websocket live feed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::automation::Automation;
use crate::broadcast::Broadcaster;
use crate::db::Db;
use crate::mqtt::{Actuator, ActuatorCommand, CommandAction, CommandSink, MqttCommandSink, TriggeredBy};
use crate::registry::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub automation: Arc<Automation<MqttCommandSink>>,
    pub broadcaster: Broadcaster,
    pub sink: MqttCommandSink,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}/readings", get(device_readings))
        .route("/api/devices/{id}/commands", get(device_commands))
        .route("/api/devices/{id}/automation", get(device_automation))
        .route("/api/devices/{id}/command", post(post_command))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/{id}/read", post(acknowledge_alert))
        .route("/api/live", get(live_feed))
        .with_state(app)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

async fn list_devices(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.devices.clone())
}

// ---------------------------------------------------------------------------
// History queries
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn device_readings(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let rows = app
        .db
        .recent_readings(&id, q.limit.clamp(1, 1000))
        .await
        .map_err(internal)?;
    Ok(Json(rows))
}

async fn device_commands(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let rows = app
        .db
        .recent_commands(&id, q.limit.clamp(1, 1000))
        .await
        .map_err(internal)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct AlertQuery {
    #[serde(default, rename = "unreadOnly")]
    unread_only: bool,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn list_alerts(
    State(app): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let rows = app
        .db
        .list_alerts(q.unread_only, q.limit.clamp(1, 1000))
        .await
        .map_err(internal)?;
    Ok(Json(rows))
}

async fn acknowledge_alert(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let known_live = {
        let mut st = app.shared.write().await;
        st.acknowledge_alert(id)
    };
    let known_stored = app.db.mark_alert_read(id).await.map_err(internal)?;
    if known_live || known_stored {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("no alert with id {id}")))
    }
}

// ---------------------------------------------------------------------------
// Manual commands & automation status
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CommandRequest {
    action: CommandAction,
    actuator: Actuator,
    #[serde(default)]
    duration: u64,
}

async fn post_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let cmd = ActuatorCommand {
        device_id: id,
        actuator: req.actuator,
        action: req.action,
        duration_secs: req.duration,
        triggered_by: TriggeredBy::Manual,
        issued_at: OffsetDateTime::now_utc(),
    };
    app.sink
        .send(&cmd)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("command delivery failed: {e:#}")))?;
    info!(
        device = %cmd.device_id,
        actuator = cmd.actuator.as_str(),
        "manual command accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(cmd)))
}

async fn device_automation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(app.automation.snapshot(&id).await)
}

// ---------------------------------------------------------------------------
// Live feed
// ---------------------------------------------------------------------------

async fn live_feed(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    let rx = app.broadcaster.subscribe();
    ws.on_upgrade(move |socket| stream_live(socket, rx))
}

async fn stream_live(
    mut socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<crate::broadcast::LiveEvent>,
) {
    debug!("live observer connected");
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break; // observer went away
                }
            }
            // Slow observer: its oldest buffered events were dropped, keep
            // streaming from where the ring now starts.
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "live observer lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("live observer disconnected");
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("api listening on http://{addr}");
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
