//! Rain-expectation signal for the automation controller.
//!
//! Polls Open-Meteo (key-less) for today's precipitation probability and
//! publishes it as a 0.0..=1.0 value on a watch channel.  A failed fetch
//! keeps the last known value; the signal starts at 0.0 (no veto) until the
//! first successful poll.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

const OPEN_METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[derive(Debug, Clone)]
pub struct WeatherSettings {
    pub latitude: f64,
    pub longitude: f64,
    pub poll_interval_secs: u64,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            poll_interval_secs: 900,
        }
    }
}

/// Create the rain-probability channel, initialized to "no rain expected".
pub fn channel() -> (watch::Sender<f64>, watch::Receiver<f64>) {
    watch::channel(0.0)
}

// ---------------------------------------------------------------------------
// Open-Meteo response
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    daily: DailyBlock,
}

#[derive(Debug, Deserialize)]
struct DailyBlock {
    precipitation_probability_max: Vec<Option<f64>>,
}

/// Extract today's rain probability (0.0..=1.0) from a forecast body.
fn parse_rain_probability(body: &str) -> Result<f64> {
    let resp: ForecastResponse =
        serde_json::from_str(body).context("unexpected forecast response shape")?;
    let pct = resp
        .daily
        .precipitation_probability_max
        .first()
        .copied()
        .flatten()
        .context("forecast contains no precipitation probability")?;
    Ok((pct / 100.0).clamp(0.0, 1.0))
}

async fn fetch_rain_probability(client: &reqwest::Client, cfg: &WeatherSettings) -> Result<f64> {
    let body = client
        .get(OPEN_METEO_URL)
        .query(&[
            ("latitude", cfg.latitude.to_string()),
            ("longitude", cfg.longitude.to_string()),
            ("daily", "precipitation_probability_max".to_string()),
            ("forecast_days", "1".to_string()),
            ("timezone", "auto".to_string()),
        ])
        .send()
        .await
        .context("weather request failed")?
        .error_for_status()
        .context("weather service returned an error status")?
        .text()
        .await
        .context("weather response read failed")?;
    parse_rain_probability(&body)
}

/// Run the poller loop.  Intended to be `tokio::spawn`-ed from main.
pub async fn run_poller(cfg: WeatherSettings, tx: watch::Sender<f64>) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs.max(60)));
    loop {
        ticker.tick().await;
        match fetch_rain_probability(&client, &cfg).await {
            Ok(probability) => {
                debug!(probability, "rain probability updated");
                let _ = tx.send(probability);
            }
            Err(e) => {
                // Keep the last known value; stale beats wrong-to-zero.
                warn!("weather poll failed: {e:#}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
