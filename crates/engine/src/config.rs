//! TOML config file loading and validation.  Every section is optional; a
//! missing file runs the engine on defaults.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::automation::AutomationSettings;
use crate::weather::WeatherSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub weather: WeatherSection,
    #[serde(default)]
    pub automation: AutomationSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".into(),
            port: 1883,
            client_id: "smartag-engine".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:smartag.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WeatherSection {
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub poll_interval_secs: u64,
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            enabled: false,
            latitude: 0.0,
            longitude: 0.0,
            poll_interval_secs: 900,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AutomationSection {
    pub water_duration_secs: u64,
    pub fertilizer_duration_secs: u64,
    pub override_secs: u64,
    pub retry_backoff_ms: u64,
    pub rain_veto_threshold: f64,
    pub tick_interval_secs: u64,
}

impl Default for AutomationSection {
    fn default() -> Self {
        let s = AutomationSettings::default();
        Self {
            water_duration_secs: s.water_duration_secs,
            fertilizer_duration_secs: s.fertilizer_duration_secs,
            override_secs: s.override_secs,
            retry_backoff_ms: s.retry_backoff_ms,
            rain_veto_threshold: s.rain_veto_threshold,
            tick_interval_secs: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub liveness_timeout_secs: u64,
    pub liveness_sweep_secs: u64,
    pub broadcast_capacity: usize,
    pub bus_queue_capacity: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 120,
            liveness_sweep_secs: 30,
            broadcast_capacity: 256,
            bus_queue_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole config.  Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if self.database.url.trim().is_empty() {
            errors.push("database.url is empty".into());
        }

        if self.weather.enabled {
            if !(-90.0..=90.0).contains(&self.weather.latitude) {
                errors.push(format!(
                    "weather.latitude {} out of range [-90, 90]",
                    self.weather.latitude
                ));
            }
            if !(-180.0..=180.0).contains(&self.weather.longitude) {
                errors.push(format!(
                    "weather.longitude {} out of range [-180, 180]",
                    self.weather.longitude
                ));
            }
            if self.weather.poll_interval_secs < 60 {
                errors.push(format!(
                    "weather.poll_interval_secs must be at least 60, got {}",
                    self.weather.poll_interval_secs
                ));
            }
        }

        if self.automation.water_duration_secs == 0 {
            errors.push("automation.water_duration_secs must be positive".into());
        }
        if self.automation.fertilizer_duration_secs == 0 {
            errors.push("automation.fertilizer_duration_secs must be positive".into());
        }
        if self.automation.override_secs == 0 {
            errors.push("automation.override_secs must be positive".into());
        }
        if self.automation.tick_interval_secs == 0 {
            errors.push("automation.tick_interval_secs must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.automation.rain_veto_threshold) {
            errors.push(format!(
                "automation.rain_veto_threshold {} out of range [0.0, 1.0]",
                self.automation.rain_veto_threshold
            ));
        }

        if self.engine.liveness_timeout_secs == 0 {
            errors.push("engine.liveness_timeout_secs must be positive".into());
        }
        if self.engine.liveness_sweep_secs == 0 {
            errors.push("engine.liveness_sweep_secs must be positive".into());
        }
        if self.engine.liveness_sweep_secs > self.engine.liveness_timeout_secs {
            errors.push(format!(
                "engine.liveness_sweep_secs ({}) exceeds liveness_timeout_secs ({})",
                self.engine.liveness_sweep_secs, self.engine.liveness_timeout_secs
            ));
        }
        if self.engine.broadcast_capacity == 0 {
            errors.push("engine.broadcast_capacity must be positive".into());
        }
        if self.engine.bus_queue_capacity == 0 {
            errors.push("engine.bus_queue_capacity must be positive".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    pub fn automation_settings(&self) -> AutomationSettings {
        AutomationSettings {
            water_duration_secs: self.automation.water_duration_secs,
            fertilizer_duration_secs: self.automation.fertilizer_duration_secs,
            override_secs: self.automation.override_secs,
            retry_backoff_ms: self.automation.retry_backoff_ms,
            rain_veto_threshold: self.automation.rain_veto_threshold,
        }
    }

    pub fn weather_settings(&self) -> WeatherSettings {
        WeatherSettings {
            latitude: self.weather.latitude,
            longitude: self.weather.longitude,
            poll_interval_secs: self.weather.poll_interval_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.  A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.mqtt.enabled);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.automation.water_duration_secs, 300);
        assert_eq!(config.engine.liveness_timeout_secs, 120);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
[mqtt]
host = "broker.lan"
port = 1884

[automation]
water_duration_secs = 600
"#,
        )
        .unwrap();
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.automation.water_duration_secs, 600);
        // Untouched sections keep defaults.
        assert_eq!(config.automation.fertilizer_duration_secs, 600);
        assert_eq!(config.web.port, 8080);
    }

    #[test]
    fn parse_full_config() {
        let config: Config = toml::from_str(
            r#"
[mqtt]
enabled = false
host = "broker.lan"
port = 1883
client_id = "engine-1"

[web]
port = 9090

[database]
url = "sqlite:/var/lib/smartag/history.db?mode=rwc"

[weather]
enabled = true
latitude = 52.52
longitude = 13.4
poll_interval_secs = 600

[automation]
water_duration_secs = 300
fertilizer_duration_secs = 600
override_secs = 3600
retry_backoff_ms = 250
rain_veto_threshold = 0.6
tick_interval_secs = 2

[engine]
liveness_timeout_secs = 180
liveness_sweep_secs = 30
broadcast_capacity = 512
bus_queue_capacity = 128
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(!config.mqtt.enabled);
        assert!(config.weather.enabled);
        assert_eq!(config.weather_settings().poll_interval_secs, 600);
        assert_eq!(config.automation_settings().rain_veto_threshold, 0.6);
    }

    // -- Validation --------------------------------------------------------

    #[test]
    fn empty_mqtt_host_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.host = " ".into();
        assert_validation_err(&cfg, "mqtt.host is empty");
    }

    #[test]
    fn empty_database_url_rejected() {
        let mut cfg = Config::default();
        cfg.database.url = "".into();
        assert_validation_err(&cfg, "database.url is empty");
    }

    #[test]
    fn weather_coords_checked_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.weather.latitude = 200.0;
        cfg.validate().unwrap(); // disabled, tolerated

        cfg.weather.enabled = true;
        assert_validation_err(&cfg, "weather.latitude 200 out of range");
    }

    #[test]
    fn weather_poll_interval_floor() {
        let mut cfg = Config::default();
        cfg.weather.enabled = true;
        cfg.weather.poll_interval_secs = 10;
        assert_validation_err(&cfg, "poll_interval_secs must be at least 60");
    }

    #[test]
    fn zero_durations_rejected() {
        let mut cfg = Config::default();
        cfg.automation.water_duration_secs = 0;
        assert_validation_err(&cfg, "water_duration_secs must be positive");
    }

    #[test]
    fn rain_threshold_bounds() {
        let mut cfg = Config::default();
        cfg.automation.rain_veto_threshold = 1.5;
        assert_validation_err(&cfg, "rain_veto_threshold 1.5 out of range");
    }

    #[test]
    fn sweep_cannot_exceed_timeout() {
        let mut cfg = Config::default();
        cfg.engine.liveness_timeout_secs = 60;
        cfg.engine.liveness_sweep_secs = 120;
        assert_validation_err(&cfg, "liveness_sweep_secs (120) exceeds");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.mqtt.host = "".into();
        cfg.database.url = "".into();
        cfg.automation.override_secs = 0;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("mqtt.host"));
        assert!(msg.contains("database.url"));
        assert!(msg.contains("override_secs"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = load("/definitely/not/a/real/config.toml").unwrap();
        assert_eq!(config.web.port, 8080);
    }
}
