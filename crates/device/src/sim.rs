//! Stateful field-sensor simulator for local development.
//!
//! Models one multi-probe device:
//! - Temporal coherence via random walk with mean reversion per channel
//! - Gradual drying drift (evaporation) on moisture
//! - Slow NPK depletion as the crop feeds
//! - Per-reading electronic noise and occasional spikes
//! - Closed-loop actuator response: moisture rises while the pump runs,
//!   NPK rise while the fertilizer feed runs

use std::fmt;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, steady drift toward dry soil.  Exercises the full
    /// alert + watering path within a few minutes at a short sample period.
    Drying,
    /// Hovers near optimal on every channel.  Good for dashboard work
    /// without triggering automation.
    Stable,
    /// High noise, ~8% spike rate.  Exercises the engine's range vetting.
    Flaky,
    /// Nutrients start low and keep depleting.  Exercises the fertilizer
    /// path.
    Depleted,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "depleted" => Self::Depleted,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Depleted => write!(f, "depleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

/// One telemetry sample, as published on `device/{deviceId}/telemetry`.
#[derive(Debug, Serialize)]
pub struct TelemetryMsg {
    pub timestamp: i64,
    pub moisture: f64,
    pub temperature: f64,
    pub humidity: f64,
    #[serde(rename = "pH")]
    pub ph: f64,
    pub ec: f64,
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
    pub battery: f64,
    pub voltage: f64,
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct Channel {
    /// Current "true" value in natural units.  Evolves each tick.
    base: f64,
    /// Drift applied every tick (sign gives the direction).
    drift: f64,
    /// Random walk step sigma.
    walk_sigma: f64,
    /// Pull strength toward `center`.
    mean_reversion: f64,
    center: f64,
    /// Per-reading noise sigma.
    noise_sigma: f64,
    min: f64,
    max: f64,
}

impl Channel {
    fn step(&mut self, extra: f64) {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        self.base = (self.base + self.drift + pull + walk + extra).clamp(self.min, self.max);
    }

    fn read(&self, spike_prob: f32, spike_sigma: f64) -> f64 {
        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < spike_prob {
            gaussian(0.0, spike_sigma)
        } else {
            0.0
        };
        (self.base + noise + spike).clamp(self.min, self.max)
    }
}

fn channel(base: f64, drift: f64, walk: f64, noise: f64, range: (f64, f64)) -> Channel {
    Channel {
        base,
        drift,
        walk_sigma: walk,
        mean_reversion: 0.02,
        center: base,
        noise_sigma: noise,
        min: range.0,
        max: range.1,
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct TelemetrySim {
    moisture: Channel,
    temperature: Channel,
    humidity: Channel,
    ph: Channel,
    ec: Channel,
    nitrogen: Channel,
    phosphorus: Channel,
    potassium: Channel,
    battery: f64,

    spike_prob: f32,
    watering: bool,
    fertilizing: bool,
    /// Moisture gained per tick while the pump runs (% points).
    wet_rate: f64,
    /// NPK gained per tick while the feed runs (mg/kg).
    feed_rate: f64,
}

impl TelemetrySim {
    pub fn new(scenario: Scenario) -> Self {
        // (moisture start, moisture drift, npk start, npk drift, noise scale, spike prob)
        let (m0, m_drift, npk0, npk_drift, noise, spike_prob) = match scenario {
            Scenario::Drying => (55.0, -0.6, 80.0, -0.05, 1.0, 0.02_f32),
            Scenario::Stable => (55.0, 0.0, 80.0, 0.0, 0.5, 0.005),
            Scenario::Flaky => (50.0, -0.2, 70.0, -0.05, 3.0, 0.08),
            Scenario::Depleted => (50.0, -0.1, 25.0, -0.3, 1.0, 0.02),
        };

        Self {
            moisture: channel(m0, m_drift, 0.8 * noise, 0.5 * noise, (0.0, 100.0)),
            temperature: channel(24.0, 0.0, 0.3 * noise, 0.2 * noise, (-40.0, 85.0)),
            humidity: channel(60.0, 0.0, 0.8 * noise, 0.5 * noise, (0.0, 100.0)),
            ph: channel(6.5, 0.0, 0.03 * noise, 0.02 * noise, (0.0, 14.0)),
            ec: channel(1200.0, 0.0, 15.0 * noise, 10.0 * noise, (0.0, 20000.0)),
            nitrogen: channel(npk0, npk_drift, 1.0 * noise, 0.8 * noise, (0.0, 1000.0)),
            phosphorus: channel(npk0 * 0.6, npk_drift, 1.0 * noise, 0.8 * noise, (0.0, 1000.0)),
            potassium: channel(npk0 * 2.0, npk_drift, 1.5 * noise, 1.0 * noise, (0.0, 2000.0)),
            battery: 100.0,
            spike_prob,
            watering: false,
            fertilizing: false,
            wet_rate: 2.5,
            feed_rate: 3.0,
        }
    }

    /// Inform the simulator whether the water pump is currently running.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    /// Inform the simulator whether the fertilizer feed is currently running.
    pub fn set_fertilizing(&mut self, active: bool) {
        self.fertilizing = active;
    }

    pub fn watering(&self) -> bool {
        self.watering
    }

    pub fn fertilizing(&self) -> bool {
        self.fertilizing
    }

    /// Advance the simulation one tick and produce a telemetry sample.
    pub fn sample(&mut self, ts: i64) -> TelemetryMsg {
        let wet = if self.watering { self.wet_rate } else { 0.0 };
        let feed = if self.fertilizing { self.feed_rate } else { 0.0 };

        self.moisture.step(wet);
        self.temperature.step(0.0);
        self.humidity.step(if self.watering { 0.5 } else { 0.0 });
        self.ph.step(0.0);
        self.ec.step(feed * 5.0);
        self.nitrogen.step(feed);
        self.phosphorus.step(feed * 0.6);
        self.potassium.step(feed * 1.5);

        // Battery only drains; pumping costs extra.
        self.battery = (self.battery - 0.01 - if self.watering { 0.02 } else { 0.0 }).max(0.0);

        TelemetryMsg {
            timestamp: ts,
            moisture: self.moisture.read(self.spike_prob, 15.0),
            temperature: self.temperature.read(self.spike_prob, 5.0),
            humidity: self.humidity.read(self.spike_prob, 10.0),
            ph: self.ph.read(self.spike_prob, 1.0),
            ec: self.ec.read(self.spike_prob, 500.0),
            nitrogen: self.nitrogen.read(self.spike_prob, 20.0),
            phosphorus: self.phosphorus.read(self.spike_prob, 20.0),
            potassium: self.potassium.read(self.spike_prob, 30.0),
            battery: self.battery,
            voltage: 10.5 + 1.5 * self.battery / 100.0 + gaussian(0.0, 0.05),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
