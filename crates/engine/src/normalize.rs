//! Reading normalizer: turns raw telemetry payload bytes into a canonical
//! [`Reading`] or rejects them.
//!
//! Validation policy: a payload that does not parse as a JSON object is
//! rejected outright.  Individual numeric fields that are non-finite or
//! outside their physical range are dropped from the record; partial data
//! is better than no data.  Unknown fields are ignored.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::classify::Dimension;

// ---------------------------------------------------------------------------
// Canonical reading
// ---------------------------------------------------------------------------

/// Immutable snapshot of one telemetry message after validation.  Every
/// numeric field is optional; a missing field simply skips classification
/// of that dimension.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
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

impl Reading {
    pub fn empty(device_id: &str, ts: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            ts,
            moisture: None,
            rain: None,
            nitrogen: None,
            phosphorus: None,
            potassium: None,
            ec: None,
            ph: None,
            temperature: None,
            humidity: None,
            battery: None,
            voltage: None,
        }
    }

    /// Sensed value for a classifiable dimension, if present.
    pub fn value_of(&self, dimension: Dimension) -> Option<f64> {
        match dimension {
            Dimension::Moisture => self.moisture,
            Dimension::Nitrogen => self.nitrogen,
            Dimension::Phosphorus => self.phosphorus,
            Dimension::Potassium => self.potassium,
            Dimension::Ec => self.ec,
            Dimension::Ph => self.ph,
            Dimension::Temperature => self.temperature,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

/// Device timestamps arrive either as unix seconds or as an RFC 3339 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTs {
    Unix(i64),
    Rfc3339(String),
}

#[derive(Debug, Deserialize)]
struct WirePayload {
    timestamp: Option<WireTs>,
    moisture: Option<f64>,
    rain: Option<f64>,
    nitrogen: Option<f64>,
    phosphorus: Option<f64>,
    potassium: Option<f64>,
    ec: Option<f64>,
    #[serde(rename = "pH", alias = "ph")]
    ph: Option<f64>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    battery: Option<f64>,
    voltage: Option<f64>,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Physical sanity range per field.  Values outside are sensor glitches and
/// get dropped from the record.
fn sane_range(field: &str) -> (f64, f64) {
    match field {
        "moisture" | "rain" | "humidity" | "battery" => (0.0, 100.0),
        "nitrogen" | "phosphorus" => (0.0, 1000.0),
        "potassium" => (0.0, 2000.0),
        "ec" => (0.0, 20000.0),
        "pH" => (0.0, 14.0),
        "temperature" => (-40.0, 85.0),
        "voltage" => (0.0, 24.0),
        _ => (f64::NEG_INFINITY, f64::INFINITY),
    }
}

fn vet(device_id: &str, field: &'static str, value: Option<f64>) -> Option<f64> {
    let v = value?;
    if !v.is_finite() {
        warn!(device = %device_id, field, "dropping non-finite field");
        return None;
    }
    let (lo, hi) = sane_range(field);
    if v < lo || v > hi {
        warn!(device = %device_id, field, value = v, "dropping out-of-range field");
        return None;
    }
    Some(v)
}

/// Normalize one telemetry payload.  `received_at` stamps the reading when
/// the device sent no usable timestamp.
pub fn normalize(
    device_id: &str,
    payload: &[u8],
    received_at: OffsetDateTime,
) -> Result<Reading> {
    let wire: WirePayload = serde_json::from_slice(payload)
        .with_context(|| format!("unparseable telemetry from '{device_id}'"))?;

    if device_id.trim().is_empty() {
        bail!("empty device id");
    }

    let ts = match wire.timestamp {
        Some(WireTs::Unix(secs)) => OffsetDateTime::from_unix_timestamp(secs)
            .ok()
            .unwrap_or(received_at),
        Some(WireTs::Rfc3339(s)) => {
            OffsetDateTime::parse(&s, &time::format_description::well_known::Rfc3339)
                .ok()
                .unwrap_or(received_at)
        }
        None => received_at,
    };

    Ok(Reading {
        device_id: device_id.to_string(),
        ts,
        moisture: vet(device_id, "moisture", wire.moisture),
        rain: vet(device_id, "rain", wire.rain),
        nitrogen: vet(device_id, "nitrogen", wire.nitrogen),
        phosphorus: vet(device_id, "phosphorus", wire.phosphorus),
        potassium: vet(device_id, "potassium", wire.potassium),
        ec: vet(device_id, "ec", wire.ec),
        ph: vet(device_id, "pH", wire.ph),
        temperature: vet(device_id, "temperature", wire.temperature),
        humidity: vet(device_id, "humidity", wire.humidity),
        battery: vet(device_id, "battery", wire.battery),
        voltage: vet(device_id, "voltage", wire.voltage),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
