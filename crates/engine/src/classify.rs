//! Agronomic band classification: maps each sensed dimension to a discrete
//! band using one canonical threshold table, and detects band transitions
//! against the previously stored band.
//!
//! Classification is stateless and deterministic: the same value always
//! yields the same band.  Transition bookkeeping lives in the registry; this
//! module only computes.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::normalize::Reading;

// ---------------------------------------------------------------------------
// Dimensions & bands
// ---------------------------------------------------------------------------

/// A sensed dimension that participates in classification.  Rain, humidity,
/// battery and voltage are carried on readings but never banded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Moisture,
    Nitrogen,
    Phosphorus,
    Potassium,
    Ec,
    Ph,
    Temperature,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::Moisture,
        Dimension::Nitrogen,
        Dimension::Phosphorus,
        Dimension::Potassium,
        Dimension::Ec,
        Dimension::Ph,
        Dimension::Temperature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Moisture => "moisture",
            Dimension::Nitrogen => "nitrogen",
            Dimension::Phosphorus => "phosphorus",
            Dimension::Potassium => "potassium",
            Dimension::Ec => "ec",
            Dimension::Ph => "ph",
            Dimension::Temperature => "temperature",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Band {
    // moisture
    Critical,
    Poor,
    Fair,
    Optimal,
    Wet,
    Waterlogged,
    // NPK
    Low,
    Moderate,
    Excess,
    // EC
    LowActivity,
    HighAlkalinity,
    // pH
    Acidic,
    Alkaline,
    VeryHigh,
    // temperature
    Cold,
    Hot,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Critical => "CRITICAL",
            Band::Poor => "POOR",
            Band::Fair => "FAIR",
            Band::Optimal => "OPTIMAL",
            Band::Wet => "WET",
            Band::Waterlogged => "WATERLOGGED",
            Band::Low => "LOW",
            Band::Moderate => "MODERATE",
            Band::Excess => "EXCESS",
            Band::LowActivity => "LOW_ACTIVITY",
            Band::HighAlkalinity => "HIGH_ALKALINITY",
            Band::Acidic => "ACIDIC",
            Band::Alkaline => "ALKALINE",
            Band::VeryHigh => "VERY_HIGH",
            Band::Cold => "COLD",
            Band::Hot => "HOT",
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify a single value.  Lower bounds are inclusive.
pub fn classify(dimension: Dimension, value: f64) -> Band {
    match dimension {
        Dimension::Moisture => match value {
            v if v < 20.0 => Band::Critical,
            v if v < 30.0 => Band::Poor,
            v if v < 40.0 => Band::Fair,
            v if v < 70.0 => Band::Optimal,
            v if v < 90.0 => Band::Wet,
            _ => Band::Waterlogged,
        },
        Dimension::Nitrogen => match value {
            v if v < 40.0 => Band::Low,
            v if v < 90.0 => Band::Moderate,
            v if v < 150.0 => Band::Optimal,
            _ => Band::Excess,
        },
        Dimension::Phosphorus => match value {
            v if v < 15.0 => Band::Low,
            v if v < 35.0 => Band::Moderate,
            v if v < 70.0 => Band::Optimal,
            _ => Band::Excess,
        },
        Dimension::Potassium => match value {
            v if v < 80.0 => Band::Low,
            v if v < 150.0 => Band::Moderate,
            v if v < 280.0 => Band::Optimal,
            _ => Band::Excess,
        },
        Dimension::Ec => match value {
            v if v < 400.0 => Band::LowActivity,
            v if v < 1200.0 => Band::Optimal,
            _ => Band::HighAlkalinity,
        },
        Dimension::Ph => match value {
            v if v < 5.5 => Band::Acidic,
            v if v < 7.0 => Band::Optimal,
            v if v < 8.0 => Band::Alkaline,
            _ => Band::VeryHigh,
        },
        Dimension::Temperature => match value {
            v if v < 15.0 => Band::Cold,
            v if v < 35.0 => Band::Optimal,
            _ => Band::Hot,
        },
    }
}

/// Current per-dimension classification held for a device.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub dimension: Dimension,
    pub band: Band,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
}

/// Result of classifying one dimension of one reading.  `from` is set only
/// when the band differs from the previously stored band for that
/// device+dimension (a transition).
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub dimension: Dimension,
    pub value: f64,
    pub band: Band,
    pub from: Option<Band>,
}

impl Outcome {
    pub fn is_transition(&self) -> bool {
        self.from.is_some()
    }
}

/// Classify every dimension present on a reading.  Dimensions without a
/// sensed value are skipped, not errors.
pub fn classify_reading(reading: &Reading) -> Vec<(Dimension, f64, Band)> {
    Dimension::ALL
        .iter()
        .filter_map(|&dim| {
            reading
                .value_of(dim)
                .map(|v| (dim, v, classify(dim, v)))
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
