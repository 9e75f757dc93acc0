//! Alert generation from classification transitions: actionable-band
//! filtering, fixed severity mapping, dedup against standing unacknowledged
//! alerts, and auto-resolve on recovery to OPTIMAL.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::classify::{Band, Dimension, Outcome};
use crate::registry::SystemState;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: i64,
    pub device_id: String,
    pub severity: Severity,
    pub dimension: Dimension,
    pub from_band: Band,
    pub to_band: Band,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_read: bool,
}

// ---------------------------------------------------------------------------
// Band policy
// ---------------------------------------------------------------------------

/// Bands whose entry raises an alert.
pub fn is_actionable(band: Band) -> bool {
    matches!(
        band,
        Band::Critical
            | Band::Poor
            | Band::Excess
            | Band::HighAlkalinity
            | Band::VeryHigh
            | Band::Hot
            | Band::Waterlogged
            | Band::Acidic
    )
}

/// Fixed severity per band.
pub fn severity_of(band: Band) -> Severity {
    match band {
        Band::Critical | Band::Waterlogged | Band::VeryHigh | Band::Excess => Severity::Critical,
        Band::Poor | Band::Acidic | Band::Hot | Band::HighAlkalinity => Severity::Warning,
        _ => Severity::Info,
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Consume the outcomes of one reading and produce the alerts they warrant.
/// Every returned alert corresponds to a real band transition.  Transitions
/// into OPTIMAL auto-resolve standing alerts for that device+dimension.
pub fn process_outcomes(
    state: &mut SystemState,
    device_id: &str,
    outcomes: &[Outcome],
    now: OffsetDateTime,
) -> Vec<Alert> {
    let mut created = Vec::new();

    for outcome in outcomes {
        let Some(from) = outcome.from else {
            continue; // no transition, nothing to do
        };

        if outcome.band == Band::Optimal {
            auto_resolve(state, device_id, outcome.dimension);
            continue;
        }

        if !is_actionable(outcome.band) {
            continue; // recorded in history, no alert
        }

        let key = (device_id.to_string(), outcome.dimension, outcome.band);
        if state.unacked.contains(&key) {
            continue; // standing unacknowledged alert for this exact combination
        }

        let id = state.next_alert_id;
        state.next_alert_id += 1;

        let alert = Alert {
            id,
            device_id: device_id.to_string(),
            severity: severity_of(outcome.band),
            dimension: outcome.dimension,
            from_band: from,
            to_band: outcome.band,
            created_at: now,
            is_read: false,
        };

        info!(
            device = device_id,
            dimension = outcome.dimension.as_str(),
            from = from.as_str(),
            to = outcome.band.as_str(),
            severity = alert.severity.as_str(),
            "alert raised"
        );
        state.record_alert(format!(
            "{device_id}: {} {} -> {} ({})",
            outcome.dimension.as_str(),
            from.as_str(),
            outcome.band.as_str(),
            alert.severity.as_str()
        ));

        state.unacked.insert(key);
        state.alerts.insert(id, alert.clone());
        created.push(alert);
    }

    created
}

/// Evict every standing alert for this device+dimension and clear its
/// dedup key.  A genuine later relapse then raises a fresh alert; the
/// resolved alerts remain queryable through the history store.
fn auto_resolve(state: &mut SystemState, device_id: &str, dimension: Dimension) {
    let ids: Vec<i64> = state
        .alerts
        .values()
        .filter(|a| a.device_id == device_id && a.dimension == dimension)
        .map(|a| a.id)
        .collect();

    for id in ids {
        if let Some(alert) = state.alerts.remove(&id) {
            state
                .unacked
                .remove(&(alert.device_id, alert.dimension, alert.to_band));
        }
        state.record_alert(format!(
            "{device_id}: {} recovered to OPTIMAL, alert {id} auto-resolved",
            dimension.as_str()
        ));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
