//! Live state fan-out to dashboard observers.
//!
//! Built on `tokio::sync::broadcast`: every observer holds its own receiver
//! cursor over a bounded ring, so a slow or stalled observer can never
//! block ingestion.  When an observer falls behind it loses its *oldest*
//! buffered events and resumes close to current state; per-observer
//! delivery preserves publish order.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::alert::Alert;
use crate::classify::{Band, Dimension};
use crate::mqtt::ActuatorCommand;
use crate::normalize::Reading;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationEvent {
    pub device_id: String,
    pub dimension: Dimension,
    pub band: Band,
    pub value: f64,
    pub from: Option<Band>,
}

/// One outbound event on the live feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum LiveEvent {
    Reading(Reading),
    Classification(ClassificationEvent),
    Alert(Alert),
    Command(ActuatorCommand),
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<LiveEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Push one event to every connected observer.  Never blocks; with no
    /// observers connected the event is simply discarded.
    pub fn publish(&self, event: LiveEvent) {
        let _ = self.tx.send(event);
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use tokio::sync::broadcast::error::RecvError;

    fn reading_event(seq: f64) -> LiveEvent {
        let mut r = Reading::empty("d1", OffsetDateTime::UNIX_EPOCH);
        r.moisture = Some(seq);
        LiveEvent::Reading(r)
    }

    fn moisture_of(event: &LiveEvent) -> f64 {
        match event {
            LiveEvent::Reading(r) => r.moisture.unwrap(),
            _ => panic!("expected reading event"),
        }
    }

    #[tokio::test]
    async fn events_reach_all_observers_in_order() {
        let b = Broadcaster::new(16);
        let mut a = b.subscribe();
        let mut c = b.subscribe();

        for i in 0..5 {
            b.publish(reading_event(i as f64));
        }
        for i in 0..5 {
            assert_eq!(moisture_of(&a.recv().await.unwrap()), i as f64);
            assert_eq!(moisture_of(&c.recv().await.unwrap()), i as f64);
        }
    }

    #[tokio::test]
    async fn publish_without_observers_does_not_error() {
        let b = Broadcaster::new(4);
        b.publish(reading_event(1.0));
        assert_eq!(b.observer_count(), 0);
    }

    #[tokio::test]
    async fn slow_observer_never_blocks_fast_observer() {
        let b = Broadcaster::new(16);
        let mut fast = b.subscribe();
        let mut slow = b.subscribe();

        // Burst of 1,000 events; the fast observer keeps up, the slow one
        // reads nothing during the burst.
        for i in 0..1000 {
            b.publish(reading_event(i as f64));
            assert_eq!(moisture_of(&fast.recv().await.unwrap()), i as f64);
        }

        // The slow observer lost its oldest events, not the newest.
        match slow.recv().await {
            Err(RecvError::Lagged(skipped)) => assert!(skipped >= 900),
            other => panic!("expected lag, got {other:?}"),
        }
        let mut last = None;
        while let Ok(ev) = slow.try_recv() {
            last = Some(moisture_of(&ev));
        }
        assert_eq!(last, Some(999.0));
    }

    #[tokio::test]
    async fn lagged_observer_resumes_near_current_state() {
        let b = Broadcaster::new(4);
        let mut slow = b.subscribe();

        for i in 0..10 {
            b.publish(reading_event(i as f64));
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(_))));
        // The retained window is the most recent 4 events: 6, 7, 8, 9.
        assert_eq!(moisture_of(&slow.recv().await.unwrap()), 6.0);
    }

    #[test]
    fn live_event_wire_shape_is_tagged() {
        let json = serde_json::to_value(reading_event(42.0)).unwrap();
        assert_eq!(json["type"], "reading");
        assert_eq!(json["payload"]["moisture"], 42.0);
    }
}
