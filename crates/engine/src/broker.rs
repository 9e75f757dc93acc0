//! In-process publish/subscribe bus: the transport adapter between device
//! traffic and the engine pipeline.
//!
//! Topics are `/`-separated; subscription patterns may use `+` as a
//! single-level wildcard (`device/+/telemetry`).  Delivery is at-most-once:
//! a subscriber whose queue is full loses the message, and that never
//! blocks the publisher.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

/// One message in flight on the bus.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<Message>,
}

#[derive(Clone)]
pub struct Broker {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    queue_capacity: usize,
}

impl Broker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a subscription.  The returned receiver yields every message
    /// whose topic matches `pattern`, in publish order.
    pub fn subscribe(&self, pattern: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut subs = self.subscribers.lock().expect("broker lock poisoned");
        subs.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        rx
    }

    /// Publish a message to every matching subscriber.  Returns how many
    /// subscribers received it.  Never blocks: full queues drop the message
    /// for that subscriber only.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let mut subs = self.subscribers.lock().expect("broker lock poisoned");
        // Dropped receivers are pruned lazily on publish.
        subs.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for sub in subs.iter() {
            if !topic_matches(&sub.pattern, topic) {
                continue;
            }
            let msg = Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            match sub.tx.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic, pattern = %sub.pattern, "subscriber queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

/// Match a topic against a pattern with single-level `+` wildcards.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let top: Vec<&str> = topic.split('/').collect();
    if pat.len() != top.len() {
        return false;
    }
    pat.iter()
        .zip(top.iter())
        .all(|(p, t)| *p == "+" || p == t)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- topic_matches ----------------------------------------------------

    #[test]
    fn exact_topic_matches() {
        assert!(topic_matches("device/d1/telemetry", "device/d1/telemetry"));
    }

    #[test]
    fn plus_matches_any_single_level() {
        assert!(topic_matches("device/+/telemetry", "device/d1/telemetry"));
        assert!(topic_matches("device/+/telemetry", "device/greenhouse-7/telemetry"));
    }

    #[test]
    fn plus_does_not_match_across_levels() {
        assert!(!topic_matches("device/+/telemetry", "device/d1/extra/telemetry"));
    }

    #[test]
    fn different_suffix_does_not_match() {
        assert!(!topic_matches("device/+/telemetry", "device/d1/command"));
    }

    #[test]
    fn segment_count_must_match() {
        assert!(!topic_matches("device/+", "device/d1/telemetry"));
        assert!(!topic_matches("device/+/telemetry", "device/d1"));
    }

    // -- publish/subscribe ------------------------------------------------

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let broker = Broker::new(8);
        let mut rx = broker.subscribe("device/+/telemetry");

        let n = broker.publish("device/d1/telemetry", b"{}");
        assert_eq!(n, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "device/d1/telemetry");
        assert_eq!(msg.payload, b"{}");
    }

    #[tokio::test]
    async fn publish_skips_non_matching_subscriber() {
        let broker = Broker::new(8);
        let mut rx = broker.subscribe("device/+/command");

        assert_eq!(broker.publish("device/d1/telemetry", b"x"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_fans_out_to_multiple_subscribers() {
        let broker = Broker::new(8);
        let mut a = broker.subscribe("device/+/telemetry");
        let mut b = broker.subscribe("device/d1/+");

        assert_eq!(broker.publish("device/d1/telemetry", b"x"), 2);
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn per_subscriber_order_is_preserved() {
        let broker = Broker::new(8);
        let mut rx = broker.subscribe("device/+/telemetry");

        for i in 0..5u8 {
            broker.publish("device/d1/telemetry", &[i]);
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_message_without_blocking() {
        let broker = Broker::new(2);
        let mut rx = broker.subscribe("t");

        broker.publish("t", b"1");
        broker.publish("t", b"2");
        // Queue full; this one is dropped for the slow subscriber.
        assert_eq!(broker.publish("t", b"3"), 0);

        assert_eq!(rx.recv().await.unwrap().payload, b"1");
        assert_eq!(rx.recv().await.unwrap().payload, b"2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let broker = Broker::new(8);
        let rx = broker.subscribe("t");
        drop(rx);

        assert_eq!(broker.publish("t", b"x"), 0);
    }
}
