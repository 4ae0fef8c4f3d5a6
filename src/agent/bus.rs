//! In-process agent-event bus
//!
//! Fan-out keyed by run id. Delivery is at-least-once to live subscribers;
//! events for runs nobody watches are dropped. A terminal lifecycle event
//! removes every subscription for its run, so late subscribers see nothing.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use super::AgentEvent;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

/// Run-keyed publish/subscribe registry
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one run's events.
    ///
    /// Returns the subscriber id (needed for an explicit unsubscribe on
    /// client disconnect) and the receiving half.
    pub fn subscribe(&self, run_id: &str) -> (u64, mpsc::UnboundedReceiver<AgentEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(run_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        trace!(run_id, subscriber = id, "bus subscribe");
        (id, rx)
    }

    /// Drop one subscription. Idempotent.
    pub fn unsubscribe(&self, run_id: &str, subscriber_id: u64) {
        let mut remove_entry = false;
        if let Some(mut entry) = self.subscribers.get_mut(run_id) {
            entry.retain(|s| s.id != subscriber_id);
            remove_entry = entry.is_empty();
        }
        if remove_entry {
            self.subscribers.remove_if(run_id, |_, subs| subs.is_empty());
        }
    }

    /// Deliver an event to every subscriber of its run.
    ///
    /// Terminal events unsubscribe everyone after delivery. Returns how many
    /// subscribers received the event.
    pub fn publish(&self, event: &AgentEvent) -> usize {
        if event.is_terminal() {
            let Some((_, subs)) = self.subscribers.remove(&event.run_id) else {
                return 0;
            };
            let mut delivered = 0;
            for sub in subs {
                if sub.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
            return delivered;
        }

        let mut delivered = 0;
        let mut drop_entry = false;
        if let Some(mut entry) = self.subscribers.get_mut(&event.run_id) {
            // Dead receivers are pruned as a side effect of delivery
            entry.retain(|sub| match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            });
            drop_entry = entry.is_empty();
        }
        if drop_entry {
            self.subscribers.remove_if(&event.run_id, |_, subs| subs.is_empty());
        }
        delivered
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.subscribers.get(run_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RunPhase;

    #[tokio::test]
    async fn test_fan_out_to_matching_run() {
        let bus = EventBus::new();
        let (_, mut rx_a) = bus.subscribe("run-a");
        let (_, mut rx_b) = bus.subscribe("run-b");

        let delivered = bus.publish(&AgentEvent::assistant_delta("run-a", "Hel"));
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await.unwrap().delta.as_deref(), Some("Hel"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_without_subscribers_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(&AgentEvent::assistant_delta("ghost", "x")), 0);
    }

    #[tokio::test]
    async fn test_terminal_event_unsubscribes() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe("run-a");
        assert_eq!(bus.subscriber_count("run-a"), 1);

        bus.publish(&AgentEvent::lifecycle("run-a", RunPhase::End));
        assert_eq!(bus.subscriber_count("run-a"), 0);

        // The terminal event itself is still delivered
        assert!(rx.recv().await.unwrap().is_terminal());
        // Later events for the run are dropped
        assert_eq!(bus.publish(&AgentEvent::assistant_delta("run-a", "late")), 0);
    }

    #[tokio::test]
    async fn test_explicit_unsubscribe() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe("run-a");
        bus.unsubscribe("run-a", id);
        assert_eq!(bus.subscriber_count("run-a"), 0);
        assert_eq!(bus.publish(&AgentEvent::assistant_delta("run-a", "x")), 0);
        assert!(rx.try_recv().is_err());

        // Unsubscribe is idempotent
        bus.unsubscribe("run-a", id);
    }

    #[tokio::test]
    async fn test_dropped_receiver_pruned() {
        let bus = EventBus::new();
        let (_, rx) = bus.subscribe("run-a");
        drop(rx);
        assert_eq!(bus.publish(&AgentEvent::assistant_delta("run-a", "x")), 0);
        assert_eq!(bus.subscriber_count("run-a"), 0);
    }

    #[tokio::test]
    async fn test_per_run_fifo_order() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe("run-a");
        for i in 0..5 {
            bus.publish(&AgentEvent::assistant_delta("run-a", format!("d{}", i)));
        }
        for i in 0..5 {
            assert_eq!(
                rx.recv().await.unwrap().delta.unwrap(),
                format!("d{}", i)
            );
        }
    }
}
