//! Synchronous publish/subscribe primitive for the session graph.
//!
//! Delivery is in subscription order on the caller's execution context; there
//! is no queueing. A failing subscriber never prevents later subscribers from
//! receiving the event: the error is logged and dropped.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::events::Event;

/// A node in the session graph that can be the target of an emit.
pub trait BusNode: Send {
    /// Name used in delivery failure logs.
    fn name(&self) -> &'static str;

    /// Handle one event. Errors are isolated to this node.
    fn receive(&mut self, event: &Event) -> Result<()>;
}

/// Shared handle to a graph node.
pub type NodeHandle = Arc<Mutex<dyn BusNode>>;

/// One outbound edge of a graph node: an ordered list of subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<NodeHandle>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Delivery order follows registration order.
    pub fn subscribe(&mut self, node: NodeHandle) {
        self.subscribers.push(node);
    }

    /// Deliver `event` to every subscriber, in order, synchronously.
    pub fn emit(&self, event: &Event) {
        for node in &self.subscribers {
            let mut node = node.lock();
            if let Err(e) = node.receive(event) {
                tracing::error!(node = node.name(), error = %e, "Subscriber failed to handle event");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drop every subscriber reference. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        self.subscribers.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ApiStyle;
    use serde_json::json;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl BusNode for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        fn receive(&mut self, _event: &Event) -> Result<()> {
            self.seen.lock().push(self.label);
            if self.fail {
                anyhow::bail!("deliberate failure");
            }
            Ok(())
        }
    }

    fn recorder(
        label: &'static str,
        seen: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> NodeHandle {
        Arc::new(Mutex::new(Recorder {
            label,
            seen: Arc::clone(seen),
            fail,
        }))
    }

    #[test]
    fn emit_delivers_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.subscribe(recorder("first", &seen, false));
        bus.subscribe(recorder("second", &seen, false));
        bus.subscribe(recorder("third", &seen, false));

        bus.emit(&Event::new(ApiStyle::OpenAi, json!({})));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_subscriber_does_not_block_later_ones() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.subscribe(recorder("first", &seen, true));
        bus.subscribe(recorder("second", &seen, false));

        bus.emit(&Event::new(ApiStyle::OpenAi, json!({})));
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn cleanup_drops_subscribers_and_is_idempotent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.subscribe(recorder("only", &seen, false));
        assert_eq!(bus.subscriber_count(), 1);

        bus.cleanup();
        bus.cleanup();
        assert_eq!(bus.subscriber_count(), 0);

        bus.emit(&Event::new(ApiStyle::Gemini, json!({})));
        assert!(seen.lock().is_empty());
    }
}
