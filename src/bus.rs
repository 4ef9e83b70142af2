//! Publish/subscribe transport between agents.
//!
//! The coordination logic only needs "deliver this payload to every
//! subscriber of a topic"; [`MessageBus`] is that seam. [`LocalBus`] delivers
//! in-process and synchronously on the publishing thread, which is enough for
//! the simulator and the integration tests.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Bid broadcasts.
    Auction,
    /// Map snapshots.
    Map,
    /// Point-to-point text messages.
    Agents,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Auction => "auction",
            Topic::Map => "map",
            Topic::Agents => "agents",
        };
        f.write_str(name)
    }
}

/// Callback invoked with each raw payload published on a topic.
pub type Handler = Box<dyn Fn(&[u8]) + Send + Sync>;

pub trait MessageBus: Send + Sync {
    /// Deliver `payload` to every subscriber of `topic`, the publisher included.
    fn publish(&self, topic: Topic, payload: Vec<u8>);

    fn subscribe(&self, topic: Topic, handler: Handler);
}

/// In-process bus with synchronous fan-out.
#[derive(Default)]
pub struct LocalBus {
    handlers: Mutex<HashMap<Topic, Vec<Arc<Handler>>>>,
    published: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: Topic, payload: Vec<u8>) {
        // Handlers run outside the lock so they may publish themselves.
        let targets: Vec<Arc<Handler>> = {
            let guard = self.handlers.lock().expect("bus mutex poisoned");
            guard.get(&topic).cloned().unwrap_or_default()
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(%topic, bytes = payload.len(), subscribers = targets.len(), "publish");
        for handler in targets {
            handler(&payload);
        }
    }

    fn subscribe(&self, topic: Topic, handler: Handler) {
        let mut guard = self.handlers.lock().expect("bus mutex poisoned");
        guard.entry(topic).or_default().push(Arc::new(handler));
    }
}

/// Wraps another bus and silently drops publications on chosen topics.
///
/// Used to inject message loss into simulations and tests.
pub struct DroppingBus {
    inner: Arc<dyn MessageBus>,
    dropped_topics: BTreeSet<Topic>,
    dropped: AtomicU64,
}

impl DroppingBus {
    pub fn new(inner: Arc<dyn MessageBus>, dropped_topics: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            inner,
            dropped_topics: dropped_topics.into_iter().collect(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MessageBus for DroppingBus {
    fn publish(&self, topic: Topic, payload: Vec<u8>) {
        if self.dropped_topics.contains(&topic) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%topic, "publication dropped");
            return;
        }
        self.inner.publish(topic, payload);
    }

    fn subscribe(&self, topic: Topic, handler: Handler) {
        self.inner.subscribe(topic, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        Box::new(move |_payload: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn publish_reaches_every_subscriber_of_topic() {
        let bus = LocalBus::new();
        let auction = Arc::new(AtomicUsize::new(0));
        let map = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Topic::Auction, counting_handler(&auction));
        bus.subscribe(Topic::Auction, counting_handler(&auction));
        bus.subscribe(Topic::Map, counting_handler(&map));

        bus.publish(Topic::Auction, b"{}".to_vec());
        assert_eq!(auction.load(Ordering::SeqCst), 2);
        assert_eq!(map.load(Ordering::SeqCst), 0);
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn handler_may_publish_reentrantly() {
        let bus = Arc::new(LocalBus::new());
        let echoed = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Topic::Agents, counting_handler(&echoed));
        let inner = Arc::clone(&bus);
        bus.subscribe(
            Topic::Map,
            Box::new(move |payload: &[u8]| inner.publish(Topic::Agents, payload.to_vec())),
        );
        bus.publish(Topic::Map, b"x".to_vec());
        assert_eq!(echoed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_bus_filters_selected_topics() {
        let local = Arc::new(LocalBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let bus = DroppingBus::new(local.clone(), [Topic::Auction]);
        bus.subscribe(Topic::Auction, counting_handler(&hits));
        bus.subscribe(Topic::Map, counting_handler(&hits));
        bus.publish(Topic::Auction, Vec::new());
        bus.publish(Topic::Map, Vec::new());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.dropped(), 1);
        assert_eq!(local.published(), 1);
    }
}
