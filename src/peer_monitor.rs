//! Liveness tracking for peer agents.
//!
//! Every inbound message counts as a sign of life. Peers that stay quiet past
//! the timeout are reported so stalled auctions can be attributed to them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::AgentId;

struct PeerState {
    last_seen: HashMap<AgentId, Instant>,
    silent: BTreeSet<AgentId>,
}

pub struct PeerMonitor {
    state: Mutex<PeerState>,
}

impl PeerMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PeerState {
                last_seen: HashMap::new(),
                silent: BTreeSet::new(),
            }),
        }
    }

    /// Record traffic from `peer`, registering it on first contact.
    pub fn heard_from(&self, peer: &str) {
        let mut guard = self.state.lock().expect("peer monitor mutex poisoned");
        guard.last_seen.insert(peer.to_string(), Instant::now());
        guard.silent.remove(peer);
    }

    /// Mark peers quiet for longer than `timeout` and return every silent peer.
    pub fn detect_silent(&self, timeout: Duration) -> BTreeSet<AgentId> {
        let mut guard = self.state.lock().expect("peer monitor mutex poisoned");
        let now = Instant::now();
        let overdue: Vec<AgentId> = guard
            .last_seen
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        guard.silent.extend(overdue);
        guard.silent.clone()
    }

    /// Every peer seen so far, sorted.
    pub fn peers(&self) -> Vec<AgentId> {
        let guard = self.state.lock().expect("peer monitor mutex poisoned");
        let mut peers: Vec<AgentId> = guard.last_seen.keys().cloned().collect();
        peers.sort();
        peers
    }

    #[cfg(test)]
    fn set_last_seen_for_test(&self, peer: &str, instant: Instant) {
        let mut guard = self.state.lock().expect("peer monitor mutex poisoned");
        guard.last_seen.insert(peer.to_string(), instant);
    }
}

impl Default for PeerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
