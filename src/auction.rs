//! Per-subtask sealed-bid auctions resolved independently by every agent.
//!
//! Each agent records the bids it observes and resolves a session once bids
//! from `quorum` distinct agents have arrived. Resolution orders bids by
//! `(value, agent_id)` and inspects the smallest key only: an Invalid bid
//! there makes the subtask Unallocatable, otherwise its agent wins. Because
//! every agent sees the same final bid set, all of them reach the same
//! outcome without another round of messages.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::tasks;
use crate::types::{AgentId, SubtaskId};

/// An agent's cost for a subtask.
///
/// `Invalid` orders below every `Valid` cost, so it sorts first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BidValue {
    /// No feasible plan for this subtask right now.
    Invalid,
    Valid(u32),
}

impl BidValue {
    pub fn cost(self) -> Option<u32> {
        match self {
            BidValue::Valid(cost) => Some(cost),
            BidValue::Invalid => None,
        }
    }
}

impl From<Option<u32>> for BidValue {
    fn from(value: Option<u32>) -> Self {
        value.map_or(BidValue::Invalid, BidValue::Valid)
    }
}

impl fmt::Display for BidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BidValue::Invalid => f.write_str("invalid"),
            BidValue::Valid(cost) => write!(f, "{cost}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuctionOutcome {
    Pending,
    Winner(AgentId),
    Unallocatable,
}

impl AuctionOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, AuctionOutcome::Pending)
    }
}

/// Bids collected for one subtask.
#[derive(Clone, Debug)]
struct AuctionSession {
    bids: HashMap<AgentId, BidValue>,
    outcome: AuctionOutcome,
    opened_at: Instant,
}

impl AuctionSession {
    fn new(opened_at: Instant) -> Self {
        Self {
            bids: HashMap::new(),
            outcome: AuctionOutcome::Pending,
            opened_at,
        }
    }

    /// Smallest `(value, agent_id)` key decides; Invalid short-circuits.
    fn rank(&self) -> AuctionOutcome {
        match self
            .bids
            .iter()
            .min_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)))
        {
            None | Some((_, BidValue::Invalid)) => AuctionOutcome::Unallocatable,
            Some((agent, BidValue::Valid(_))) => AuctionOutcome::Winner(agent.clone()),
        }
    }
}

/// Store of all auction sessions known to one agent.
#[derive(Debug)]
pub struct AuctionCoordinator {
    quorum: usize,
    sessions: HashMap<SubtaskId, AuctionSession>,
    /// Evicted sessions; their outcome stays queryable and late bids are ignored.
    retired: HashMap<SubtaskId, AuctionOutcome>,
}

impl AuctionCoordinator {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            sessions: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Number of bids a session needs before it resolves.
    pub fn quorum_size(&self, _subtask_id: &str) -> usize {
        self.quorum
    }

    fn open_at(&mut self, subtask_id: &str, now: Instant) -> Option<&mut AuctionSession> {
        if self.retired.contains_key(subtask_id) {
            return None;
        }
        Some(
            self.sessions
                .entry(subtask_id.to_string())
                .or_insert_with(|| AuctionSession::new(now)),
        )
    }

    /// Record a bid. Returns whether it was recorded: the first bid of an
    /// agent for a Pending session wins, everything else is ignored.
    pub fn submit_bid(&mut self, subtask_id: &str, agent_id: &str, value: BidValue) -> bool {
        let Some(session) = self.open_at(subtask_id, Instant::now()) else {
            return false;
        };
        if !session.outcome.is_pending() || session.bids.contains_key(agent_id) {
            return false;
        }
        session.bids.insert(agent_id.to_string(), value);
        debug!(subtask = subtask_id, agent = agent_id, %value, "bid recorded");
        true
    }

    /// Resolve the session if its quorum is complete; returns the outcome.
    pub fn try_resolve(&mut self, subtask_id: &str) -> AuctionOutcome {
        let quorum = self.quorum_size(subtask_id);
        let Some(session) = self.sessions.get_mut(subtask_id) else {
            return self.outcome(subtask_id);
        };
        if session.outcome.is_pending() && session.bids.len() >= quorum {
            session.outcome = session.rank();
            info!(
                subtask = subtask_id,
                bids = session.bids.len(),
                outcome = ?session.outcome,
                "auction resolved"
            );
        }
        session.outcome.clone()
    }

    /// Force-resolve sessions that stayed Pending longer than `timeout`,
    /// ranking whatever bids arrived. Returns the ids it resolved.
    pub fn resolve_expired(&mut self, now: Instant, timeout: Duration) -> Vec<SubtaskId> {
        let mut resolved = Vec::new();
        for (id, session) in &mut self.sessions {
            if !session.outcome.is_pending() || now.duration_since(session.opened_at) < timeout {
                continue;
            }
            session.outcome = session.rank();
            info!(
                subtask = %id,
                bids = session.bids.len(),
                quorum = self.quorum,
                outcome = ?session.outcome,
                "auction force-resolved after deadline"
            );
            resolved.push(id.clone());
        }
        resolved.sort();
        resolved
    }

    pub fn outcome(&self, subtask_id: &str) -> AuctionOutcome {
        if let Some(session) = self.sessions.get(subtask_id) {
            return session.outcome.clone();
        }
        self.retired
            .get(subtask_id)
            .cloned()
            .unwrap_or(AuctionOutcome::Pending)
    }

    /// Whether a session or a tombstone exists for `subtask_id`.
    pub fn knows(&self, subtask_id: &str) -> bool {
        self.sessions.contains_key(subtask_id) || self.retired.contains_key(subtask_id)
    }

    pub fn has_bid(&self, subtask_id: &str, agent_id: &str) -> bool {
        self.sessions
            .get(subtask_id)
            .is_some_and(|session| session.bids.contains_key(agent_id))
    }

    /// Ids of sessions still waiting for bids.
    pub fn pending(&self) -> Vec<SubtaskId> {
        let mut ids: Vec<SubtaskId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.outcome.is_pending())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop a session, keeping its outcome as a tombstone.
    pub fn evict(&mut self, subtask_id: &str) -> Option<AuctionOutcome> {
        let session = self.sessions.remove(subtask_id)?;
        self.retired
            .insert(subtask_id.to_string(), session.outcome.clone());
        Some(session.outcome)
    }

    /// Ids of resolved sessions that were not evicted yet.
    pub fn resolved(&self) -> Vec<SubtaskId> {
        let mut ids: Vec<SubtaskId> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.outcome.is_pending())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop every session and tombstone of `subtask`, in any round.
    pub fn forget(&mut self, subtask: &str) {
        self.retain_keys(|id, _| id != subtask);
    }

    /// Drop sessions and tombstones of `subtask` from rounds before `round`.
    pub fn forget_rounds_before(&mut self, subtask: &str, round: u32) {
        self.retain_keys(|id, r| id != subtask || r >= round);
    }

    /// Drop sessions older than `max_age` whose subtask fails `is_live`.
    /// Returns how many were dropped.
    pub fn forget_orphans(
        &mut self,
        now: Instant,
        max_age: Duration,
        is_live: impl Fn(&str) -> bool,
    ) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            let live = tasks::parse_auction_key(key).is_some_and(|(id, _)| is_live(id));
            live || now.duration_since(session.opened_at) < max_age
        });
        before - self.sessions.len()
    }

    fn retain_keys(&mut self, keep_round: impl Fn(&str, u32) -> bool) {
        let keep = |key: &SubtaskId| match tasks::parse_auction_key(key) {
            Some((id, round)) => keep_round(id, round),
            None => true,
        };
        self.sessions.retain(|key, _| keep(key));
        self.retired.retain(|key, _| keep(key));
    }

    #[cfg(test)]
    pub(crate) fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn tombstones(&self) -> usize {
        self.retired.len()
    }

    #[cfg(test)]
    fn age_for_test(&mut self, subtask_id: &str, opened_at: Instant) {
        if let Some(session) = self.sessions.get_mut(subtask_id) {
            session.opened_at = opened_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(quorum: usize, bids: &[(&str, BidValue)]) -> AuctionOutcome {
        let mut coordinator = AuctionCoordinator::new(quorum);
        for (agent, value) in bids {
            coordinator.submit_bid("t1_0", agent, *value);
        }
        coordinator.try_resolve("t1_0")
    }

    #[test]
    fn lowest_cost_wins_with_agent_id_tie_break() {
        let outcome = resolve(
            3,
            &[
                ("A", BidValue::Valid(12)),
                ("C", BidValue::Valid(7)),
                ("B", BidValue::Valid(7)),
            ],
        );
        assert_eq!(outcome, AuctionOutcome::Winner("B".to_string()));
    }

    #[test]
    fn invalid_bid_short_circuits_to_unallocatable() {
        let first = resolve(2, &[("A", BidValue::Invalid), ("B", BidValue::Valid(5))]);
        assert_eq!(first, AuctionOutcome::Unallocatable);
        let second = resolve(2, &[("A", BidValue::Valid(7)), ("B", BidValue::Invalid)]);
        assert_eq!(second, AuctionOutcome::Unallocatable);
    }

    #[test]
    fn resolution_is_independent_of_arrival_order() {
        let bids = [
            ("agentA3", BidValue::Valid(9)),
            ("agentA1", BidValue::Valid(4)),
            ("agentA2", BidValue::Valid(4)),
        ];
        let mut reversed = bids;
        reversed.reverse();
        assert_eq!(resolve(3, &bids), resolve(3, &reversed));
        assert_eq!(resolve(3, &bids), AuctionOutcome::Winner("agentA1".to_string()));
    }

    #[test]
    fn duplicate_bid_is_idempotent() {
        let mut coordinator = AuctionCoordinator::new(2);
        assert!(coordinator.submit_bid("t1_0", "A", BidValue::Valid(3)));
        assert!(!coordinator.submit_bid("t1_0", "A", BidValue::Valid(3)));
        // A later, different value from the same agent is ignored as well.
        assert!(!coordinator.submit_bid("t1_0", "A", BidValue::Valid(1)));
        assert_eq!(coordinator.try_resolve("t1_0"), AuctionOutcome::Pending);
        assert_eq!(coordinator.pending(), vec!["t1_0".to_string()]);

        coordinator.submit_bid("t1_0", "B", BidValue::Valid(2));
        assert_eq!(
            coordinator.try_resolve("t1_0"),
            AuctionOutcome::Winner("B".to_string())
        );
        assert!(coordinator.pending().is_empty());
    }

    #[test]
    fn resolved_session_is_terminal() {
        let mut coordinator = AuctionCoordinator::new(1);
        coordinator.submit_bid("t1_0", "B", BidValue::Valid(5));
        assert_eq!(
            coordinator.try_resolve("t1_0"),
            AuctionOutcome::Winner("B".to_string())
        );
        assert!(!coordinator.submit_bid("t1_0", "A", BidValue::Valid(1)));
        assert_eq!(
            coordinator.try_resolve("t1_0"),
            AuctionOutcome::Winner("B".to_string())
        );
    }

    #[test]
    fn missing_quorum_stays_pending_until_deadline() {
        let mut coordinator = AuctionCoordinator::new(3);
        coordinator.submit_bid("t1_0", "A", BidValue::Valid(5));
        coordinator.submit_bid("t1_0", "B", BidValue::Valid(2));
        assert_eq!(coordinator.try_resolve("t1_0"), AuctionOutcome::Pending);

        let now = Instant::now();
        assert!(coordinator
            .resolve_expired(now, Duration::from_secs(60))
            .is_empty());

        coordinator.age_for_test("t1_0", now - Duration::from_secs(5));
        let resolved = coordinator.resolve_expired(now, Duration::from_secs(1));
        assert_eq!(resolved, vec!["t1_0".to_string()]);
        assert_eq!(
            coordinator.outcome("t1_0"),
            AuctionOutcome::Winner("B".to_string())
        );
    }

    #[test]
    fn empty_expired_session_is_unallocatable() {
        let mut coordinator = AuctionCoordinator::new(2);
        coordinator.open_at("t2_1", Instant::now());
        let now = Instant::now();
        coordinator.age_for_test("t2_1", now - Duration::from_secs(5));
        coordinator.resolve_expired(now, Duration::from_secs(1));
        assert_eq!(coordinator.outcome("t2_1"), AuctionOutcome::Unallocatable);
    }

    #[test]
    fn evicted_session_keeps_outcome_and_ignores_late_bids() {
        let mut coordinator = AuctionCoordinator::new(1);
        coordinator.submit_bid("t1_0", "A", BidValue::Valid(5));
        coordinator.try_resolve("t1_0");
        assert_eq!(
            coordinator.evict("t1_0"),
            Some(AuctionOutcome::Winner("A".to_string()))
        );
        assert_eq!(coordinator.active_sessions(), 0);
        assert!(!coordinator.submit_bid("t1_0", "B", BidValue::Valid(1)));
        assert_eq!(coordinator.active_sessions(), 0);
        assert_eq!(
            coordinator.outcome("t1_0"),
            AuctionOutcome::Winner("A".to_string())
        );
    }

    #[test]
    fn pruning_old_rounds_keeps_the_latest_tombstone() {
        let mut coordinator = AuctionCoordinator::new(1);
        for round in 0..5 {
            let key = tasks::auction_key("t1_0", round);
            coordinator.submit_bid(&key, "A", BidValue::Invalid);
            coordinator.try_resolve(&key);
            coordinator.evict(&key);
            coordinator.forget_rounds_before("t1_0", round);
        }
        assert_eq!(coordinator.tombstones(), 1);
        assert_eq!(coordinator.outcome("t1_0@4"), AuctionOutcome::Unallocatable);
        assert!(!coordinator.knows("t1_0@3"));

        coordinator.submit_bid("t2_0@0", "A", BidValue::Valid(1));
        coordinator.forget("t1_0");
        assert_eq!(coordinator.tombstones(), 0);
        assert!(coordinator.knows("t2_0@0"));
    }

    #[test]
    fn orphan_sessions_expire_unless_their_subtask_is_live() {
        let mut coordinator = AuctionCoordinator::new(2);
        coordinator.submit_bid("t1_0@0", "A", BidValue::Valid(1));
        coordinator.submit_bid("t9_0@0", "A", BidValue::Valid(1));
        let now = Instant::now();
        assert_eq!(
            coordinator.forget_orphans(now, Duration::from_secs(1), |id| id == "t1_0"),
            0
        );
        coordinator.age_for_test("t1_0@0", now - Duration::from_secs(5));
        coordinator.age_for_test("t9_0@0", now - Duration::from_secs(5));
        assert_eq!(
            coordinator.forget_orphans(now, Duration::from_secs(1), |id| id == "t1_0"),
            1
        );
        assert!(coordinator.knows("t1_0@0"));
        assert!(!coordinator.knows("t9_0@0"));
    }

    #[test]
    fn invalid_orders_below_every_cost() {
        assert!(BidValue::Invalid < BidValue::Valid(0));
        assert_eq!(BidValue::from(None), BidValue::Invalid);
        assert_eq!(BidValue::from(Some(4)), BidValue::Valid(4));
    }
}
