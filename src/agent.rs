//! One agent's decision cycle.
//!
//! Transport callbacks only decode and enqueue. Everything that touches
//! auction sessions, the map buffer or the task board runs inside
//! [`AgentCore::run_cycle`] on the agent's own thread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, info_span, warn};

use crate::auction::{AuctionCoordinator, AuctionOutcome};
use crate::bus::{Handler, MessageBus, Topic};
use crate::config::NodeConfig;
use crate::cost;
use crate::error::Result;
use crate::grid::GridKnowledge;
use crate::mailbox::Mailbox;
use crate::messages::{self, BidMessage, Inbound, MapMessage, PeerTextMessage, RemoteMap};
use crate::peer_monitor::PeerMonitor;
use crate::perception::Perception;
use crate::tasks::{self, SubTask, SubtaskStatus, TaskBoard};
use crate::types::{AgentId, Direction, SubtaskId};

/// Message type announcing that the sender finished a subtask (params = id).
pub const DONE_MESSAGE_TYPE: &str = "done";

/// What happened during one cycle, for the caller's bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub step: u64,
    pub bids_sent: usize,
    /// Auction keys resolved this cycle with their outcome.
    pub resolved: Vec<(SubtaskId, AuctionOutcome)>,
    /// How many of `resolved` were forced by the auction deadline.
    pub forced: usize,
    pub maps_merged: usize,
    pub maps_buffered: usize,
    pub messages_handled: usize,
    /// Auctions still waiting for bids when the cycle ended.
    pub pending_auctions: usize,
    pub silent_peers: BTreeSet<AgentId>,
}

pub struct AgentCore {
    name: AgentId,
    config: NodeConfig,
    grid: GridKnowledge,
    auctions: AuctionCoordinator,
    tasks: TaskBoard,
    inbox: Arc<Mailbox<Inbound>>,
    bus: Arc<dyn MessageBus>,
    /// Latest validated map from each peer, waiting for a local landmark.
    map_buffer: BTreeMap<AgentId, RemoteMap>,
    peers: PeerMonitor,
    /// Subtasks this agent won and has not finished, in award order.
    assigned: Vec<SubtaskId>,
}

impl AgentCore {
    /// Create the agent and subscribe its mailbox to every topic on `bus`.
    pub fn new(name: impl Into<AgentId>, config: NodeConfig, bus: Arc<dyn MessageBus>) -> Self {
        let name = name.into();
        let inbox = Arc::new(Mailbox::new());
        bus.subscribe(Topic::Auction, enqueue(&name, &inbox, messages::decode_bid));
        bus.subscribe(Topic::Map, enqueue(&name, &inbox, messages::decode_map));
        bus.subscribe(Topic::Agents, enqueue(&name, &inbox, messages::decode_text));

        Self {
            grid: GridKnowledge::new(name.clone(), config.vision),
            auctions: AuctionCoordinator::new(config.quorum_size),
            tasks: TaskBoard::new(),
            inbox,
            bus,
            map_buffer: BTreeMap::new(),
            peers: PeerMonitor::new(),
            assigned: Vec::new(),
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid(&self) -> &GridKnowledge {
        &self.grid
    }

    pub fn tasks(&self) -> &TaskBoard {
        &self.tasks
    }

    pub fn auctions(&self) -> &AuctionCoordinator {
        &self.auctions
    }

    /// Run one cycle with the deadline derived from the perception's budget.
    pub fn run_cycle(&mut self, perception: &Perception) -> CycleReport {
        let budget = perception
            .time_budget()
            .saturating_sub(self.config.safety_margin());
        self.run_cycle_until(perception, Instant::now() + budget)
    }

    /// Run one cycle, waiting for auction traffic no later than `deadline`.
    pub fn run_cycle_until(&mut self, perception: &Perception, deadline: Instant) -> CycleReport {
        let span = info_span!("cycle", agent = %self.name, step = perception.step);
        let _entered = span.enter();
        let mut report = CycleReport {
            step: perception.step,
            ..CycleReport::default()
        };
        let mut touched = BTreeSet::new();

        self.grid.update_map(perception);
        for removed in self.tasks.update(&perception.tasks, perception.step) {
            self.auctions.forget(&removed.id);
            self.assigned.retain(|id| id != &removed.id);
        }
        let board = &self.tasks;
        let dropped = self.auctions.forget_orphans(
            Instant::now(),
            self.config.auction_timeout() * 2,
            |subtask| board.subtask(subtask).is_some(),
        );
        if dropped > 0 {
            debug!(dropped, "dropped auctions of unknown subtasks");
        }
        // Outcomes that arrived before their task was perceived.
        touched.extend(self.auctions.resolved());

        for message in self.inbox.drain() {
            self.handle(message, &mut report, &mut touched);
        }

        self.merge_buffered_maps(&mut report);
        self.broadcast_map();

        let awaiting = self.place_bids(&mut report, &mut touched);
        while awaiting
            .iter()
            .any(|key| self.auctions.outcome(key).is_pending())
        {
            match self.inbox.pop_until(deadline) {
                Some(message) => self.handle(message, &mut report, &mut touched),
                None => break,
            }
        }

        let forced = self
            .auctions
            .resolve_expired(Instant::now(), self.config.auction_timeout());
        if !forced.is_empty() {
            report.forced = forced.len();
            report.silent_peers = self.peers.detect_silent(self.config.peer_timeout());
            warn!(
                auctions = ?forced,
                silent_peers = ?report.silent_peers,
                "auctions resolved by deadline without full quorum"
            );
            touched.extend(forced);
        }

        for key in touched {
            self.apply_outcome(&key, &mut report);
        }
        report.maps_buffered = self.map_buffer.len();
        report.pending_auctions = self.auctions.pending().len();
        debug!(
            tasks = self.tasks.len(),
            pending = report.pending_auctions,
            resolved = report.resolved.len(),
            "cycle finished"
        );
        report
    }

    fn handle(&mut self, message: Inbound, report: &mut CycleReport, touched: &mut BTreeSet<String>) {
        report.messages_handled += 1;
        let sender = message.sender().to_string();
        if sender != self.name {
            self.peers.heard_from(&sender);
        }
        match message {
            Inbound::Bid(bid) => {
                if self.is_past_round(&bid.subtask_id) {
                    debug!(auction = %bid.subtask_id, from = %bid.agent_id, "bid for a past round");
                } else if self
                    .auctions
                    .submit_bid(&bid.subtask_id, &bid.agent_id, bid.bid_value())
                {
                    self.auctions.try_resolve(&bid.subtask_id);
                    touched.insert(bid.subtask_id);
                }
            }
            Inbound::Map(map) => {
                if map.agent_id != self.name {
                    self.map_buffer.insert(map.agent_id.clone(), map);
                }
            }
            Inbound::Text(text) => self.handle_text(text),
        }
    }

    /// Whether `key` names a round older than the subtask's current one.
    fn is_past_round(&self, key: &str) -> bool {
        tasks::parse_auction_key(key)
            .and_then(|(subtask, round)| self.tasks.subtask(subtask).map(|sub| round < sub.round))
            .unwrap_or(false)
    }

    fn handle_text(&mut self, text: PeerTextMessage) {
        if text.to != self.name {
            return;
        }
        if text.is_ack() {
            debug!(from = %text.from, acked = %text.params, "acknowledged");
            return;
        }
        info!(
            from = %text.from,
            id = %text.message_id,
            kind = %text.message_type,
            params = %text.params,
            "peer message"
        );
        if text.message_type == DONE_MESSAGE_TYPE {
            self.tasks.complete(&text.params);
        }
        self.publish(Topic::Agents, &text.ack());
    }

    /// Merge buffered peer maps once the local landmark exists.
    fn merge_buffered_maps(&mut self, report: &mut CycleReport) {
        if !self.grid.goal_area_fully_discovered() || self.map_buffer.is_empty() {
            return;
        }
        for (peer, map) in std::mem::take(&mut self.map_buffer) {
            match self.grid.absorb(&map.matrix, map.landmark, &map.dispensers) {
                Ok(()) => {
                    report.maps_merged += 1;
                    debug!(%peer, "merged peer map");
                }
                Err(err) => warn!(%peer, error = %err, "peer map not merged"),
            }
        }
    }

    fn broadcast_map(&self) {
        if !self.grid.goal_area_fully_discovered() {
            return;
        }
        match MapMessage::from_grid(&self.grid) {
            Ok(map) => self.publish(Topic::Map, &map),
            Err(err) => warn!(error = %err, "map snapshot failed"),
        }
    }

    /// Bid once on every open auction of an unassigned subtask. Returns the
    /// auction keys bid on this cycle.
    fn place_bids(&mut self, report: &mut CycleReport, touched: &mut BTreeSet<String>) -> Vec<String> {
        let position = self.grid.position();
        let open: Vec<(String, String)> = self
            .tasks
            .unassigned()
            .map(|sub| (sub.auction_key(), sub.kind.clone()))
            .filter(|(key, _)| {
                !self.auctions.has_bid(key, &self.name) && self.auctions.outcome(key).is_pending()
            })
            .collect();

        let mut awaiting = Vec::with_capacity(open.len());
        for (key, kind) in open {
            let value = cost::estimate(&self.grid, &kind, position);
            if !self.auctions.submit_bid(&key, &self.name, value) {
                continue;
            }
            debug!(auction = %key, %kind, %value, "bidding");
            self.publish(Topic::Auction, &BidMessage::new(&key, &self.name, value));
            report.bids_sent += 1;
            self.auctions.try_resolve(&key);
            touched.insert(key.clone());
            awaiting.push(key);
        }
        awaiting
    }

    /// Fold a resolved auction into the task board and retire its session.
    ///
    /// Sessions of subtasks not on the board yet stay open so the outcome can
    /// be applied once the task is perceived.
    fn apply_outcome(&mut self, key: &str, report: &mut CycleReport) {
        let outcome = self.auctions.outcome(key);
        if outcome.is_pending() {
            return;
        }
        let Some((subtask, round)) = tasks::parse_auction_key(key) else {
            warn!(auction = key, "resolved auction with unparseable key");
            self.auctions.evict(key);
            return;
        };
        let Some(current) = self.tasks.subtask(subtask).map(|sub| sub.round) else {
            debug!(auction = key, "outcome parked until the task is perceived");
            return;
        };
        report.resolved.push((key.to_string(), outcome.clone()));
        self.auctions.evict(key);
        if current != round {
            debug!(auction = key, "outcome for a past round");
            return;
        }
        match outcome {
            AuctionOutcome::Winner(winner) => {
                if self.tasks.assign(subtask, &winner) && winner == self.name {
                    info!(%subtask, "won subtask");
                    self.assigned.push(subtask.to_string());
                }
            }
            AuctionOutcome::Unallocatable => {
                if let Some(next) = self.tasks.retry(subtask) {
                    self.auctions.forget_rounds_before(subtask, round);
                    debug!(%subtask, round = next, "no feasible bidder, retrying");
                }
            }
            AuctionOutcome::Pending => {}
        }
    }

    fn publish<T: serde::Serialize>(&self, topic: Topic, message: &T) {
        match messages::encode(message) {
            Ok(payload) => self.bus.publish(topic, payload),
            Err(err) => warn!(%topic, error = %err, "encode failed"),
        }
    }

    /// Outcome of the auction currently running for `subtask_id`, or of its
    /// last round once the subtask left the auction.
    ///
    /// A subtask whose last round ended Unallocatable reports that outcome
    /// until the next round opens.
    pub fn current_auction_outcome(&self, subtask_id: &str) -> AuctionOutcome {
        let Some(sub) = self.tasks.subtask(subtask_id) else {
            return AuctionOutcome::Pending;
        };
        if let Some(winner) = &sub.assignee {
            return AuctionOutcome::Winner(winner.clone());
        }
        let key = sub.auction_key();
        if sub.round > 0 && !self.auctions.knows(&key) {
            return self
                .auctions
                .outcome(&tasks::auction_key(&sub.id, sub.round - 1));
        }
        self.auctions.outcome(&key)
    }

    /// Subtasks this agent won and still has to perform.
    pub fn assigned_subtasks(&self) -> Vec<&SubTask> {
        self.assigned
            .iter()
            .filter_map(|id| self.tasks.subtask(id))
            .filter(|sub| sub.status == SubtaskStatus::Assigned)
            .collect()
    }

    pub fn direction_to_nearest_dispenser(&self, kind: &str) -> Option<Direction> {
        self.grid.direction_to_nearest_dispenser(kind)
    }

    pub fn direction_to_frontier(&self) -> Option<Direction> {
        self.grid.direction_to_frontier()
    }

    /// Mark an own subtask done and tell every known peer.
    pub fn complete_subtask(&mut self, subtask_id: &str) -> bool {
        if !self.tasks.complete(subtask_id) {
            return false;
        }
        self.assigned.retain(|id| id != subtask_id);
        for peer in self.peers.peers() {
            self.send_peer_message(&peer, DONE_MESSAGE_TYPE, subtask_id);
        }
        true
    }

    pub fn send_peer_message(&self, to: &str, message_type: &str, params: &str) {
        self.publish(
            Topic::Agents,
            &PeerTextMessage::new(&self.name, to, message_type, params),
        );
    }

    /// Close the mailbox; later deliveries are dropped.
    pub fn shutdown(&self) {
        self.inbox.close();
    }
}

/// Bus handler that decodes a payload and queues it for the agent thread.
fn enqueue(
    agent: &str,
    inbox: &Arc<Mailbox<Inbound>>,
    decode: fn(&[u8]) -> Result<Inbound>,
) -> Handler {
    let agent = agent.to_string();
    let inbox = Arc::clone(inbox);
    Box::new(move |payload: &[u8]| match decode(payload) {
        Ok(message) => {
            if inbox.push(message).is_err() {
                debug!(%agent, "mailbox closed, message dropped");
            }
        }
        Err(err) => warn!(%agent, error = %err, "dropping malformed message"),
    })
}
