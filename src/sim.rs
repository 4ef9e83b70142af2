//! Simulation, benchmark and stress runners.
//!
//! Every agent runs on its own named thread and steps in lockstep with the
//! world: the driver hands out perceptions, each agent runs one decision cycle
//! and answers with an action, and the world applies all actions before the
//! next step starts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::agent::{AgentCore, CycleReport};
use crate::auction::AuctionOutcome;
use crate::bus::{DroppingBus, LocalBus, MessageBus, Topic};
use crate::config::SimConfig;
use crate::error::Result;
use crate::grid::Cell;
use crate::tasks;
use crate::types::{AgentId, SubtaskId};
use crate::world::{Action, World};

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    // rusage is plain old data; all-zero is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Some((seconds(usage.ru_utime), seconds(usage.ru_stime)))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Cross-agent view of every auction outcome, used to detect disagreement.
#[derive(Default)]
struct AllocationLedger {
    outcomes: BTreeMap<String, AuctionOutcome>,
    winners: BTreeMap<SubtaskId, AgentId>,
    conflict: bool,
}

impl AllocationLedger {
    fn record(&mut self, agent: &str, key: &str, outcome: &AuctionOutcome) {
        match self.outcomes.get(key) {
            Some(seen) if seen != outcome => {
                warn!(%agent, auction = key, ?seen, ?outcome, "agents disagree on auction outcome");
                self.conflict = true;
            }
            Some(_) => {}
            None => {
                self.outcomes.insert(key.to_string(), outcome.clone());
            }
        }
        let AuctionOutcome::Winner(winner) = outcome else {
            return;
        };
        let subtask = tasks::parse_auction_key(key).map_or(key, |(id, _)| id);
        match self.winners.get(subtask) {
            Some(existing) if existing != winner => {
                warn!(%subtask, %existing, %winner, "subtask awarded twice");
                self.conflict = true;
            }
            Some(_) => {}
            None => {
                self.winners.insert(subtask.to_string(), winner.clone());
            }
        }
    }

    fn resolved(&self) -> usize {
        self.outcomes.len()
    }

    fn unallocatable(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| **outcome == AuctionOutcome::Unallocatable)
            .count()
    }

    fn awards(&self) -> BTreeMap<AgentId, Vec<SubtaskId>> {
        let mut awards: BTreeMap<AgentId, Vec<SubtaskId>> = BTreeMap::new();
        for (subtask, winner) in &self.winners {
            awards.entry(winner.clone()).or_default().push(subtask.clone());
        }
        awards
    }
}

/// Aggregated metrics from a single simulation run.
pub struct SimOutcome {
    pub agents: usize,
    pub steps: u64,
    pub seed: u64,
    pub elapsed_ms: f64,
    pub tasks_announced: usize,
    pub subtasks_completed: usize,
    pub auctions_resolved: usize,
    pub winners: usize,
    pub unallocatable: usize,
    pub forced: usize,
    pub maps_merged: usize,
    pub bids_sent: usize,
    pub rejected_actions: usize,
    pub allocation_conflict: bool,
    pub awards: BTreeMap<AgentId, Vec<SubtaskId>>,
    pub cpu_user_s: Option<f64>,
    pub cpu_sys_s: Option<f64>,
}

/// Local consequence of an action, applied once the world accepts it.
#[derive(Debug)]
enum Effect {
    Pickup(SubtaskId),
    Delivery(SubtaskId),
}

/// Behaviour layer on top of the agent core: fetch a block for the first own
/// subtask, carry it to the goal area, explore when idle.
#[derive(Default)]
struct Pilot {
    carrying: Option<SubtaskId>,
    awaiting: Option<Effect>,
}

impl Pilot {
    /// Apply the effect of the previous action if the world accepted it.
    fn settle(&mut self, core: &mut AgentCore, accepted: Option<bool>) {
        let Some(effect) = self.awaiting.take() else {
            return;
        };
        if accepted != Some(true) {
            debug!(?effect, "previous action rejected");
            return;
        }
        match effect {
            Effect::Pickup(subtask) => self.carrying = Some(subtask),
            Effect::Delivery(subtask) => {
                self.carrying = None;
                core.complete_subtask(&subtask);
            }
        }
    }

    fn decide(&mut self, core: &mut AgentCore, accepted: Option<bool>) -> Action {
        self.settle(core, accepted);
        let job = core
            .assigned_subtasks()
            .first()
            .map(|sub| (sub.id.clone(), sub.kind.clone()));
        let Some((subtask, kind)) = job else {
            return explore(core);
        };

        if self.carrying.as_deref() == Some(subtask.as_str()) {
            let grid = core.grid();
            if grid.cell_at(grid.position()) == Cell::Goal {
                self.awaiting = Some(Effect::Delivery(subtask.clone()));
                return Action::Deliver(subtask);
            }
            return match grid.direction_to_landmark() {
                Some(direction) => Action::Move(direction),
                None => explore(core),
            };
        }

        if core.grid().dispenser_here() == Some(kind.as_str()) {
            self.awaiting = Some(Effect::Pickup(subtask));
            return Action::Dispense(kind);
        }
        match core.direction_to_nearest_dispenser(&kind) {
            Some(direction) => Action::Move(direction),
            None => explore(core),
        }
    }
}

fn explore(core: &AgentCore) -> Action {
    core.direction_to_frontier()
        .map_or(Action::Skip, Action::Move)
}

struct StepReply {
    index: usize,
    report: CycleReport,
    action: Action,
}

/// Run one full simulation and collect its metrics.
pub fn run_simulation(config: &SimConfig) -> Result<SimOutcome> {
    config.validate()?;
    let node = config.node_config();
    node.validate()?;
    let mut world = World::generate(config, node.vision);
    let names = world.agent_names();
    let local = Arc::new(LocalBus::new());

    // Subscribe every agent before anyone publishes.
    let mut cores = Vec::with_capacity(names.len());
    for name in &names {
        let bus: Arc<dyn MessageBus> = if config.drop_bids_from.contains(name) {
            info!(agent = %name, "dropping this agent's bids");
            Arc::new(DroppingBus::new(local.clone(), [Topic::Auction]))
        } else {
            local.clone()
        };
        cores.push(AgentCore::new(name.clone(), node.clone(), bus));
    }

    let (reply_tx, reply_rx) = mpsc::channel::<StepReply>();
    let mut senders = Vec::with_capacity(cores.len());
    let mut handles = Vec::with_capacity(cores.len());
    for (index, mut core) in cores.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel();
        senders.push(tx);
        let reply_tx = reply_tx.clone();
        let handle = thread::Builder::new()
            .name(core.name().to_string())
            .spawn(move || {
                let mut pilot = Pilot::default();
                while let Ok(perception) = rx.recv() {
                    let report = core.run_cycle(&perception);
                    let action = pilot.decide(&mut core, perception.last_action_accepted);
                    debug!(?action, "decided");
                    if reply_tx.send(StepReply { index, report, action }).is_err() {
                        break;
                    }
                }
                core.shutdown();
            })
            .expect("failed to spawn agent thread");
        handles.push(handle);
    }
    drop(reply_tx);

    let mut ledger = AllocationLedger::default();
    let (mut forced, mut maps_merged, mut bids_sent) = (0, 0, 0);
    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    for _ in 0..config.steps {
        world.begin_step();
        let time_ms = start.elapsed().as_millis() as u64;
        for (index, tx) in senders.iter().enumerate() {
            let perception = world.perceive(index, time_ms, time_ms + config.step_ms);
            tx.send(perception).expect("agent thread stopped early");
        }

        let mut replies: Vec<StepReply> = (0..senders.len())
            .map(|_| reply_rx.recv().expect("agent thread stopped early"))
            .collect();
        replies.sort_by_key(|reply| reply.index);
        for reply in replies {
            let agent = &names[reply.index];
            for (key, outcome) in &reply.report.resolved {
                ledger.record(agent, key, outcome);
            }
            forced += reply.report.forced;
            maps_merged += reply.report.maps_merged;
            bids_sent += reply.report.bids_sent;
            world.apply(reply.index, &reply.action);
        }
    }
    drop(senders);
    for handle in handles {
        handle.join().expect("agent thread panicked");
    }

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    Ok(SimOutcome {
        agents: names.len(),
        steps: world.step(),
        seed: config.seed,
        elapsed_ms,
        tasks_announced: world.tasks_announced(),
        subtasks_completed: world.subtasks_completed(),
        auctions_resolved: ledger.resolved(),
        winners: ledger.winners.len(),
        unallocatable: ledger.unallocatable(),
        forced,
        maps_merged,
        bids_sent,
        rejected_actions: world.rejected_actions(),
        allocation_conflict: ledger.conflict,
        awards: ledger.awards(),
        cpu_user_s,
        cpu_sys_s,
    })
}

/// Run the demo and print the summary block on stdout.
pub fn run_demo(config: &SimConfig) -> Result<()> {
    info!(agents = config.agents, steps = config.steps, "demo start");
    let outcome = run_simulation(config)?;
    info!(elapsed_ms = outcome.elapsed_ms as u64, "demo finished");

    println!("DEMO SUMMARY");
    println!("agents={} steps={}", outcome.agents, outcome.steps);
    println!("tasks_announced={}", outcome.tasks_announced);
    println!("subtasks_completed={}", outcome.subtasks_completed);
    println!("auctions_resolved={}", outcome.auctions_resolved);
    println!("winners={}", outcome.winners);
    println!("unallocatable={}", outcome.unallocatable);
    println!("forced_by_deadline={}", outcome.forced);
    println!("maps_merged={}", outcome.maps_merged);
    println!("rejected_actions={}", outcome.rejected_actions);
    println!("allocation_conflict={}", outcome.allocation_conflict);
    println!("assigned={:?}", outcome.awards);
    Ok(())
}

const CSV_HEADER: &str = "agents,steps,seed,elapsed_ms,tasks_announced,subtasks_completed,auctions_resolved,winners,unallocatable,forced,maps_merged,bids_sent,cpu_user_s,cpu_sys_s,allocation_conflict";

fn csv_row(outcome: &SimOutcome) -> String {
    let cpu = |value: Option<f64>| value.map_or_else(|| "NA".to_string(), |v| format!("{v:.4}"));
    format!(
        "{},{},{},{:.2},{},{},{},{},{},{},{},{},{},{},{}",
        outcome.agents,
        outcome.steps,
        outcome.seed,
        outcome.elapsed_ms,
        outcome.tasks_announced,
        outcome.subtasks_completed,
        outcome.auctions_resolved,
        outcome.winners,
        outcome.unallocatable,
        outcome.forced,
        outcome.maps_merged,
        outcome.bids_sent,
        cpu(outcome.cpu_user_s),
        cpu(outcome.cpu_sys_s),
        outcome.allocation_conflict
    )
}

/// Run a single simulation and print one CSV line.
pub fn run_benchmark(config: &SimConfig) -> Result<()> {
    let outcome = run_simulation(config)?;
    println!("{CSV_HEADER}");
    println!("{}", csv_row(&outcome));
    if outcome.allocation_conflict {
        eprintln!("# violation,allocation_conflict");
    }
    Ok(())
}

/// Sweep agent counts and seeds over a base configuration.
pub fn run_stress(base: &SimConfig, agent_sets: &[usize], seeds: &[u64]) -> Result<()> {
    println!("{CSV_HEADER}");
    for &agents in agent_sets {
        if agents == 0 {
            eprintln!("stress warning: ignored agent set 0");
            continue;
        }
        for &seed in seeds {
            let config = SimConfig {
                agents,
                seed,
                ..base.clone()
            };
            let outcome = run_simulation(&config)?;
            println!("{}", csv_row(&outcome));
            if outcome.allocation_conflict {
                eprintln!("# violation,allocation_conflict,agents={agents},seed={seed}");
            }
        }
    }
    Ok(())
}
