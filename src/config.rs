//! Configuration for a node and for the simulated field.
//!
//! Both structs load from JSON; every field has a default so partial files
//! are accepted.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::AgentId;

/// Per-deployment settings of one agent node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of distinct agents whose bids must arrive before an auction resolves
    pub quorum_size: usize,

    /// Perception radius (Manhattan) used to size the initial map
    pub vision: i32,

    /// Age after which a Pending auction is force-resolved over the bids it has
    pub auction_timeout_ms: u64,

    /// Subtracted from the per-step time budget when computing the cycle deadline
    pub safety_margin_ms: u64,

    /// Silence after which a peer is reported as unresponsive
    pub peer_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            quorum_size: 2,
            vision: 5,
            auction_timeout_ms: 2_000,
            safety_margin_ms: 200,
            peer_timeout_ms: 1_500,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quorum_size == 0 {
            return Err(Error::Config("quorum_size must be > 0".to_string()));
        }
        if self.vision <= 0 {
            return Err(Error::Config("vision must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn auction_timeout(&self) -> Duration {
        Duration::from_millis(self.auction_timeout_ms)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

/// Parameters of the simulated world used by the demo and benchmarks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of agents (also the auction quorum)
    pub agents: usize,

    /// Simulation steps to run
    pub steps: u64,

    pub width: i32,
    pub height: i32,

    /// Seed for world generation
    pub seed: u64,

    /// Block kinds offered by dispensers
    pub kinds: Vec<String>,

    /// Dispensers placed per kind
    pub dispensers_per_kind: usize,

    /// Fraction of cells turned into obstacles (0.0 to 1.0)
    pub obstacle_density: f64,

    /// Wall-clock budget of one step in milliseconds
    pub step_ms: u64,

    /// Steps between two task announcements
    pub task_interval: u64,

    /// Agents whose outgoing auction messages are dropped by the transport
    pub drop_bids_from: Vec<AgentId>,

    /// Node settings replacing the ones derived from the step budget; the
    /// quorum always follows `agents`
    pub node: Option<NodeConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            agents: 3,
            steps: 40,
            width: 24,
            height: 16,
            seed: 7,
            kinds: vec!["b0".to_string(), "b1".to_string()],
            dispensers_per_kind: 2,
            obstacle_density: 0.08,
            step_ms: 400,
            task_interval: 10,
            drop_bids_from: Vec::new(),
            node: None,
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agents == 0 {
            return Err(Error::Config("agents must be > 0".to_string()));
        }
        if self.width < 8 || self.height < 8 {
            return Err(Error::Config("world must be at least 8x8".to_string()));
        }
        if self.kinds.is_empty() {
            return Err(Error::Config("at least one block kind is required".to_string()));
        }
        if !(0.0..0.5).contains(&self.obstacle_density) {
            return Err(Error::Config(
                "obstacle_density must be in [0.0, 0.5)".to_string(),
            ));
        }
        Ok(())
    }

    /// Node settings implied by this simulation.
    pub fn node_config(&self) -> NodeConfig {
        match &self.node {
            Some(node) => NodeConfig {
                quorum_size: self.agents,
                ..node.clone()
            },
            None => NodeConfig {
                quorum_size: self.agents,
                auction_timeout_ms: self.step_ms * 3,
                safety_margin_ms: self.step_ms / 4,
                peer_timeout_ms: self.step_ms * 2,
                ..NodeConfig::default()
            },
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
