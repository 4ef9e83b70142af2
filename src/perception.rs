//! Per-step input delivered by the perception collaborator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tasks::TaskPercept;
use crate::types::{BlockKind, Position};

/// A dispenser in view, relative to the agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenserSighting {
    pub offset: Position,
    pub kind: BlockKind,
}

/// Everything an agent learns at the start of a simulation step.
///
/// `position` is in the agent's relative frame; every other location is an
/// offset from `position`. Cells in the vision diamond that are not listed
/// as obstacles, goals or dispensers are free.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Perception {
    pub step: u64,
    /// Server time when the step was requested (ms)
    pub time_ms: u64,
    /// Server deadline for the step's action (ms)
    pub deadline_ms: u64,
    pub position: Position,
    pub vision: i32,
    pub obstacles: Vec<Position>,
    pub goals: Vec<Position>,
    pub dispensers: Vec<DispenserSighting>,
    pub tasks: Vec<TaskPercept>,
    /// Whether the world accepted the agent's previous action; `None` on the
    /// first step
    #[serde(default)]
    pub last_action_accepted: Option<bool>,
}

impl Perception {
    /// Time the server grants for this step.
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.saturating_sub(self.time_ms))
    }
}
