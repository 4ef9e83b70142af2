//! Ground-truth field used by the simulator.
//!
//! The world knows absolute positions; agents only ever see perceptions
//! relative to where they started.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::SimConfig;
use crate::perception::{DispenserSighting, Perception};
use crate::tasks::TaskPercept;
use crate::types::{AgentId, BlockKind, Direction, Position};

const GOAL_SIDE: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Terrain {
    Free,
    Obstacle,
    Goal,
}

/// What an agent asks the world to do at the end of a step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Skip,
    Move(Direction),
    /// Take a block of the given kind from the dispenser underfoot.
    Dispense(BlockKind),
    /// Hand the carried block in for a subtask while standing in the goal area.
    Deliver(String),
}

#[derive(Clone, Debug)]
struct Body {
    name: AgentId,
    start: Position,
    position: Position,
    carrying: Option<BlockKind>,
    last_action_accepted: Option<bool>,
}

#[derive(Clone, Debug)]
struct LiveTask {
    percept: TaskPercept,
    delivered: Vec<bool>,
}

impl LiveTask {
    fn is_done(&self) -> bool {
        self.delivered.iter().all(|d| *d)
    }
}

pub struct World {
    width: i32,
    height: i32,
    vision: i32,
    terrain: Vec<Terrain>,
    dispensers: BTreeMap<Position, BlockKind>,
    bodies: Vec<Body>,
    tasks: Vec<LiveTask>,
    kinds: Vec<BlockKind>,
    task_interval: u64,
    rng: StdRng,
    step: u64,
    tasks_announced: usize,
    subtasks_completed: usize,
    rejected_actions: usize,
}

impl World {
    /// Generate a world from `config`; the same seed yields the same world.
    pub fn generate(config: &SimConfig, vision: i32) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (width, height) = (config.width, config.height);
        let mut terrain = vec![Terrain::Free; (width * height) as usize];

        let goal_top = Position::new(height / 2 - 1, width / 2 - 1);
        let in_goal_halo = |pos: Position| {
            pos.row >= goal_top.row - 1
                && pos.row <= goal_top.row + GOAL_SIDE
                && pos.col >= goal_top.col - 1
                && pos.col <= goal_top.col + GOAL_SIDE
        };

        for row in 0..height {
            for col in 0..width {
                let pos = Position::new(row, col);
                let border = row == 0 || col == 0 || row == height - 1 || col == width - 1;
                let idx = (row * width + col) as usize;
                if border {
                    terrain[idx] = Terrain::Obstacle;
                } else if !in_goal_halo(pos) && rng.random_bool(config.obstacle_density) {
                    terrain[idx] = Terrain::Obstacle;
                }
            }
        }
        for row in 0..GOAL_SIDE {
            for col in 0..GOAL_SIDE {
                let pos = goal_top + Position::new(row, col);
                terrain[(pos.row * width + pos.col) as usize] = Terrain::Goal;
            }
        }

        let mut world = Self {
            width,
            height,
            vision,
            terrain,
            dispensers: BTreeMap::new(),
            bodies: Vec::new(),
            tasks: Vec::new(),
            kinds: config.kinds.clone(),
            task_interval: config.task_interval.max(1),
            rng,
            step: 0,
            tasks_announced: 0,
            subtasks_completed: 0,
            rejected_actions: 0,
        };

        for kind in &config.kinds {
            for _ in 0..config.dispensers_per_kind {
                let pos = world.random_free_cell();
                world.dispensers.insert(pos, kind.clone());
            }
        }
        for index in 0..config.agents {
            let start = world.random_free_cell();
            world.bodies.push(Body {
                name: agent_name(index),
                start,
                position: start,
                carrying: None,
                last_action_accepted: None,
            });
        }
        info!(
            width,
            height,
            seed = config.seed,
            agents = config.agents,
            dispensers = world.dispensers.len(),
            "world generated"
        );
        world
    }

    fn terrain(&self, pos: Position) -> Terrain {
        if pos.row < 0 || pos.col < 0 || pos.row >= self.height || pos.col >= self.width {
            return Terrain::Obstacle;
        }
        self.terrain[(pos.row * self.width + pos.col) as usize]
    }

    fn random_free_cell(&mut self) -> Position {
        loop {
            let pos = Position::new(
                self.rng.random_range(1..self.height - 1),
                self.rng.random_range(1..self.width - 1),
            );
            if self.terrain(pos) == Terrain::Free && !self.dispensers.contains_key(&pos) {
                return pos;
            }
        }
    }

    pub fn agent_names(&self) -> Vec<AgentId> {
        self.bodies.iter().map(|body| body.name.clone()).collect()
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn tasks_announced(&self) -> usize {
        self.tasks_announced
    }

    pub fn subtasks_completed(&self) -> usize {
        self.subtasks_completed
    }

    pub fn rejected_actions(&self) -> usize {
        self.rejected_actions
    }

    /// Advance the clock: announce new tasks and drop finished or expired ones.
    pub fn begin_step(&mut self) {
        self.step += 1;
        let step = self.step;
        self.tasks
            .retain(|task| !task.is_done() && task.percept.deadline >= step);

        if (step - 1) % self.task_interval == 0 {
            let count = self.rng.random_range(1..=2usize);
            let requirements: Vec<BlockKind> = (0..count)
                .map(|_| self.kinds[self.rng.random_range(0..self.kinds.len())].clone())
                .collect();
            let percept = TaskPercept {
                name: format!("task{}", self.tasks_announced),
                deadline: step + self.rng.random_range(20..40),
                reward: 10 * count as u32,
                requirements,
            };
            debug!(task = %percept.name, requirements = ?percept.requirements, "task announced");
            self.tasks_announced += 1;
            self.tasks.push(LiveTask {
                delivered: vec![false; percept.requirements.len()],
                percept,
            });
        }
    }

    /// What agent `index` perceives right now, in its own frame.
    pub fn perceive(&self, index: usize, time_ms: u64, deadline_ms: u64) -> Perception {
        let body = &self.bodies[index];
        let mut perception = Perception {
            step: self.step,
            time_ms,
            deadline_ms,
            position: body.position - body.start,
            vision: self.vision,
            tasks: self.tasks.iter().map(|task| task.percept.clone()).collect(),
            last_action_accepted: body.last_action_accepted,
            ..Perception::default()
        };
        let vision = self.vision;
        for d_row in -vision..=vision {
            let span = vision - d_row.abs();
            for d_col in -span..=span {
                let offset = Position::new(d_row, d_col);
                let abs = body.position + offset;
                match self.terrain(abs) {
                    Terrain::Obstacle => perception.obstacles.push(offset),
                    Terrain::Goal => perception.goals.push(offset),
                    Terrain::Free => {}
                }
                if let Some(kind) = self.dispensers.get(&abs) {
                    perception.dispensers.push(DispenserSighting {
                        offset,
                        kind: kind.clone(),
                    });
                }
            }
        }
        perception
    }

    /// Apply one agent's action. Returns whether the world accepted it.
    pub fn apply(&mut self, index: usize, action: &Action) -> bool {
        let accepted = match action {
            Action::Skip => true,
            Action::Move(direction) => {
                let target = self.bodies[index].position + direction.offset();
                let passable = self.terrain(target) != Terrain::Obstacle;
                if passable {
                    self.bodies[index].position = target;
                }
                passable
            }
            Action::Dispense(kind) => {
                // A new block replaces whatever the agent was holding.
                let body = &mut self.bodies[index];
                let ok = self.dispensers.get(&body.position) == Some(kind);
                if ok {
                    body.carrying = Some(kind.clone());
                }
                ok
            }
            Action::Deliver(subtask) => self.deliver(index, subtask),
        };
        self.bodies[index].last_action_accepted = Some(accepted);
        if !accepted {
            self.rejected_actions += 1;
            debug!(agent = %self.bodies[index].name, ?action, "action rejected");
        }
        accepted
    }

    fn deliver(&mut self, index: usize, subtask: &str) -> bool {
        let position = self.bodies[index].position;
        if self.terrain(position) != Terrain::Goal {
            return false;
        }
        let Some((task_name, slot)) = subtask.rsplit_once('_') else {
            return false;
        };
        let Ok(slot) = slot.parse::<usize>() else {
            return false;
        };
        let carrying = self.bodies[index].carrying.clone();
        let Some(task) = self
            .tasks
            .iter_mut()
            .find(|task| task.percept.name == task_name)
        else {
            return false;
        };
        let wanted = task.percept.requirements.get(slot);
        if wanted.is_none() || wanted != carrying.as_ref() || task.delivered[slot] {
            return false;
        }
        task.delivered[slot] = true;
        self.bodies[index].carrying = None;
        self.subtasks_completed += 1;
        info!(agent = %self.bodies[index].name, %subtask, "subtask delivered");
        true
    }
}

pub fn agent_name(index: usize) -> AgentId {
    format!("agentA{}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimConfig {
        SimConfig {
            agents: 2,
            seed: 11,
            ..SimConfig::default()
        }
    }

    #[test]
    fn same_seed_same_world() {
        let a = World::generate(&config(), 5);
        let b = World::generate(&config(), 5);
        assert_eq!(a.terrain, b.terrain);
        assert_eq!(a.dispensers, b.dispensers);
        assert_eq!(a.agent_names(), vec!["agentA1", "agentA2"]);
    }

    #[test]
    fn perception_is_relative_to_start() {
        let mut world = World::generate(&config(), 3);
        world.begin_step();
        let first = world.perceive(0, 0, 400);
        assert_eq!(first.position, Position::new(0, 0));
        assert_eq!(first.last_action_accepted, None);
        assert_eq!(first.tasks.len(), 1);

        let moved = Direction::ALL
            .into_iter()
            .find(|&d| world.apply(0, &Action::Move(d)))
            .expect("agent boxed in");
        let second = world.perceive(0, 0, 400);
        assert_eq!(second.position, moved.offset());
    }

    #[test]
    fn walls_reject_moves_and_dispense_needs_dispenser() {
        let mut world = World::generate(&config(), 3);
        world.bodies[0].position = Position::new(1, 1);
        world.dispensers.remove(&Position::new(1, 1));
        assert!(!world.apply(0, &Action::Move(Direction::N)));
        assert_eq!(world.bodies[0].position, Position::new(1, 1));
        assert!(!world.apply(0, &Action::Dispense("b0".to_string())));
        assert_eq!(world.rejected_actions(), 2);
        assert_eq!(world.perceive(0, 0, 400).last_action_accepted, Some(false));
        assert!(world.apply(0, &Action::Skip));
        assert_eq!(world.perceive(0, 0, 400).last_action_accepted, Some(true));
    }

    #[test]
    fn delivery_completes_subtask_in_goal_area() {
        let mut world = World::generate(&config(), 3);
        world.begin_step();
        let kind = world.tasks[0].percept.requirements[0].clone();
        let (&dispenser, _) = world
            .dispensers
            .iter()
            .find(|(_, k)| **k == kind)
            .expect("dispenser of required kind");
        world.bodies[0].position = dispenser;
        assert!(world.apply(0, &Action::Dispense(kind)));

        world.bodies[0].position = Position::new(world.height / 2, world.width / 2);
        assert!(world.apply(0, &Action::Deliver("task0_0".to_string())));
        assert_eq!(world.subtasks_completed(), 1);
        assert!(!world.apply(0, &Action::Deliver("task0_0".to_string())));
    }
}
