//! Tasks announced by the simulation and their decomposition into subtasks.
//!
//! Every agent builds the same subtask ids from the same task percepts, which
//! is what lets independently run auctions refer to the same unit of work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{AgentId, BlockKind, SubtaskId};

/// A task as reported by perception.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPercept {
    pub name: String,
    /// Last step at which the task can be completed.
    pub deadline: u64,
    pub reward: u32,
    /// One required block per subtask, in order.
    pub requirements: Vec<BlockKind>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubtaskStatus {
    Unassigned,
    Assigned,
    Done,
}

/// A unit of a task that exactly one agent performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubTask {
    pub id: SubtaskId,
    pub task: String,
    pub index: usize,
    pub kind: BlockKind,
    pub status: SubtaskStatus,
    pub assignee: Option<AgentId>,
    /// Incremented each time an auction for this subtask ends Unallocatable.
    pub round: u32,
}

impl SubTask {
    fn new(task: &str, index: usize, kind: BlockKind) -> Self {
        Self {
            id: format!("{task}_{index}"),
            task: task.to_string(),
            index,
            kind,
            status: SubtaskStatus::Unassigned,
            assignee: None,
            round: 0,
        }
    }

    /// Key of the auction currently running for this subtask.
    pub fn auction_key(&self) -> String {
        auction_key(&self.id, self.round)
    }
}

/// Auction key of `subtask` in retry round `round`.
pub fn auction_key(subtask: &str, round: u32) -> String {
    format!("{subtask}@{round}")
}

/// Split an auction key back into subtask id and round.
pub fn parse_auction_key(key: &str) -> Option<(&str, u32)> {
    let (subtask, round) = key.rsplit_once('@')?;
    Some((subtask, round.parse().ok()?))
}

#[derive(Clone, Debug)]
pub struct Task {
    pub name: String,
    pub deadline: u64,
    pub reward: u32,
    pub first_seen: u64,
    pub subtasks: Vec<SubTask>,
}

impl Task {
    fn from_percept(percept: &TaskPercept, step: u64) -> Self {
        Self {
            name: percept.name.clone(),
            deadline: percept.deadline,
            reward: percept.reward,
            first_seen: step,
            subtasks: percept
                .requirements
                .iter()
                .enumerate()
                .map(|(index, kind)| SubTask::new(&percept.name, index, kind.clone()))
                .collect(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.subtasks
            .iter()
            .all(|sub| sub.status == SubtaskStatus::Done)
    }
}

/// Local representation of all live tasks.
#[derive(Debug, Default)]
pub struct TaskBoard {
    tasks: BTreeMap<String, Task>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile with the tasks currently perceived.
    ///
    /// New tasks are added; tasks that vanished from perception, passed their
    /// deadline or have every subtask done are removed. Returns the removed
    /// subtasks so their auctions can be evicted.
    pub fn update(&mut self, percepts: &[TaskPercept], step: u64) -> Vec<SubTask> {
        for percept in percepts {
            if percept.deadline < step || self.tasks.contains_key(&percept.name) {
                continue;
            }
            debug!(task = %percept.name, subtasks = percept.requirements.len(), "new task");
            self.tasks
                .insert(percept.name.clone(), Task::from_percept(percept, step));
        }

        let mut removed = Vec::new();
        self.tasks.retain(|name, task| {
            let visible = percepts.iter().any(|p| &p.name == name);
            let keep = visible && task.deadline >= step && !task.is_done();
            if !keep {
                debug!(task = %name, visible, "task removed");
                removed.extend(task.subtasks.drain(..));
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn subtasks(&self) -> impl Iterator<Item = &SubTask> {
        self.tasks.values().flat_map(|task| task.subtasks.iter())
    }

    /// Subtasks still waiting for an agent, in task-name order.
    pub fn unassigned(&self) -> impl Iterator<Item = &SubTask> {
        self.subtasks()
            .filter(|sub| sub.status == SubtaskStatus::Unassigned)
    }

    pub fn subtask(&self, id: &str) -> Option<&SubTask> {
        self.subtasks().find(|sub| sub.id == id)
    }

    fn subtask_mut(&mut self, id: &str) -> Option<&mut SubTask> {
        self.tasks
            .values_mut()
            .flat_map(|task| task.subtasks.iter_mut())
            .find(|sub| sub.id == id)
    }

    /// Mark an Unassigned subtask as won by `agent`.
    pub fn assign(&mut self, id: &str, agent: &str) -> bool {
        match self.subtask_mut(id) {
            Some(sub) if sub.status == SubtaskStatus::Unassigned => {
                sub.status = SubtaskStatus::Assigned;
                sub.assignee = Some(agent.to_string());
                true
            }
            _ => false,
        }
    }

    /// Open the next auction round for an Unassigned subtask.
    pub fn retry(&mut self, id: &str) -> Option<u32> {
        let sub = self.subtask_mut(id)?;
        if sub.status != SubtaskStatus::Unassigned {
            return None;
        }
        sub.round += 1;
        Some(sub.round)
    }

    pub fn complete(&mut self, id: &str) -> bool {
        match self.subtask_mut(id) {
            Some(sub) if sub.status != SubtaskStatus::Done => {
                sub.status = SubtaskStatus::Done;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percept(name: &str, deadline: u64, requirements: &[&str]) -> TaskPercept {
        TaskPercept {
            name: name.to_string(),
            deadline,
            reward: 10,
            requirements: requirements.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn percept_creates_subtasks_with_stable_ids() {
        let mut board = TaskBoard::new();
        board.update(&[percept("task3", 50, &["b0", "b1"])], 1);
        let ids: Vec<&str> = board.subtasks().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["task3_0", "task3_1"]);
        assert_eq!(board.subtask("task3_1").map(|s| s.kind.as_str()), Some("b1"));
    }

    #[test]
    fn vanished_or_expired_tasks_are_removed() {
        let mut board = TaskBoard::new();
        board.update(&[percept("t1", 50, &["b0"]), percept("t2", 5, &["b1"])], 1);
        assert_eq!(board.len(), 2);
        let removed = board.update(&[percept("t2", 5, &["b1"])], 2);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "t1_0");
        let removed = board.update(&[percept("t2", 5, &["b1"])], 6);
        assert_eq!(removed[0].id, "t2_0");
        assert!(board.is_empty());
    }

    #[test]
    fn finished_task_is_removed() {
        let mut board = TaskBoard::new();
        let tasks = [percept("t1", 50, &["b0"])];
        board.update(&tasks, 1);
        assert!(board.assign("t1_0", "agentA1"));
        assert!(board.complete("t1_0"));
        let removed = board.update(&tasks, 2);
        assert_eq!(removed.len(), 1);
        assert!(board.is_empty());
    }

    #[test]
    fn assignment_is_single_and_retry_bumps_round() {
        let mut board = TaskBoard::new();
        board.update(&[percept("t1", 50, &["b0", "b0"])], 1);
        assert_eq!(board.retry("t1_0"), Some(1));
        assert_eq!(board.subtask("t1_0").map(|s| s.auction_key()), Some("t1_0@1".to_string()));
        assert!(board.assign("t1_0", "agentA2"));
        assert!(!board.assign("t1_0", "agentA1"));
        assert_eq!(board.retry("t1_0"), None);
        assert_eq!(board.unassigned().count(), 1);
    }

    #[test]
    fn auction_key_round_trips() {
        assert_eq!(parse_auction_key("task_3_1@2"), Some(("task_3_1", 2)));
        assert_eq!(parse_auction_key("task_3_1"), None);
    }
}
