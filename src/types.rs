//! Shared identifiers and grid geometry used across the node.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Unique name of a participating agent (e.g. `agentA1`).
pub type AgentId = String;
/// Stable identifier of a subtask, identical on every agent (`{task}_{index}`).
pub type SubtaskId = String;
/// Resource kind produced by a dispenser and required by a subtask (e.g. `b0`).
pub type BlockKind = String;

/// A grid coordinate. Used both for matrix coordinates and for positions
/// relative to an agent's local frame, so components may be negative.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub row: i32,
    pub col: i32,
}

impl Position {
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    /// Manhattan distance between two positions.
    pub fn manhattan(self, other: Position) -> u32 {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col)
    }

    /// The four orthogonal neighbours in fixed N, E, S, W order.
    pub fn neighbours(self) -> [Position; 4] {
        Direction::ALL.map(|dir| self + dir.offset())
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.row + rhs.row, self.col + rhs.col)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.row - rhs.row, self.col - rhs.col)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Movement direction understood by the movement collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    N,
    E,
    S,
    W,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Direction::N, Direction::E, Direction::S, Direction::W];

    /// Row/column delta of a single step in this direction.
    pub fn offset(self) -> Position {
        match self {
            Direction::N => Position::new(-1, 0),
            Direction::E => Position::new(0, 1),
            Direction::S => Position::new(1, 0),
            Direction::W => Position::new(0, -1),
        }
    }

    /// Direction of a single orthogonal step from `from` to `to`.
    pub fn between(from: Position, to: Position) -> Option<Direction> {
        let delta = to - from;
        Direction::ALL
            .into_iter()
            .find(|dir| dir.offset() == delta)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::N => "n",
            Direction::E => "e",
            Direction::S => "s",
            Direction::W => "w",
        };
        f.write_str(name)
    }
}
