//! Grid search over a [`CellMatrix`]: breadth-first distance fields and A*.
//!
//! Only Free, Goal and Dispenser cells are traversable; Unknown and Obstacle
//! cells block. Neighbours expand in N, E, S, W order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use crate::grid::CellMatrix;
use crate::types::Position;

/// Step distances from a source cell to every reachable cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistanceField {
    source: Position,
    rows: usize,
    cols: usize,
    /// `None` marks cells the search never reached.
    distances: Vec<Option<u32>>,
}

impl DistanceField {
    /// Breadth-first search from `source`. The source itself is always at
    /// distance zero, even when it is not traversable.
    pub fn compute(matrix: &CellMatrix, source: Position) -> Self {
        let rows = matrix.rows();
        let cols = matrix.cols();
        let mut field = Self {
            source,
            rows,
            cols,
            distances: vec![None; rows * cols],
        };
        let Some(start) = field.index(source) else {
            return field;
        };
        field.distances[start] = Some(0);
        let mut frontier = VecDeque::from([(source, 0u32)]);
        while let Some((pos, dist)) = frontier.pop_front() {
            for next in pos.neighbours() {
                if !matrix.is_passable(next) {
                    continue;
                }
                let Some(idx) = field.index(next) else {
                    continue;
                };
                if field.distances[idx].is_none() {
                    field.distances[idx] = Some(dist + 1);
                    frontier.push_back((next, dist + 1));
                }
            }
        }
        field
    }

    /// Matrix position the field was computed from.
    pub fn source(&self) -> Position {
        self.source
    }

    /// Distance to `pos`, or `None` when unreached or outside the field.
    pub fn distance(&self, pos: Position) -> Option<u32> {
        self.index(pos).and_then(|idx| self.distances[idx])
    }

    fn index(&self, pos: Position) -> Option<usize> {
        if pos.row < 0 || pos.col < 0 {
            return None;
        }
        let (row, col) = (pos.row as usize, pos.col as usize);
        if row < self.rows && col < self.cols {
            Some(row * self.cols + col)
        } else {
            None
        }
    }
}

/// Shortest 4-connected path from `start` to `goal`, both ends included.
///
/// A* with the Manhattan heuristic, which is admissible on a 4-connected
/// grid. The open set is ordered by `(f, h, row, col)` so ties between equally
/// short paths resolve the same way every time. `start` may be untraversable
/// (an agent stands on it); `goal` must be traversable unless it equals
/// `start`.
pub fn find_path(matrix: &CellMatrix, start: Position, goal: Position) -> Option<Vec<Position>> {
    if !matrix.contains(start) || !matrix.contains(goal) {
        return None;
    }
    if start == goal {
        return Some(vec![start]);
    }
    if !matrix.is_passable(goal) {
        return None;
    }

    let cols = matrix.cols();
    let index = |pos: Position| pos.row as usize * cols + pos.col as usize;
    let size = matrix.rows() * cols;
    let mut best: Vec<Option<u32>> = vec![None; size];
    let mut came_from: Vec<Option<Position>> = vec![None; size];
    let mut closed = vec![false; size];
    let mut open = BinaryHeap::new();

    best[index(start)] = Some(0);
    let h = start.manhattan(goal);
    open.push(Reverse((h, h, start.row, start.col)));

    while let Some(Reverse((_, _, row, col))) = open.pop() {
        let pos = Position::new(row, col);
        let idx = index(pos);
        if closed[idx] {
            continue;
        }
        if pos == goal {
            return Some(rebuild(&came_from, index, pos));
        }
        closed[idx] = true;
        let g = best[idx].unwrap_or(0);
        for next in pos.neighbours() {
            if !matrix.is_passable(next) {
                continue;
            }
            let next_idx = index(next);
            if closed[next_idx] {
                continue;
            }
            let tentative = g + 1;
            if best[next_idx].is_some_and(|known| known <= tentative) {
                continue;
            }
            best[next_idx] = Some(tentative);
            came_from[next_idx] = Some(pos);
            let h = next.manhattan(goal);
            open.push(Reverse((tentative + h, h, next.row, next.col)));
        }
    }
    None
}

fn rebuild(
    came_from: &[Option<Position>],
    index: impl Fn(Position) -> usize,
    goal: Position,
) -> Vec<Position> {
    let mut route = vec![goal];
    let mut current = goal;
    while let Some(prev) = came_from[index(current)] {
        route.push(prev);
        current = prev;
    }
    route.reverse();
    route
}
