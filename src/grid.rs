//! Local belief about the shared world: occupancy matrix, dispensers, goal
//! landmark and the distance field from the agent's current position.
//!
//! Two coordinate systems are in play. *Relative* positions are expressed in
//! the agent's own frame, anchored where the agent started. *Matrix* positions
//! index the occupancy matrix. `origin` is the matrix position of relative
//! (0, 0); the matrix only grows by whole rows/columns and `origin` moves by
//! exactly what was prepended, so both stay consistent.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::merge;
use crate::path::{self, DistanceField};
use crate::perception::Perception;
use crate::types::{AgentId, BlockKind, Direction, Position};

/// What an agent knows about a single cell.
///
/// Variants are ordered by information content; merging keeps the greater.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Cell {
    #[default]
    Unknown,
    Free,
    Obstacle,
    Goal,
    Dispenser,
}

impl Cell {
    pub fn is_passable(self) -> bool {
        matches!(self, Cell::Free | Cell::Goal | Cell::Dispenser)
    }

    pub fn is_known(self) -> bool {
        self != Cell::Unknown
    }

    /// Combine two observations of the same cell.
    pub fn join(self, other: Cell) -> Cell {
        self.max(other)
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Cell::Unknown => 0,
            Cell::Free => 1,
            Cell::Obstacle => 2,
            Cell::Goal => 3,
            Cell::Dispenser => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Cell> {
        match byte {
            0 => Some(Cell::Unknown),
            1 => Some(Cell::Free),
            2 => Some(Cell::Obstacle),
            3 => Some(Cell::Goal),
            4 => Some(Cell::Dispenser),
            _ => None,
        }
    }
}

/// Dense row-major matrix of cells.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

impl CellMatrix {
    /// A matrix of the given shape with every cell Unknown.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![Cell::Unknown; rows * cols],
        }
    }

    /// Decode the wire form produced by [`CellMatrix::to_bytes`].
    pub fn from_bytes(rows: usize, cols: usize, bytes: &[u8]) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(Error::MalformedMapMessage(format!(
                "empty shape {rows}x{cols}"
            )));
        }
        if rows.checked_mul(cols) != Some(bytes.len()) {
            return Err(Error::MalformedMapMessage(format!(
                "shape {rows}x{cols} does not match {} cells",
                bytes.len()
            )));
        }
        let cells = bytes
            .iter()
            .map(|&byte| {
                Cell::from_byte(byte).ok_or_else(|| {
                    Error::MalformedMapMessage(format!("unknown cell code {byte}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rows, cols, cells })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.cells.iter().map(|cell| cell.to_byte()).collect()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos.row >= 0
            && pos.col >= 0
            && (pos.row as usize) < self.rows
            && (pos.col as usize) < self.cols
    }

    fn index(&self, pos: Position) -> Option<usize> {
        if self.contains(pos) {
            Some(pos.row as usize * self.cols + pos.col as usize)
        } else {
            None
        }
    }

    /// Cell at `pos`, or `None` outside the matrix.
    pub fn get(&self, pos: Position) -> Option<Cell> {
        self.index(pos).map(|idx| self.cells[idx])
    }

    /// Overwrite a cell; returns false outside the matrix.
    pub fn set(&mut self, pos: Position, cell: Cell) -> bool {
        match self.index(pos) {
            Some(idx) => {
                self.cells[idx] = cell;
                true
            }
            None => false,
        }
    }

    /// Join `cell` into the cell at `pos`; returns false outside the matrix.
    pub fn join(&mut self, pos: Position, cell: Cell) -> bool {
        match self.index(pos) {
            Some(idx) => {
                self.cells[idx] = self.cells[idx].join(cell);
                true
            }
            None => false,
        }
    }

    pub fn is_passable(&self, pos: Position) -> bool {
        self.get(pos).is_some_and(Cell::is_passable)
    }

    /// All cells with their matrix positions in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (Position, Cell)> + '_ {
        self.cells.iter().enumerate().map(|(idx, &cell)| {
            let row = (idx / self.cols) as i32;
            let col = (idx % self.cols) as i32;
            (Position::new(row, col), cell)
        })
    }

    pub fn count(&self, cell: Cell) -> usize {
        self.cells.iter().filter(|&&c| c == cell).count()
    }

    /// Copy into a larger matrix padded with Unknown cells on each side.
    fn padded(&self, top: usize, left: usize, bottom: usize, right: usize) -> CellMatrix {
        let mut grown = CellMatrix::new(self.rows + top + bottom, self.cols + left + right);
        let offset = Position::new(top as i32, left as i32);
        for (pos, cell) in self.iter() {
            grown.set(pos + offset, cell);
        }
        grown
    }
}

/// An agent's local, partial model of the shared grid.
#[derive(Clone, Debug)]
pub struct GridKnowledge {
    agent: AgentId,
    vision: i32,
    matrix: CellMatrix,
    origin: Position,
    /// Agent position in its relative frame.
    position: Position,
    /// Known dispensers keyed by relative position.
    dispensers: BTreeMap<Position, BlockKind>,
    goal_area_fully_discovered: bool,
    distance_field: Option<DistanceField>,
}

impl GridKnowledge {
    /// Empty knowledge sized to one vision diamond around the start cell.
    pub fn new(agent: impl Into<AgentId>, vision: i32) -> Self {
        let side = (2 * vision + 1) as usize;
        Self {
            agent: agent.into(),
            vision,
            matrix: CellMatrix::new(side, side),
            origin: Position::new(vision, vision),
            position: Position::default(),
            dispensers: BTreeMap::new(),
            goal_area_fully_discovered: false,
            distance_field: None,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn matrix(&self) -> &CellMatrix {
        &self.matrix
    }

    pub fn origin(&self) -> Position {
        self.origin
    }

    /// Current agent position in the relative frame.
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn goal_area_fully_discovered(&self) -> bool {
        self.goal_area_fully_discovered
    }

    pub fn distance_field(&self) -> Option<&DistanceField> {
        self.distance_field.as_ref()
    }

    pub fn to_matrix(&self, relative: Position) -> Position {
        relative + self.origin
    }

    pub fn to_relative(&self, matrix: Position) -> Position {
        matrix - self.origin
    }

    /// Known dispensers as (matrix position, kind), row-major.
    pub fn dispensers(&self) -> impl Iterator<Item = (Position, &str)> + '_ {
        self.dispensers
            .iter()
            .map(|(&rel, kind)| (rel + self.origin, kind.as_str()))
    }

    /// Cell at a relative position; Unknown outside the matrix.
    pub fn cell_at(&self, relative: Position) -> Cell {
        self.matrix
            .get(self.to_matrix(relative))
            .unwrap_or(Cell::Unknown)
    }

    /// Top-left goal cell in matrix coordinates, once the goal area is fully
    /// discovered.
    pub fn landmark(&self) -> Option<Position> {
        if !self.goal_area_fully_discovered {
            return None;
        }
        self.matrix
            .iter()
            .find(|&(_, cell)| cell == Cell::Goal)
            .map(|(pos, _)| pos)
    }

    /// Fold one perception into the map and refresh the distance field.
    pub fn update_map(&mut self, perception: &Perception) {
        let vision = perception.vision.max(1);
        self.vision = vision;
        self.position = perception.position;
        let low = self.position - Position::new(vision, vision);
        let high = self.position + Position::new(vision, vision);
        self.ensure_contains(low, high);

        for d_row in -vision..=vision {
            let span = vision - d_row.abs();
            for d_col in -span..=span {
                let rel = self.position + Position::new(d_row, d_col);
                let pos = self.to_matrix(rel);
                self.matrix.set(pos, Cell::Free);
            }
        }
        for &offset in &perception.obstacles {
            let pos = self.to_matrix(self.position + offset);
            self.matrix.set(pos, Cell::Obstacle);
        }
        for &offset in &perception.goals {
            let pos = self.to_matrix(self.position + offset);
            self.matrix.set(pos, Cell::Goal);
        }
        for sighting in &perception.dispensers {
            let rel = self.position + sighting.offset;
            let pos = self.to_matrix(rel);
            self.matrix.set(pos, Cell::Dispenser);
            self.dispensers.insert(rel, sighting.kind.clone());
        }

        self.refresh_goal_discovery();
        self.recompute_distance_field();
    }

    /// Replace the matrix with the merge of a peer's map.
    ///
    /// `remote_dispensers` are given in the remote matrix frame.
    pub fn absorb(
        &mut self,
        remote: &CellMatrix,
        remote_landmark: Position,
        remote_dispensers: &[(Position, BlockKind)],
    ) -> Result<()> {
        let local_landmark = self.landmark().ok_or(Error::UndiscoveredGoal)?;
        let (merged, merged_origin) = merge::merge(
            &self.matrix,
            remote,
            local_landmark,
            remote_landmark,
            self.origin,
        );
        let translation = local_landmark - remote_landmark;
        for (pos, kind) in remote_dispensers {
            let rel = *pos + translation - self.origin;
            self.dispensers.entry(rel).or_insert_with(|| kind.clone());
        }
        debug!(
            agent = %self.agent,
            rows = merged.rows(),
            cols = merged.cols(),
            origin = %merged_origin,
            "absorbed remote map"
        );
        self.matrix = merged;
        self.origin = merged_origin;
        self.refresh_goal_discovery();
        self.recompute_distance_field();
        Ok(())
    }

    /// First step towards the closest reachable dispenser of `kind`.
    ///
    /// `None` when no such dispenser is reachable or the agent already stands
    /// on it.
    pub fn direction_to_nearest_dispenser(&self, kind: &str) -> Option<Direction> {
        let field = self.distance_field.as_ref()?;
        let (_, target) = self
            .dispensers()
            .filter(|&(_, k)| k == kind)
            .filter_map(|(pos, _)| field.distance(pos).map(|d| (d, pos)))
            .min()?;
        self.first_step_to(target)
    }

    /// First step towards the closest known cell that borders unexplored space.
    pub fn direction_to_frontier(&self) -> Option<Direction> {
        let field = self.distance_field.as_ref()?;
        let (_, target) = self
            .matrix
            .iter()
            .filter(|&(pos, cell)| {
                cell.is_passable()
                    && pos
                        .neighbours()
                        .iter()
                        .any(|&n| !self.matrix.get(n).is_some_and(Cell::is_known))
            })
            .filter_map(|(pos, _)| field.distance(pos).map(|d| (d, pos)))
            .filter(|&(d, _)| d > 0)
            .min()?;
        self.first_step_to(target)
    }

    /// First step towards the goal landmark.
    pub fn direction_to_landmark(&self) -> Option<Direction> {
        self.first_step_to(self.landmark()?)
    }

    /// Kind of the dispenser under the agent, if any.
    pub fn dispenser_here(&self) -> Option<&str> {
        self.dispensers.get(&self.position).map(String::as_str)
    }

    fn first_step_to(&self, target: Position) -> Option<Direction> {
        let here = self.to_matrix(self.position);
        let route = path::find_path(&self.matrix, here, target)?;
        let next = *route.get(1)?;
        Direction::between(here, next)
    }

    /// Grow the matrix so both relative corners are inside it.
    fn ensure_contains(&mut self, low: Position, high: Position) {
        let low = self.to_matrix(low);
        let high = self.to_matrix(high);
        let pad = self.vision.max(1);
        let rows = self.matrix.rows() as i32;
        let cols = self.matrix.cols() as i32;
        let top = (if low.row < 0 { -low.row + pad } else { 0 }) as usize;
        let left = (if low.col < 0 { -low.col + pad } else { 0 }) as usize;
        let bottom = (if high.row >= rows { high.row + 1 - rows + pad } else { 0 }) as usize;
        let right = (if high.col >= cols { high.col + 1 - cols + pad } else { 0 }) as usize;
        if top + left + bottom + right == 0 {
            return;
        }
        self.matrix = self.matrix.padded(top, left, bottom, right);
        self.origin = self.origin + Position::new(top as i32, left as i32);
        self.distance_field = None;
    }

    /// The goal area counts as fully discovered once goal cells are known and
    /// none of them borders an unknown cell.
    fn refresh_goal_discovery(&mut self) {
        let mut saw_goal = false;
        let mut closed = true;
        for (pos, cell) in self.matrix.iter() {
            if cell != Cell::Goal {
                continue;
            }
            saw_goal = true;
            if pos
                .neighbours()
                .iter()
                .any(|&n| !self.matrix.get(n).is_some_and(Cell::is_known))
            {
                closed = false;
                break;
            }
        }
        let discovered = saw_goal && closed;
        if discovered && !self.goal_area_fully_discovered {
            debug!(agent = %self.agent, "goal area fully discovered");
        }
        // Once discovered it stays discovered; later views only add cells.
        self.goal_area_fully_discovered |= discovered;
    }

    fn recompute_distance_field(&mut self) {
        let source = self.to_matrix(self.position);
        self.distance_field = Some(DistanceField::compute(&self.matrix, source));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::perception::DispenserSighting;

    /// Build a perception for an agent at `position` from absolute world rows.
    ///
    /// `#` obstacle, `G` goal, lowercase letter dispenser of kind `b<letter>`,
    /// anything else free. `position` and all things are relative to `start`.
    pub(crate) fn perceive(world: &[&str], start: Position, at: Position, vision: i32) -> Perception {
        let absolute = start + at;
        let mut perception = Perception {
            position: at,
            vision,
            ..Perception::default()
        };
        for d_row in -vision..=vision {
            let span = vision - d_row.abs();
            for d_col in -span..=span {
                let offset = Position::new(d_row, d_col);
                let abs = absolute + offset;
                if abs.row < 0 || abs.col < 0 {
                    continue;
                }
                let Some(line) = world.get(abs.row as usize) else {
                    continue;
                };
                let Some(ch) = line.chars().nth(abs.col as usize) else {
                    continue;
                };
                match ch {
                    '#' => perception.obstacles.push(offset),
                    'G' => perception.goals.push(offset),
                    c if c.is_ascii_lowercase() => perception.dispensers.push(DispenserSighting {
                        offset,
                        kind: format!("b{c}"),
                    }),
                    _ => {}
                }
            }
        }
        perception
    }

    const WORLD: &[&str] = &[
        "##########",
        "#........#",
        "#..a.....#",
        "#........#",
        "#....GG..#",
        "#....GG..#",
        "#........#",
        "##########",
    ];

    #[test]
    fn matrix_grows_and_origin_follows() {
        let mut grid = GridKnowledge::new("agentA1", 2);
        assert_eq!(grid.origin(), Position::new(2, 2));
        let start = Position::new(3, 3);
        grid.update_map(&perceive(WORLD, start, Position::new(0, 0), 2));
        let before = grid.to_matrix(Position::new(0, 0));
        assert_eq!(grid.cell_at(Position::new(-1, 0)), Cell::Dispenser);
        grid.update_map(&perceive(WORLD, start, Position::new(0, -2), 2));
        // Relative cells keep their content after the matrix grew leftwards.
        assert_eq!(grid.cell_at(Position::new(-1, 0)), Cell::Dispenser);
        assert_ne!(grid.to_matrix(Position::new(0, 0)), before);
        assert_eq!(grid.cell_at(Position::new(0, -3)), Cell::Obstacle);
    }

    #[test]
    fn goal_discovery_requires_closed_boundary() {
        let start = Position::new(2, 3);
        let mut grid = GridKnowledge::new("agentA1", 2);
        grid.update_map(&perceive(WORLD, start, Position::new(0, 0), 2));
        assert!(!grid.goal_area_fully_discovered());
        assert_eq!(grid.landmark(), None);

        grid.update_map(&perceive(WORLD, start, Position::new(2, 2), 4));
        assert!(grid.goal_area_fully_discovered());
        let landmark = grid.landmark().expect("landmark");
        assert_eq!(grid.to_relative(landmark), Position::new(2, 2));
    }

    #[test]
    fn direction_to_nearest_dispenser_moves_closer() {
        let start = Position::new(4, 3);
        let mut grid = GridKnowledge::new("agentA1", 4);
        grid.update_map(&perceive(WORLD, start, Position::new(0, 0), 4));
        // Dispenser `a` is two rows up from the start.
        assert_eq!(grid.direction_to_nearest_dispenser("ba"), Some(Direction::N));
        assert_eq!(grid.direction_to_nearest_dispenser("bz"), None);
    }

    #[test]
    fn agent_on_dispenser_heads_for_landmark() {
        let start = Position::new(2, 3);
        let mut grid = GridKnowledge::new("agentA1", 8);
        grid.update_map(&perceive(WORLD, start, Position::new(0, 0), 8));
        assert_eq!(grid.dispenser_here(), Some("ba"));
        let step = grid.direction_to_landmark().expect("route to goal");
        assert!(matches!(step, Direction::E | Direction::S));
    }

    #[test]
    fn matrix_bytes_reject_bad_shape() {
        let matrix = CellMatrix::new(2, 3);
        let bytes = matrix.to_bytes();
        assert!(CellMatrix::from_bytes(3, 3, &bytes).is_err());
        assert!(CellMatrix::from_bytes(0, 6, &bytes).is_err());
        assert_eq!(CellMatrix::from_bytes(2, 3, &bytes).expect("decode"), matrix);
        assert!(CellMatrix::from_bytes(1, 1, &[9]).is_err());
    }
}
