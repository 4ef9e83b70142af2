//! Turns local map knowledge into a comparable bid.
//!
//! The cost of a subtask is the walk from the agent to the closest known
//! dispenser of the required kind plus the shortest path from that dispenser
//! to the goal landmark.

use tracing::trace;

use crate::auction::BidValue;
use crate::grid::GridKnowledge;
use crate::path::{self, DistanceField};
use crate::types::Position;

/// Estimate the cost for the agent at `agent_position` (relative frame) to
/// fetch a block of `kind` and bring it to the goal area.
///
/// Returns `BidValue::Invalid` when the goal area is not fully discovered,
/// when no dispenser of `kind` is reachable, or when the chosen dispenser has
/// no path to the landmark. Equally distant dispensers are tried in row-major
/// order of their matrix position; only the first is searched.
pub fn estimate(grid: &GridKnowledge, kind: &str, agent_position: Position) -> BidValue {
    let Some(landmark) = grid.landmark() else {
        return BidValue::Invalid;
    };

    let source = grid.to_matrix(agent_position);
    let fresh;
    let field = match grid.distance_field() {
        Some(field) if field.source() == source => field,
        _ => {
            fresh = DistanceField::compute(grid.matrix(), source);
            &fresh
        }
    };

    let closest = grid
        .dispensers()
        .filter(|&(_, k)| k == kind)
        .filter_map(|(pos, _)| field.distance(pos).map(|d| (d, pos)))
        .min();
    let Some((to_dispenser, dispenser)) = closest else {
        trace!(agent = grid.agent(), kind, "no reachable dispenser");
        return BidValue::Invalid;
    };

    match path::find_path(grid.matrix(), dispenser, landmark) {
        Some(route) => {
            let to_goal = (route.len() - 1) as u32;
            trace!(
                agent = grid.agent(),
                kind,
                to_dispenser,
                to_goal,
                "estimated subtask cost"
            );
            BidValue::Valid(to_dispenser + to_goal)
        }
        None => BidValue::Invalid,
    }
}
