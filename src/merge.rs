//! Fusion of two agents' occupancy matrices around a shared landmark.
//!
//! Cells combine with [`Cell::join`], which keeps the more informative
//! observation. `join` is commutative, associative and idempotent, so pairwise
//! merges in any order converge to the same picture and re-merging an
//! already merged map changes nothing.

use crate::grid::{Cell, CellMatrix};
use crate::types::Position;

/// Overlay `remote` onto `local` so that `remote_landmark` lands on
/// `local_landmark`.
///
/// The merged matrix is the bounding box of both maps; `merged_origin` is
/// `local_origin` shifted by whatever rows/columns were added above and to the
/// left of the local map. Callers validate shapes and landmarks beforehand.
pub fn merge(
    local: &CellMatrix,
    remote: &CellMatrix,
    local_landmark: Position,
    remote_landmark: Position,
    local_origin: Position,
) -> (CellMatrix, Position) {
    let translation = local_landmark - remote_landmark;

    let top = translation.row.min(0);
    let left = translation.col.min(0);
    let bottom = (local.rows() as i32).max(remote.rows() as i32 + translation.row);
    let right = (local.cols() as i32).max(remote.cols() as i32 + translation.col);
    let shift = Position::new(-top, -left);

    let mut merged = CellMatrix::new((bottom - top) as usize, (right - left) as usize);
    for (pos, cell) in local.iter() {
        merged.join(pos + shift, cell);
    }
    for (pos, cell) in remote.iter() {
        if cell != Cell::Unknown {
            merged.join(pos + translation + shift, cell);
        }
    }

    (merged, local_origin + shift)
}
