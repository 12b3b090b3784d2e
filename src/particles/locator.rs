//! Local point location: find the locally owned cell containing a point.
//!
//! The search tries, in order, the hinted cell, its vertex neighbors and then
//! every local cell. Only the oracle decides membership, so a stale or
//! foreign hint costs time but never produces a wrong answer.

use crate::geometry::GeometryOracle;
use crate::topology::cell::CellRef;

/// Outcome of a local search. Missing every local cell is a normal outcome
/// (the particle belongs to another rank), not an error.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Location<const D: usize> {
    Found { cell: CellRef, reference: [f64; D] },
    NotFoundLocally,
}

impl<const D: usize> Location<D> {
    pub fn cell(&self) -> Option<CellRef> {
        match self {
            Location::Found { cell, .. } => Some(*cell),
            Location::NotFoundLocally => None,
        }
    }
}

/// What the locator needs from a mesh besides the geometry oracle.
pub trait CellSearchSpace<const D: usize>: GeometryOracle<D> {
    fn is_local(&self, cell: CellRef) -> bool;
    /// Local cells sharing a vertex with `cell`, ascending.
    fn neighbors(&self, cell: CellRef) -> &[CellRef];
    /// All local cells, ascending.
    fn local_cells(&self) -> impl Iterator<Item = CellRef> + '_;
}

#[derive(Copy, Clone, Debug)]
pub struct CellLocator<'m, M> {
    mesh: &'m M,
    neighbors_first: bool,
}

impl<'m, M> CellLocator<'m, M> {
    pub fn new(mesh: &'m M, neighbors_first: bool) -> Self {
        Self {
            mesh,
            neighbors_first,
        }
    }
}

impl<M> CellLocator<'_, M> {
    /// Locate `point`, starting from `hint` when it names a local cell.
    /// Deterministic: candidates are tried in ascending order, so equal input
    /// gives the same cell.
    pub fn locate<const D: usize>(&self, point: &[f64; D], hint: Option<CellRef>) -> Location<D>
    where
        M: CellSearchSpace<D>,
    {
        let hint = hint.filter(|&c| self.mesh.is_local(c));
        if let Some(cell) = hint {
            if let Some(found) = self.try_cell(cell, point) {
                return found;
            }
            if self.neighbors_first {
                for &n in self.mesh.neighbors(cell) {
                    if let Some(found) = self.try_cell(n, point) {
                        return found;
                    }
                }
            }
        }
        let tried = |c: CellRef| {
            hint.is_some_and(|h| {
                c == h || (self.neighbors_first && self.mesh.neighbors(h).binary_search(&c).is_ok())
            })
        };
        self.mesh
            .local_cells()
            .filter(|&c| !tried(c))
            .find_map(|c| self.try_cell(c, point))
            .unwrap_or(Location::NotFoundLocally)
    }

    fn try_cell<const D: usize>(&self, cell: CellRef, point: &[f64; D]) -> Option<Location<D>>
    where
        M: CellSearchSpace<D>,
    {
        self.mesh
            .to_reference(cell, point)
            .map(|reference| Location::Found { cell, reference })
    }
}
