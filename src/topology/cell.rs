//! `CellRef`: an ephemeral handle naming a cell in one rank's mesh view.
//!
//! A `CellRef` is `(level, index)` where `index` counts the locally owned
//! cells of that refinement level in the current mesh instance. It is *not*
//! stable across a checkpoint, a reload, or a repartition: the same geometric
//! cell can receive another index, and the same index can name another cell.
//! Never persist it; re-derive membership from geometry instead.

use std::fmt;

#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct CellRef {
    pub level: u8,
    pub index: u32,
}

impl CellRef {
    #[inline]
    pub const fn new(level: u8, index: u32) -> Self {
        Self { level, index }
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef({}.{})", self.level, self.index)
    }
}

/// Prints `level.index`, the usual way cells are reported in logs.
impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.level, self.index)
    }
}
