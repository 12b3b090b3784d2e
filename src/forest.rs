//! Quad/oct-tree forest over a box domain.
//!
//! Leaves are addressed by [`TreeCell`] (refinement level + integer
//! coordinates at that level). Unlike a [`CellRef`](crate::topology::cell::CellRef),
//! a `TreeCell` is a stable, global key: it survives checkpoints and
//! repartitioning, which is what lets the mesh carry per-cell attachments
//! from one partition layout to another.

use crate::geometry::Aabb;
use std::collections::HashSet;

/// Deepest refinement level supported; keeps `D * level` Morton bits within
/// a `u64` for `D <= 3`.
pub const MAX_LEVEL: u8 = 21;

/// A cell in a quadtree/octree forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeCell<const D: usize> {
    /// Refinement level (0 is root).
    pub level: u8,
    /// Integer coordinates at the given level.
    pub coords: [u32; D],
}

impl<const D: usize> TreeCell<D> {
    pub const ROOT: Self = Self {
        level: 0,
        coords: [0; D],
    };

    /// Returns the parent cell, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            None
        } else {
            let mut coords = self.coords;
            for coord in &mut coords {
                *coord /= 2;
            }
            Some(Self {
                level: self.level - 1,
                coords,
            })
        }
    }

    /// Returns the `2^D` children of this cell.
    pub fn children(&self) -> Vec<Self> {
        let count = 1usize << D;
        let mut children = Vec::with_capacity(count);
        for idx in 0..count {
            let mut coords = [0u32; D];
            for axis in 0..D {
                let bit = (idx >> axis) & 1;
                coords[axis] = self.coords[axis] * 2 + bit as u32;
            }
            children.push(Self {
                level: self.level + 1,
                coords,
            });
        }
        children
    }

    /// True if the coordinates fit the grid of this level.
    pub fn is_valid(&self) -> bool {
        self.level <= MAX_LEVEL && self.coords.iter().all(|&c| u64::from(c) < 1u64 << self.level)
    }

    /// Lower corner on the grid of level `fine` (which must be `>= level`).
    pub fn anchor_at(&self, fine: u8) -> [u64; D] {
        let shift = fine - self.level;
        self.coords.map(|c| u64::from(c) << shift)
    }

    /// Z-order key of the lower corner, evaluated at [`MAX_LEVEL`]. Axis
    /// `D - 1` is the most significant within each bit plane.
    pub fn morton_key(&self) -> u64 {
        let anchor = self.anchor_at(MAX_LEVEL);
        let mut key = 0u64;
        for bit in (0..MAX_LEVEL).rev() {
            for axis in (0..D).rev() {
                key = (key << 1) | ((anchor[axis] >> bit) & 1);
            }
        }
        key
    }

    /// The cell's box inside `domain`.
    pub fn bounds(&self, domain: &Aabb<D>) -> Aabb<D> {
        let n = f64::from(1u32 << self.level);
        let mut lo = [0.0; D];
        let mut hi = [0.0; D];
        for k in 0..D {
            let h = domain.extent(k) / n;
            lo[k] = domain.lo[k] + f64::from(self.coords[k]) * h;
            hi[k] = if self.coords[k] + 1 == 1u32 << self.level {
                domain.hi[k]
            } else {
                domain.lo[k] + f64::from(self.coords[k] + 1) * h
            };
        }
        Aabb { lo, hi }
    }

    /// The `2^D` corner vertices on the grid of level `fine`.
    pub fn corners_at(&self, fine: u8) -> Vec<[u64; D]> {
        let anchor = self.anchor_at(fine);
        let width = 1u64 << (fine - self.level);
        (0..1usize << D)
            .map(|idx| {
                let mut v = anchor;
                for (axis, x) in v.iter_mut().enumerate() {
                    *x += ((idx >> axis) & 1) as u64 * width;
                }
                v
            })
            .collect()
    }
}

/// Forest representation for quadtrees (`D = 2`) or octrees (`D = 3`); `D = 1`
/// gives a binary tree of segments.
#[derive(Debug, Clone)]
pub struct Forest<const D: usize> {
    leaves: HashSet<TreeCell<D>>,
}

/// A quadtree forest (`D = 2`).
pub type QuadForest = Forest<2>;
/// An octree forest (`D = 3`).
pub type OctForest = Forest<3>;

impl<const D: usize> Default for Forest<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize> Forest<D> {
    /// Create a new forest with a single root cell.
    pub fn new() -> Self {
        let mut leaves = HashSet::new();
        leaves.insert(TreeCell::ROOT);
        Self { leaves }
    }

    /// Root refined `levels` times everywhere.
    pub fn uniform(levels: u8) -> Self {
        let mut forest = Self::new();
        for _ in 0..levels.min(MAX_LEVEL) {
            forest.refine_global();
        }
        forest
    }

    /// Rebuild a forest from a leaf set (e.g. read back from a checkpoint).
    /// Returns `None` unless the leaves are valid and tile the root exactly.
    pub fn from_leaves<I>(leaves: I) -> Option<Self>
    where
        I: IntoIterator<Item = TreeCell<D>>,
    {
        let leaves: HashSet<_> = leaves.into_iter().collect();
        if leaves.is_empty() || !leaves.iter().all(TreeCell::is_valid) {
            return None;
        }
        let max = leaves.iter().map(|c| c.level).max().unwrap_or(0);
        let volume: u128 = leaves
            .iter()
            .map(|c| 1u128 << (D as u32 * u32::from(max - c.level)))
            .sum();
        let overlaps = leaves
            .iter()
            .any(|c| std::iter::successors(c.parent(), TreeCell::parent).any(|a| leaves.contains(&a)));
        (volume == 1u128 << (D as u32 * u32::from(max)) && !overlaps).then_some(Self { leaves })
    }

    /// Return an iterator over leaf cells.
    pub fn leaves(&self) -> impl Iterator<Item = &TreeCell<D>> {
        self.leaves.iter()
    }

    /// Return the number of leaf cells.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Leaves in space-filling-curve order.
    pub fn morton_sorted_leaves(&self) -> Vec<TreeCell<D>> {
        let mut out: Vec<_> = self.leaves.iter().copied().collect();
        out.sort_unstable_by_key(|c| (c.morton_key(), c.level));
        out
    }

    /// Refine every leaf once.
    pub fn refine_global(&mut self) -> usize {
        let all: Vec<_> = self.leaves.iter().copied().collect();
        self.refine_cells(&all)
    }

    /// Refine all leaf cells whose indicator exceeds the threshold.
    pub fn refine_by_indicator<F>(&mut self, indicator: F, threshold: f64) -> usize
    where
        F: Fn(&TreeCell<D>) -> f64,
    {
        let to_refine: Vec<_> = self
            .leaves
            .iter()
            .copied()
            .filter(|cell| indicator(cell) > threshold)
            .collect();
        self.refine_cells(&to_refine)
    }

    pub fn max_level(&self) -> u8 {
        self.leaves.iter().map(|cell| cell.level).max().unwrap_or(0)
    }

    fn refine_cells(&mut self, cells: &[TreeCell<D>]) -> usize {
        let mut refined = 0;
        for cell in cells {
            if cell.level < MAX_LEVEL && self.leaves.remove(cell) {
                for child in cell.children() {
                    self.leaves.insert(child);
                }
                refined += 1;
            }
        }
        refined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_refinement_counts() {
        assert_eq!(Forest::<1>::uniform(3).leaf_count(), 8);
        assert_eq!(QuadForest::uniform(2).leaf_count(), 16);
        assert_eq!(OctForest::uniform(2).leaf_count(), 64);
    }

    #[test]
    fn morton_order_splits_on_top_axis_first() {
        let leaves = QuadForest::uniform(2).morton_sorted_leaves();
        // First half of the curve is the lower half in y.
        assert!(leaves[..8].iter().all(|c| c.coords[1] < 2));
        assert!(leaves[8..].iter().all(|c| c.coords[1] >= 2));
        assert_eq!(leaves[0].coords, [0, 0]);
        assert_eq!(leaves[1].coords, [1, 0]);
        assert_eq!(leaves[2].coords, [0, 1]);
    }

    #[test]
    fn bounds_tile_the_domain() {
        let domain = Aabb::new([-1.0, 0.0], [1.0, 3.0]);
        let cell = TreeCell {
            level: 1,
            coords: [1, 1],
        };
        let b = cell.bounds(&domain);
        assert_eq!(b, Aabb::new([0.0, 1.5], [1.0, 3.0]));
    }

    #[test]
    fn indicator_refinement_and_reconstruction() {
        let mut f = QuadForest::uniform(1);
        let n = f.refine_by_indicator(|c| if c.coords == [0, 0] { 1.0 } else { 0.0 }, 0.5);
        assert_eq!(n, 1);
        assert_eq!(f.leaf_count(), 7);
        assert_eq!(f.max_level(), 2);
        let again = QuadForest::from_leaves(f.leaves().copied()).expect("valid tiling");
        assert_eq!(again.leaf_count(), 7);
    }

    #[test]
    fn from_leaves_rejects_gaps_and_overlaps() {
        let mut leaves = QuadForest::uniform(1).morton_sorted_leaves();
        leaves.pop();
        assert!(QuadForest::from_leaves(leaves.clone()).is_none());
        leaves.push(TreeCell::ROOT);
        assert!(QuadForest::from_leaves(leaves).is_none());
    }

    #[test]
    fn corners_on_finer_grid() {
        let c = TreeCell::<2> {
            level: 1,
            coords: [1, 0],
        };
        let corners = c.corners_at(2);
        assert_eq!(corners, vec![[2, 0], [4, 0], [2, 2], [4, 2]]);
    }
}
