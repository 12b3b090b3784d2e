//! Distributed quad/oct-tree mesh: each rank owns a contiguous chunk of the
//! Morton-ordered leaves of a [`Forest`].
//!
//! The mesh is the collaborator the particle layers query: it answers which
//! cells are local, which cells touch which, whether a point lies in a cell,
//! and which ranks might own a point. It also carries per-cell attachments
//! through a checkpoint (see [`checkpoint`]).

pub mod attachment;
pub mod checkpoint;
pub mod subdomain_index;

use crate::algs::communicator::Communicator;
use crate::forest::{Forest, TreeCell};
use crate::geometry::cartesian::{box_contains, box_to_reference, embed, project_to_plane};
use crate::geometry::{Aabb, GeometryOracle};
use crate::particle_error::ParticleError;
use crate::particles::locator::CellSearchSpace;
use crate::topology::cell::CellRef;
use attachment::{Attachment, AttachmentHandle, AttachmentRegistry};
use bytes::Bytes;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
pub use subdomain_index::SubdomainIndex;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Where the mesh stands in a checkpoint cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointPhase {
    Open,
    Saved(String),
    Loaded(String),
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointPhase::Open => f.write_str("Open"),
            CheckpointPhase::Saved(tag) => write!(f, "Saved({tag})"),
            CheckpointPhase::Loaded(tag) => write!(f, "Loaded({tag})"),
        }
    }
}

#[derive(Clone, Debug)]
struct LocalCell<const D: usize> {
    tree: TreeCell<D>,
    bounds: Aabb<D>,
}

/// Contiguous share of `n` items for `rank` out of `parts`; the first
/// `n % parts` ranks get one extra.
pub fn chunk_range(n: usize, parts: usize, rank: usize) -> Range<usize> {
    let parts = parts.max(1);
    let base = n / parts;
    let rem = n % parts;
    let start = rank * base + rank.min(rem);
    let len = base + usize::from(rank < rem);
    start.min(n)..(start + len).min(n)
}

/// One rank's view of a partitioned forest mesh.
///
/// `D` is the dimension of the tree cells and `S` the dimension of the space
/// particles live in. With `S > D` the mesh is a flat sheet: its cells lie in
/// the hyperplane `x_k = 0` for every `k >= D`, and only points on that plane
/// can be located in it.
#[derive(Clone, Debug)]
pub struct PartitionedMesh<const D: usize, const S: usize = D> {
    domain: Aabb<D>,
    rank: usize,
    n_ranks: usize,
    generation: u64,
    /// Sorted by `(level, morton key)`.
    cells: Vec<LocalCell<D>>,
    /// `level_offsets[l]..level_offsets[l + 1]` are the cells of level `l`.
    level_offsets: Vec<usize>,
    lookup: HashMap<TreeCell<D>, usize>,
    neighbors: Vec<Vec<CellRef>>,
    subdomain: Option<Aabb<D>>,
    index: SubdomainIndex<D>,
    attachments: AttachmentRegistry,
    phase: CheckpointPhase,
    save_epoch: u64,
}

impl<const D: usize, const S: usize> PartitionedMesh<D, S> {
    /// Collective: `domain` refined uniformly `refinements` times and split
    /// over `comm`.
    pub fn hyper_cube<C>(domain: Aabb<D>, refinements: u8, comm: &C) -> Result<Self, ParticleError>
    where
        C: Communicator + ?Sized,
    {
        Self::from_forest(domain, &Forest::uniform(refinements), comm)
    }

    /// Collective: partition the leaves of `forest` over `comm`. Every rank
    /// must pass the same forest.
    pub fn from_forest<C>(domain: Aabb<D>, forest: &Forest<D>, comm: &C) -> Result<Self, ParticleError>
    where
        C: Communicator + ?Sized,
    {
        let leaves = forest.morton_sorted_leaves();
        let range = chunk_range(leaves.len(), comm.size(), comm.rank());
        let mut mesh = Self::empty(domain, comm);
        mesh.assemble(leaves[range].to_vec(), comm)?;
        Ok(mesh)
    }

    /// A mesh without cells, ready for [`load`](Self::load). Not collective.
    pub fn empty<C: Communicator + ?Sized>(domain: Aabb<D>, comm: &C) -> Self {
        const { assert!(D <= S, "mesh dimension exceeds space dimension") };
        Self {
            domain,
            rank: comm.rank(),
            n_ranks: comm.size(),
            generation: next_generation(),
            cells: Vec::new(),
            level_offsets: vec![0],
            lookup: HashMap::new(),
            neighbors: Vec::new(),
            subdomain: None,
            index: SubdomainIndex::default(),
            attachments: AttachmentRegistry::default(),
            phase: CheckpointPhase::Open,
            save_epoch: 0,
        }
    }

    /// Collective: install `local` as this rank's cells and rebuild every
    /// derived structure.
    fn assemble<C>(&mut self, mut local: Vec<TreeCell<D>>, comm: &C) -> Result<(), ParticleError>
    where
        C: Communicator + ?Sized,
    {
        local.sort_unstable_by_key(|c| (c.level, c.morton_key()));
        let max_level = local.last().map_or(0, |c| c.level);
        self.level_offsets = (0..=usize::from(max_level) + 1)
            .map(|l| local.partition_point(|c| usize::from(c.level) < l))
            .collect();
        self.cells = local
            .iter()
            .map(|&tree| LocalCell {
                tree,
                bounds: tree.bounds(&self.domain),
            })
            .collect();
        self.lookup = local.iter().enumerate().map(|(slot, &c)| (c, slot)).collect();
        self.rank = comm.rank();
        self.n_ranks = comm.size();
        self.generation = next_generation();
        self.build_neighbors(max_level);
        self.subdomain = self
            .cells
            .iter()
            .map(|c| c.bounds)
            .reduce(|a, b| a.union(&b));
        self.index = SubdomainIndex::gather(self.subdomain.as_ref(), comm)?;
        log::debug!(
            "[mesh] rank {} owns {} cells (generation {})",
            self.rank,
            self.cells.len(),
            self.generation
        );
        Ok(())
    }

    fn build_neighbors(&mut self, fine: u8) {
        let mut by_vertex: HashMap<[u64; D], Vec<usize>> = HashMap::new();
        for (slot, cell) in self.cells.iter().enumerate() {
            for v in cell.tree.corners_at(fine) {
                by_vertex.entry(v).or_default().push(slot);
            }
        }
        self.neighbors = self
            .cells
            .iter()
            .enumerate()
            .map(|(slot, cell)| {
                cell.tree
                    .corners_at(fine)
                    .iter()
                    .filter_map(|v| by_vertex.get(v))
                    .flatten()
                    .copied()
                    .filter(|&other| other != slot)
                    .sorted_unstable()
                    .dedup()
                    .map(|s| self.cell_ref(s))
                    .collect()
            })
            .collect();
    }

    fn slot(&self, cell: CellRef) -> Option<usize> {
        let level = usize::from(cell.level);
        let start = *self.level_offsets.get(level)?;
        let end = *self.level_offsets.get(level + 1)?;
        let slot = start + cell.index as usize;
        (slot < end).then_some(slot)
    }

    fn cell_ref(&self, slot: usize) -> CellRef {
        let level = self.cells[slot].tree.level;
        CellRef::new(level, (slot - self.level_offsets[usize::from(level)]) as u32)
    }

    pub fn domain(&self) -> &Aabb<D> {
        &self.domain
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    /// Unique per mesh instance; changes on every build, load and clear.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn n_local_cells(&self) -> usize {
        self.cells.len()
    }

    /// Locally owned cells in ascending [`CellRef`] order.
    pub fn local_cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        (0..self.cells.len()).map(|slot| self.cell_ref(slot))
    }

    pub fn is_local(&self, cell: CellRef) -> bool {
        self.slot(cell).is_some()
    }

    pub fn cell_bounds(&self, cell: CellRef) -> Option<&Aabb<D>> {
        self.slot(cell).map(|s| &self.cells[s].bounds)
    }

    /// The forest leaf behind `cell`; unlike the [`CellRef`] it means the
    /// same thing on every rank.
    pub fn tree_cell(&self, cell: CellRef) -> Option<TreeCell<D>> {
        self.slot(cell).map(|s| self.cells[s].tree)
    }

    /// The local handle of a forest leaf, if this rank owns it.
    pub fn cell_of(&self, tree: &TreeCell<D>) -> Option<CellRef> {
        self.lookup.get(tree).map(|&s| self.cell_ref(s))
    }

    /// Local cells sharing at least one vertex with `cell`, ascending.
    pub fn neighbors(&self, cell: CellRef) -> &[CellRef] {
        self.slot(cell)
            .map_or(&[][..], |s| self.neighbors[s].as_slice())
    }

    /// Bounding box of all locally owned cells.
    pub fn subdomain_bounds(&self) -> Option<&Aabb<D>> {
        self.subdomain.as_ref()
    }

    pub fn subdomain_index(&self) -> &SubdomainIndex<D> {
        &self.index
    }

    /// Ranks whose subdomain may contain `point`, ascending. Empty for
    /// points off the plane of a flat mesh.
    pub fn candidate_ranks(&self, point: &[f64; S]) -> Vec<usize> {
        project_to_plane::<D, S>(point).map_or_else(Vec::new, |p| self.index.candidate_ranks(&p))
    }

    pub fn phase(&self) -> &CheckpointPhase {
        &self.phase
    }

    /// Bumped by every successful [`save`](Self::save).
    pub fn save_epoch(&self) -> u64 {
        self.save_epoch
    }

    /// Drop all cells and attachments; the mesh must be rebuilt or loaded.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.level_offsets = vec![0];
        self.lookup.clear();
        self.neighbors.clear();
        self.subdomain = None;
        self.index = SubdomainIndex::default();
        self.attachments.clear();
        self.phase = CheckpointPhase::Open;
        self.generation = next_generation();
    }

    /// True when no cells are present (fresh after [`clear`](Self::clear)).
    pub fn is_cleared(&self) -> bool {
        self.cells.is_empty() && self.index.n_ranks() == 0
    }

    /// Register per-cell data to be written with the next checkpoint.
    /// `size_of` gives the exact byte count each local cell will receive.
    /// Data surviving from a previous load is released first.
    pub fn register_attachment<F>(&mut self, mut size_of: F) -> AttachmentHandle
    where
        F: FnMut(CellRef) -> usize,
    {
        if matches!(self.phase, CheckpointPhase::Loaded(_)) {
            self.attachments.clear();
            self.phase = CheckpointPhase::Open;
        }
        let sizes = (0..self.cells.len())
            .map(|slot| size_of(self.cell_ref(slot)))
            .collect();
        self.attachments.push(Attachment::registered(sizes))
    }

    pub fn fill_attachment(
        &mut self,
        handle: AttachmentHandle,
        cell: CellRef,
        bytes: Bytes,
    ) -> Result<(), ParticleError> {
        let slot = self.slot(cell).ok_or(ParticleError::CellNotLocal(cell))?;
        let attachment = self.attachments.get_mut(handle).ok_or_else(|| {
            ParticleError::MeshCheckpoint(format!("attachment {} is not registered", handle.get()))
        })?;
        let expected = attachment.expected(slot).ok_or_else(|| {
            ParticleError::MeshCheckpoint(format!(
                "attachment {} was loaded, not registered; it cannot be filled",
                handle.get()
            ))
        })?;
        if bytes.len() != expected {
            return Err(ParticleError::AttachmentSizeMismatch {
                cell,
                expected,
                found: bytes.len(),
            });
        }
        attachment.set(slot, bytes);
        Ok(())
    }

    /// Bytes stored for `cell` under `handle`; present after a load.
    pub fn read_attachment(&self, handle: AttachmentHandle, cell: CellRef) -> Option<&[u8]> {
        let slot = self.slot(cell)?;
        self.attachments
            .get(handle)
            .and_then(|a| a.get(slot))
            .map(|b| b.as_ref())
    }

    pub fn n_attachments(&self) -> usize {
        self.attachments.len()
    }
}

impl<const D: usize, const S: usize> GeometryOracle<S> for PartitionedMesh<D, S> {
    fn contains(&self, cell: CellRef, point: &[f64; S]) -> bool {
        match (self.cell_bounds(cell), project_to_plane::<D, S>(point)) {
            (Some(b), Some(p)) => box_contains(b, &self.domain, &p),
            _ => false,
        }
    }

    /// Axes beyond `D` map to reference coordinate zero.
    fn to_reference(&self, cell: CellRef, point: &[f64; S]) -> Option<[f64; S]> {
        let b = self.cell_bounds(cell)?;
        let p = project_to_plane::<D, S>(point)?;
        box_contains(b, &self.domain, &p).then(|| embed(&box_to_reference(b, &p)))
    }
}

impl<const D: usize, const S: usize> CellSearchSpace<S> for PartitionedMesh<D, S> {
    fn is_local(&self, cell: CellRef) -> bool {
        PartitionedMesh::is_local(self, cell)
    }

    fn neighbors(&self, cell: CellRef) -> &[CellRef] {
        PartitionedMesh::neighbors(self, cell)
    }

    fn local_cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        PartitionedMesh::local_cells(self)
    }
}
