//! `ParticleHandler`: the public face of the particle layers.
//!
//! Owns the rank-local store and drives the locator, the router and the
//! checkpoint codec against a [`PartitionedMesh`]. Every operation checks the
//! handler state first; the checkpoint cycle must run in this order:
//!
//! ```text
//! sort ─► prepare_for_serialization ─► serialize ─► mesh.save ─► sort ...
//! deserialize ─► mesh.load ─► restore_from_mesh
//! ```
//!
//! A run keeps going after a checkpoint: once the mesh has been saved, the
//! next `sort` starts a new cycle. Out-of-order calls fail with
//! [`ParticleError::CheckpointOrderViolation`] before anything is touched.
//!
//! The mesh may be flat (`PartitionedMesh<M, D>` with `M < D`); particles
//! always carry `D` coordinates.

use super::codec::{ArchiveHeader, cell_attachment_size, pack_cell, unpack_cell};
use super::config::{ParticleHandlerConfig, RestorePolicy};
use super::particle::{Particle, ParticleId};
use super::router::{RouterOptions, SortReport, find_global_duplicates, sort_particles};
use super::store::ParticleStore;
use crate::algs::communicator::Communicator;
use crate::algs::exchange::agree;
use crate::algs::wire::RecordLayout;
use crate::debug_invariants::DebugInvariants;
use crate::geometry::GeometryOracle;
use crate::mesh::attachment::AttachmentHandle;
use crate::mesh::{CheckpointPhase, PartitionedMesh};
use crate::particle_error::ParticleError;
use crate::topology::cell::CellRef;
use bytes::Bytes;
use std::fmt;

/// Lifecycle of a handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandlerState {
    Empty,
    /// Particles present, cell associations not validated.
    Populated,
    /// Every particle sits in the local cell that contains it.
    Sorted,
    PreparedForCheckpoint,
    /// The snapshot lives in the mesh attachments. Particles may change, but
    /// the next sort waits for the mesh to be saved.
    Serialized,
    /// Archive read, waiting for the mesh to be reloaded.
    Restoring,
    /// A collective failed part-way; only `clear` is accepted.
    Poisoned,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Borrowed view of one particle as yielded by [`ParticleHandler::iter`].
#[derive(Copy, Clone, Debug)]
pub struct ParticleRef<'a, const D: usize> {
    pub id: ParticleId,
    pub position: &'a [f64; D],
    pub reference_position: &'a [f64; D],
    /// `None` until the particle has been sorted.
    pub cell: Option<CellRef>,
    pub properties: &'a Bytes,
}

#[derive(Clone, Debug)]
struct Pending {
    handle: AttachmentHandle,
    mesh_generation: u64,
}

/// Mesh instance and save epoch a serialized snapshot is waiting on.
#[derive(Copy, Clone, Debug)]
struct AwaitingSave {
    mesh_generation: u64,
    save_epoch: u64,
}

#[derive(Clone, Debug)]
struct Restore {
    header: ArchiveHeader,
    mesh_generation: u64,
}

/// Rank-local particle container with distributed sort and checkpointing.
#[derive(Clone, Debug)]
pub struct ParticleHandler<const D: usize> {
    config: ParticleHandlerConfig,
    store: ParticleStore<D>,
    state: HandlerState,
    /// Mesh the recorded cells refer to.
    mesh_generation: Option<u64>,
    /// Mesh save epoch observed at the last sort.
    save_epoch: u64,
    pending: Option<Pending>,
    awaiting_save: Option<AwaitingSave>,
    restore: Option<Restore>,
}

impl<const D: usize> Default for ParticleHandler<D> {
    fn default() -> Self {
        Self::new(ParticleHandlerConfig::default())
    }
}

impl<const D: usize> ParticleHandler<D> {
    pub fn new(config: ParticleHandlerConfig) -> Self {
        Self {
            config,
            store: ParticleStore::new(),
            state: HandlerState::Empty,
            mesh_generation: None,
            save_epoch: 0,
            pending: None,
            awaiting_save: None,
            restore: None,
        }
    }

    pub fn config(&self) -> &ParticleHandlerConfig {
        &self.config
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    fn router_options(&self) -> RouterOptions {
        RouterOptions {
            payload_size: self.config.payload_size,
            check_unique: self.config.check_unique_on_sort,
            neighbors_first: self.config.search_neighbors_first,
        }
    }

    /// Guard for operations that add, move or remove particles.
    fn ensure_mutable(&self, operation: &'static str) -> Result<(), ParticleError> {
        match self.state {
            HandlerState::Empty
            | HandlerState::Populated
            | HandlerState::Sorted
            | HandlerState::Serialized => Ok(()),
            HandlerState::Poisoned => Err(ParticleError::Poisoned),
            other => Err(ParticleError::order(operation, other)),
        }
    }

    /// Guard for starting a new checkpoint cycle: a serialized snapshot must
    /// have been saved with its mesh first.
    fn ensure_saved<const M: usize>(
        &mut self,
        mesh: &PartitionedMesh<M, D>,
        operation: &'static str,
    ) -> Result<(), ParticleError> {
        match self.awaiting_save {
            Some(w) if w.mesh_generation == mesh.generation() && mesh.save_epoch() <= w.save_epoch => {
                Err(ParticleError::order(
                    operation,
                    format!("{} with mesh {} not saved since serialize", self.state, mesh.phase()),
                ))
            }
            _ => {
                self.awaiting_save = None;
                Ok(())
            }
        }
    }

    fn touched(&mut self) {
        self.state = if self.store.is_empty() {
            HandlerState::Empty
        } else {
            HandlerState::Populated
        };
    }

    fn check_payload(&self, particle: &Particle<D>) -> Result<(), ParticleError> {
        let found = particle.properties().len();
        if found != self.config.payload_size {
            return Err(ParticleError::PayloadSizeMismatch {
                id: particle.id(),
                expected: self.config.payload_size,
                found,
            });
        }
        Ok(())
    }

    /// Insert on this rank. `hint` is a guess at the containing cell; it is
    /// validated by the next [`sort`](Self::sort). Duplicates are only
    /// detected among this rank's particles.
    pub fn insert_particle(&mut self, particle: Particle<D>, hint: Option<CellRef>) -> Result<(), ParticleError> {
        self.ensure_mutable("insert_particle")?;
        self.check_payload(&particle)?;
        self.store.insert(particle, hint)?;
        self.touched();
        Ok(())
    }

    /// Insert several particles sharing one hint; stops at the first error.
    pub fn insert_particles<I>(&mut self, particles: I, hint: Option<CellRef>) -> Result<(), ParticleError>
    where
        I: IntoIterator<Item = Particle<D>>,
    {
        for p in particles {
            self.insert_particle(p, hint)?;
        }
        Ok(())
    }

    /// Collective: insert a batch that may contain particles of any rank,
    /// check identifier uniqueness across all ranks, then sort. A duplicate
    /// anywhere rejects the batch on every rank.
    pub fn insert_global_particles<const M: usize, C>(
        &mut self,
        particles: Vec<Particle<D>>,
        mesh: &PartitionedMesh<M, D>,
        comm: &C,
    ) -> Result<SortReport, ParticleError>
    where
        C: Communicator + ?Sized,
    {
        let checked = self
            .ensure_mutable("insert_global_particles")
            .and_then(|_| self.ensure_saved(mesh, "insert_global_particles"))
            .and_then(|_| particles.iter().try_for_each(|p| self.check_payload(p)));
        agree(comm, checked)?;

        let ids = self.store.ids().chain(particles.iter().map(Particle::id));
        let found = find_global_duplicates(ids, comm);
        let duplicates = self.collective(found)?;
        let unique = match duplicates.first() {
            Some(&id) => Err(ParticleError::DuplicateIdentifier { id }),
            None => Ok(()),
        };
        agree(comm, unique)?;

        for p in particles {
            self.store.insert(p, None)?;
        }
        self.touched();
        self.sort(mesh, comm)
    }

    pub fn remove_particle(&mut self, id: ParticleId) -> Result<Particle<D>, ParticleError> {
        self.ensure_mutable("remove_particle")?;
        let (p, _) = self.store.remove(id).ok_or(ParticleError::UnknownParticle(id))?;
        self.touched();
        Ok(p)
    }

    pub fn get(&self, id: ParticleId) -> Option<&Particle<D>> {
        self.store.get(id)
    }

    /// Mutable access; the handler counts as unsorted afterwards.
    pub fn particle_mut(&mut self, id: ParticleId) -> Result<&mut Particle<D>, ParticleError> {
        self.ensure_mutable("particle_mut")?;
        if !self.store.contains(id) {
            return Err(ParticleError::UnknownParticle(id));
        }
        self.touched();
        self.store.get_mut(id).ok_or(ParticleError::UnknownParticle(id))
    }

    pub fn set_position(&mut self, id: ParticleId, position: [f64; D]) -> Result<(), ParticleError> {
        self.particle_mut(id)?.set_position(position);
        Ok(())
    }

    /// The cell recorded for `id` (only trustworthy in state `Sorted`).
    pub fn cell_of(&self, id: ParticleId) -> Option<CellRef> {
        self.store.cell_of(id)
    }

    /// All local particles: unsorted ones first, then grouped by ascending
    /// cell and by id within a cell.
    pub fn iter(&self) -> impl Iterator<Item = ParticleRef<'_, D>> + '_ {
        self.store.iter().map(|(p, cell)| ParticleRef {
            id: p.id(),
            position: p.position(),
            reference_position: p.reference_position(),
            cell,
            properties: p.properties(),
        })
    }

    pub fn particles_in_cell(&self, cell: CellRef) -> impl Iterator<Item = &Particle<D>> + '_ {
        self.store.particles_in_cell(cell)
    }

    pub fn n_particles_in_cell(&self, cell: CellRef) -> usize {
        self.store.n_in_cell(cell)
    }

    pub fn n_locally_owned_particles(&self) -> usize {
        self.store.len()
    }

    pub fn max_particles_per_cell(&self) -> usize {
        self.store.max_per_cell()
    }

    /// Collective: particles on all ranks.
    pub fn n_global_particles<C: Communicator + ?Sized>(&self, comm: &C) -> Result<u64, ParticleError> {
        comm.allreduce_sum(self.store.len() as u64)
    }

    /// Collective: one more than the largest identifier on any rank.
    pub fn next_free_particle_id<C: Communicator + ?Sized>(&self, comm: &C) -> Result<u64, ParticleError> {
        let mine = self.store.max_id().map_or(0, |id| id.get() + 1);
        comm.allreduce_max(mine)
    }

    /// Poison the handler on failures that leave ownership in doubt.
    fn collective<T>(&mut self, result: Result<T, ParticleError>) -> Result<T, ParticleError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                log::warn!("[particles] poisoning handler: {e}");
                self.state = HandlerState::Poisoned;
            }
        }
        result
    }

    /// Collective: move every particle into the cell and onto the rank that
    /// contains it.
    pub fn sort<const M: usize, C>(&mut self, mesh: &PartitionedMesh<M, D>, comm: &C) -> Result<SortReport, ParticleError>
    where
        C: Communicator + ?Sized,
    {
        self.ensure_mutable("sort")?;
        self.ensure_saved(mesh, "sort")?;
        // Insertion hints survive; cells recorded for another mesh do not.
        if self.mesh_generation.is_some_and(|g| g != mesh.generation()) {
            self.store.forget_cells();
        }
        self.mesh_generation = Some(mesh.generation());
        let opts = self.router_options();
        let result = sort_particles(&mut self.store, mesh, comm, opts);
        let result = self.collective(result);
        if self.state != HandlerState::Poisoned {
            self.store.debug_assert_invariants();
            self.state = if self.store.is_empty() {
                HandlerState::Empty
            } else {
                HandlerState::Sorted
            };
            self.save_epoch = mesh.save_epoch();
        }
        result
    }

    /// Register the checkpoint attachment with `mesh`. Requires a sorted
    /// handler (or an empty one) and must precede `mesh.save`.
    pub fn prepare_for_serialization<const M: usize>(
        &mut self,
        mesh: &mut PartitionedMesh<M, D>,
    ) -> Result<AttachmentHandle, ParticleError> {
        match self.state {
            HandlerState::Sorted | HandlerState::Empty => {}
            HandlerState::Poisoned => return Err(ParticleError::Poisoned),
            other => return Err(ParticleError::order("prepare_for_serialization", other)),
        }
        self.ensure_saved(mesh, "prepare_for_serialization")?;
        let stale = !self.store.is_empty() && self.mesh_generation != Some(mesh.generation());
        if stale || mesh.save_epoch() != self.save_epoch {
            return Err(ParticleError::order(
                "prepare_for_serialization",
                format!("{} with mesh {} since the last sort", self.state, mesh.phase()),
            ));
        }
        let layout = RecordLayout::<D>::checkpoint(self.config.payload_size);
        let store = &self.store;
        let handle = mesh.register_attachment(|cell| cell_attachment_size(store, cell, &layout));
        self.pending = Some(Pending {
            handle,
            mesh_generation: mesh.generation(),
        });
        self.state = HandlerState::PreparedForCheckpoint;
        Ok(handle)
    }

    /// Collective: pack every cell's particles into the registered
    /// attachment and return the archive, identical on all ranks.
    pub fn serialize<const M: usize, C>(&mut self, mesh: &mut PartitionedMesh<M, D>, comm: &C) -> Result<Bytes, ParticleError>
    where
        C: Communicator + ?Sized,
    {
        let pending = match (&self.state, &self.pending) {
            (HandlerState::PreparedForCheckpoint, Some(p))
                if p.mesh_generation == mesh.generation() && mesh.save_epoch() == self.save_epoch =>
            {
                Ok(p.clone())
            }
            (HandlerState::Poisoned, _) => Err(ParticleError::Poisoned),
            _ => Err(ParticleError::order("serialize", self.state)),
        };
        let pending = agree(comm, pending)?;

        let layout = RecordLayout::<D>::checkpoint(self.config.payload_size);
        let cells: Vec<CellRef> = self.store.occupied_cells().collect();
        let filled = cells.into_iter().try_for_each(|cell| {
            mesh.fill_attachment(pending.handle, cell, pack_cell(&self.store, cell, &layout))
        });
        agree(comm, filled)?;

        let header = ArchiveHeader {
            dimension: D,
            payload_size: self.config.payload_size,
            attachment: pending.handle,
            n_global: self.n_global_particles(comm)?,
            next_free_id: self.next_free_particle_id(comm)?,
        };
        self.state = HandlerState::Serialized;
        self.awaiting_save = Some(AwaitingSave {
            mesh_generation: mesh.generation(),
            save_epoch: mesh.save_epoch(),
        });
        log::info!(
            "[particles] rank {} serialized {} of {} particles into attachment {}",
            comm.rank(),
            self.store.len(),
            header.n_global,
            header.attachment.get()
        );
        Ok(header.encode())
    }

    /// Read an archive into an empty handler. The mesh must still be
    /// cleared: the archive is read before the mesh is reloaded.
    pub fn deserialize<const M: usize>(&mut self, archive: &[u8], mesh: &PartitionedMesh<M, D>) -> Result<(), ParticleError> {
        match self.state {
            HandlerState::Empty => {}
            HandlerState::Poisoned => return Err(ParticleError::Poisoned),
            other => return Err(ParticleError::order("deserialize", other)),
        }
        if !mesh.is_cleared() {
            return Err(ParticleError::order(
                "deserialize",
                format!("{} with mesh already {}", self.state, mesh.phase()),
            ));
        }
        let header = ArchiveHeader::decode(archive, D, self.config.payload_size)?;
        self.restore = Some(Restore {
            header,
            mesh_generation: mesh.generation(),
        });
        self.state = HandlerState::Restoring;
        Ok(())
    }

    /// Collective: rebuild the particles from the reloaded mesh's
    /// attachments, then apply the configured [`RestorePolicy`].
    pub fn restore_from_mesh<const M: usize, C>(
        &mut self,
        mesh: &PartitionedMesh<M, D>,
        comm: &C,
    ) -> Result<SortReport, ParticleError>
    where
        C: Communicator + ?Sized,
    {
        let restore = match (&self.state, &self.restore, mesh.phase()) {
            (HandlerState::Restoring, Some(r), CheckpointPhase::Loaded(_))
                if r.mesh_generation != mesh.generation() =>
            {
                Ok(r.clone())
            }
            (HandlerState::Poisoned, _, _) => Err(ParticleError::Poisoned),
            (state, _, phase) => Err(ParticleError::order(
                "restore_from_mesh",
                format!("{state} with mesh {phase}"),
            )),
        };
        let restore = agree(comm, restore)?;
        let unpacked = self.unpack(mesh, restore.header.attachment);
        if let Err(e) = agree(comm, unpacked) {
            self.clear();
            return Err(e);
        }

        let n_global = self.n_global_particles(comm)?;
        if n_global != restore.header.n_global {
            self.clear();
            return Err(ParticleError::ArchiveFormat(format!(
                "restored {n_global} particles, archive announced {}",
                restore.header.n_global
            )));
        }
        self.restore = None;
        self.mesh_generation = Some(mesh.generation());
        self.save_epoch = mesh.save_epoch();
        log::info!(
            "[particles] rank {} restored {} of {n_global} particles ({:?})",
            comm.rank(),
            self.store.len(),
            self.config.restore_policy
        );
        match self.config.restore_policy {
            RestorePolicy::TrustAttachments => {
                self.state = if self.store.is_empty() {
                    HandlerState::Empty
                } else {
                    HandlerState::Sorted
                };
                Ok(SortReport {
                    kept: self.store.len(),
                    ..SortReport::default()
                })
            }
            RestorePolicy::AlwaysSort => {
                self.touched();
                self.sort(mesh, comm)
            }
        }
    }

    fn unpack<const M: usize>(&mut self, mesh: &PartitionedMesh<M, D>, handle: AttachmentHandle) -> Result<(), ParticleError> {
        let layout = RecordLayout::<D>::checkpoint(self.config.payload_size);
        for cell in mesh.local_cells() {
            let Some(raw) = mesh.read_attachment(handle, cell) else {
                return Err(ParticleError::MeshCheckpoint(format!(
                    "no attachment {} for cell {cell} (leaf {:?})",
                    handle.get(),
                    mesh.tree_cell(cell)
                )));
            };
            for p in unpack_cell(raw, &layout)? {
                let id = p.id();
                let reference = *p.reference_position();
                self.store.insert(p, Some(cell))?;
                self.store.set_cell(id, cell, reference)?;
            }
        }
        Ok(())
    }

    /// Collective-free check that every particle lies in its recorded local
    /// cell. Meaningful in state `Sorted`.
    pub fn validate_geometry<const M: usize>(&self, mesh: &PartitionedMesh<M, D>) -> Result<(), ParticleError> {
        for (p, cell) in self.store.iter() {
            let cell = cell.ok_or_else(|| {
                ParticleError::InvariantViolation(format!("particle {} has no cell", p.id()))
            })?;
            if !mesh.contains(cell, p.position()) {
                return Err(ParticleError::InvariantViolation(format!(
                    "particle {} at {:?} is not inside its cell {cell}",
                    p.id(),
                    p.position()
                )));
            }
        }
        Ok(())
    }

    /// Drop all particles and any checkpoint progress; also recovers a
    /// poisoned handler.
    pub fn clear(&mut self) {
        self.store.clear();
        self.state = HandlerState::Empty;
        self.mesh_generation = None;
        self.save_epoch = 0;
        self.pending = None;
        self.awaiting_save = None;
        self.restore = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::geometry::Aabb;
    use crate::io::{CheckpointStore, MemoryStore};
    use crate::particles::locator::CellLocator;

    fn mesh() -> PartitionedMesh<2> {
        PartitionedMesh::hyper_cube(Aabb::unit(), 2, &NoComm).unwrap()
    }

    #[test]
    fn mutation_unsorts() {
        let mesh = mesh();
        let mut h = ParticleHandler::<2>::default();
        assert_eq!(h.state(), HandlerState::Empty);
        h.insert_particle(Particle::new(1u64, [0.2, 0.2]), None).unwrap();
        assert_eq!(h.state(), HandlerState::Populated);
        h.sort(&mesh, &NoComm).unwrap();
        assert_eq!(h.state(), HandlerState::Sorted);
        h.set_position(ParticleId::new(1), [0.8, 0.8]).unwrap();
        assert_eq!(h.state(), HandlerState::Populated);
        h.sort(&mesh, &NoComm).unwrap();
        h.validate_geometry(&mesh).unwrap();
    }

    #[test]
    fn insertion_hint_is_tried_first() {
        let mesh = mesh();
        let cell = CellLocator::new(&mesh, true).locate(&[0.1, 0.1], None).cell();
        assert!(cell.is_some());
        let mut h = ParticleHandler::<2>::default();
        h.insert_particle(Particle::new(1u64, [0.1, 0.1]), cell).unwrap();
        let report = h.sort(&mesh, &NoComm).unwrap();
        assert_eq!(report.kept, 1);
        assert_eq!(report.relocated, 0);
        assert_eq!(h.cell_of(ParticleId::new(1)), cell);
    }

    #[test]
    fn cells_of_another_mesh_are_forgotten() {
        let first = mesh();
        // Same cell numbering, so a carried-over cell would look valid.
        let second = PartitionedMesh::<2>::hyper_cube(Aabb::new([0.0, 0.0], [2.0, 2.0]), 2, &NoComm).unwrap();
        let mut h = ParticleHandler::<2>::default();
        h.insert_particle(Particle::new(1u64, [0.1, 0.1]), None).unwrap();
        h.sort(&first, &NoComm).unwrap();
        assert_eq!(h.cell_of(ParticleId::new(1)), Some(CellRef::new(2, 0)));
        let report = h.sort(&second, &NoComm).unwrap();
        assert_eq!((report.kept, report.relocated), (0, 1));
        assert_eq!(h.cell_of(ParticleId::new(1)), Some(CellRef::new(2, 0)));
        h.validate_geometry(&second).unwrap();
    }

    #[test]
    fn sort_waits_for_mesh_save_after_serialize() {
        let store = MemoryStore::new();
        let mut mesh = mesh();
        let mut h = ParticleHandler::<2>::default();
        h.insert_particle(Particle::new(1u64, [0.2, 0.2]), None).unwrap();
        h.sort(&mesh, &NoComm).unwrap();
        h.prepare_for_serialization(&mut mesh).unwrap();
        h.serialize(&mut mesh, &NoComm).unwrap();

        // The snapshot is already in the mesh; moving particles is fine.
        h.set_position(ParticleId::new(1), [0.7, 0.2]).unwrap();
        assert_eq!(h.state(), HandlerState::Populated);
        let err = h.sort(&mesh, &NoComm).unwrap_err();
        assert!(matches!(err, ParticleError::CheckpointOrderViolation { operation: "sort", .. }));
        let err = h.prepare_for_serialization(&mut mesh).unwrap_err();
        assert!(matches!(err, ParticleError::CheckpointOrderViolation { .. }));

        mesh.save(&store, "first", &NoComm).unwrap();
        h.sort(&mesh, &NoComm).unwrap();
        assert_eq!(h.state(), HandlerState::Sorted);
        h.prepare_for_serialization(&mut mesh).unwrap();
        h.serialize(&mut mesh, &NoComm).unwrap();
        mesh.save(&store, "second", &NoComm).unwrap();
        assert!(store.exists("second.mesh.json"));
    }

    #[test]
    fn payload_size_is_enforced() {
        let mut h = ParticleHandler::<1>::new(ParticleHandlerConfig::default().with_payload_size(2));
        let err = h
            .insert_particle(Particle::new(1u64, [0.5]).with_properties(vec![1u8]), None)
            .unwrap_err();
        assert!(matches!(err, ParticleError::PayloadSizeMismatch { expected: 2, found: 1, .. }));
    }

    #[test]
    fn prepare_requires_sorted_handler() {
        let mut mesh = mesh();
        let mut h = ParticleHandler::<2>::default();
        h.insert_particle(Particle::new(1u64, [0.2, 0.2]), None).unwrap();
        let err = h.prepare_for_serialization(&mut mesh).unwrap_err();
        assert!(matches!(
            err,
            ParticleError::CheckpointOrderViolation { operation: "prepare_for_serialization", .. }
        ));
    }

    #[test]
    fn prepare_after_mesh_save_is_rejected() {
        let store = MemoryStore::new();
        let mut mesh = mesh();
        let mut h = ParticleHandler::<2>::default();
        h.insert_particle(Particle::new(1u64, [0.2, 0.2]), None).unwrap();
        h.sort(&mesh, &NoComm).unwrap();
        mesh.save(&store, "early", &NoComm).unwrap();
        let err = h.prepare_for_serialization(&mut mesh).unwrap_err();
        assert!(matches!(err, ParticleError::CheckpointOrderViolation { .. }));
        // Sorting again starts a new cycle.
        h.sort(&mesh, &NoComm).unwrap();
        h.prepare_for_serialization(&mut mesh).unwrap();
    }

    #[test]
    fn fatal_failure_on_a_peer_poisons() {
        let mut h = ParticleHandler::<2>::default();
        let peer = Err::<(), _>(ParticleError::RemoteFailure { count: 1, fatal: false });
        assert!(h.collective(peer).is_err());
        assert_eq!(h.state(), HandlerState::Empty);
        let peer = Err::<(), _>(ParticleError::RemoteFailure { count: 1, fatal: true });
        assert!(h.collective(peer).is_err());
        assert_eq!(h.state(), HandlerState::Poisoned);
    }

    #[test]
    fn poisoned_handler_only_clears() {
        let mut h = ParticleHandler::<2>::default();
        h.state = HandlerState::Poisoned;
        assert!(matches!(
            h.insert_particle(Particle::new(1u64, [0.1, 0.1]), None),
            Err(ParticleError::Poisoned)
        ));
        h.clear();
        assert_eq!(h.state(), HandlerState::Empty);
    }

    #[test]
    fn next_free_id_follows_largest() {
        let mut h = ParticleHandler::<2>::default();
        assert_eq!(h.next_free_particle_id(&NoComm).unwrap(), 0);
        h.insert_particle(Particle::new(41u64, [0.1, 0.1]), None).unwrap();
        assert_eq!(h.next_free_particle_id(&NoComm).unwrap(), 42);
        assert_eq!(h.n_global_particles(&NoComm).unwrap(), 1);
    }
}
