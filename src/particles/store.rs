//! Rank-local particle store indexed by identifier and by cell.
//!
//! A particle's recorded cell is `None` until it has been located (freshly
//! inserted without a hint, or after the mesh it referred to went away).

use super::particle::{Particle, ParticleId};
use crate::debug_invariants::DebugInvariants;
use crate::particle_error::ParticleError;
use crate::topology::cell::CellRef;
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
struct Entry<const D: usize> {
    particle: Particle<D>,
    cell: Option<CellRef>,
}

#[derive(Clone, Debug, Default)]
pub struct ParticleStore<const D: usize> {
    particles: HashMap<ParticleId, Entry<D>>,
    by_cell: BTreeMap<CellRef, BTreeSet<ParticleId>>,
}

impl<const D: usize> ParticleStore<D> {
    pub fn new() -> Self {
        Self {
            particles: HashMap::new(),
            by_cell: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn contains(&self, id: ParticleId) -> bool {
        self.particles.contains_key(&id)
    }

    /// Insert a particle not yet present on this rank.
    pub fn insert(&mut self, particle: Particle<D>, cell: Option<CellRef>) -> Result<(), ParticleError> {
        let id = particle.id();
        if self.particles.contains_key(&id) {
            return Err(ParticleError::DuplicateIdentifier { id });
        }
        if let Some(c) = cell {
            self.by_cell.entry(c).or_default().insert(id);
        }
        self.particles.insert(id, Entry { particle, cell });
        Ok(())
    }

    pub fn remove(&mut self, id: ParticleId) -> Option<(Particle<D>, Option<CellRef>)> {
        let entry = self.particles.remove(&id)?;
        if let Some(c) = entry.cell {
            self.unindex(c, id);
        }
        Some((entry.particle, entry.cell))
    }

    pub fn get(&self, id: ParticleId) -> Option<&Particle<D>> {
        self.particles.get(&id).map(|e| &e.particle)
    }

    /// Mutable access that leaves the recorded cell untouched.
    pub fn get_mut(&mut self, id: ParticleId) -> Option<&mut Particle<D>> {
        self.particles.get_mut(&id).map(|e| &mut e.particle)
    }

    pub fn cell_of(&self, id: ParticleId) -> Option<CellRef> {
        self.particles.get(&id).and_then(|e| e.cell)
    }

    /// Record the located cell and reference position of a resident particle.
    pub fn set_cell(&mut self, id: ParticleId, cell: CellRef, reference: [f64; D]) -> Result<(), ParticleError> {
        let entry = self
            .particles
            .get_mut(&id)
            .ok_or(ParticleError::UnknownParticle(id))?;
        let old = entry.cell.replace(cell);
        entry.particle.set_reference_position(reference);
        if old != Some(cell) {
            if let Some(o) = old {
                self.unindex(o, id);
            }
            self.by_cell.entry(cell).or_default().insert(id);
        }
        Ok(())
    }

    /// Forget every recorded cell (the mesh they referred to is gone).
    pub fn forget_cells(&mut self) {
        self.by_cell.clear();
        for entry in self.particles.values_mut() {
            entry.cell = None;
        }
    }

    fn unindex(&mut self, cell: CellRef, id: ParticleId) {
        if let Some(set) = self.by_cell.get_mut(&cell) {
            set.remove(&id);
            if set.is_empty() {
                self.by_cell.remove(&cell);
            }
        }
    }

    /// Unlocated particles first (by id), then grouped by ascending cell and
    /// by id within a cell.
    pub fn iter(&self) -> impl Iterator<Item = (&Particle<D>, Option<CellRef>)> + '_ {
        let mut unlocated: Vec<_> = self
            .particles
            .values()
            .filter(|e| e.cell.is_none())
            .map(|e| &e.particle)
            .collect();
        unlocated.sort_unstable_by_key(|p| p.id());
        let located = self.by_cell.iter().flat_map(move |(&cell, ids)| {
            ids.iter()
                .filter_map(move |id| self.particles.get(id))
                .map(move |e| (&e.particle, Some(cell)))
        });
        unlocated.into_iter().map(|p| (p, None)).chain(located)
    }

    pub fn ids(&self) -> impl Iterator<Item = ParticleId> + '_ {
        self.particles.keys().copied()
    }

    /// Particles recorded in `cell`, ascending by id.
    pub fn particles_in_cell(&self, cell: CellRef) -> impl Iterator<Item = &Particle<D>> + '_ {
        self.by_cell
            .get(&cell)
            .into_iter()
            .flatten()
            .filter_map(|id| self.particles.get(id).map(|e| &e.particle))
    }

    pub fn n_in_cell(&self, cell: CellRef) -> usize {
        self.by_cell.get(&cell).map_or(0, BTreeSet::len)
    }

    pub fn occupied_cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        self.by_cell.keys().copied()
    }

    pub fn max_per_cell(&self) -> usize {
        self.by_cell.values().map(BTreeSet::len).max().unwrap_or(0)
    }

    pub fn max_id(&self) -> Option<ParticleId> {
        self.particles.keys().max().copied()
    }

    pub fn n_unlocated(&self) -> usize {
        self.particles.values().filter(|e| e.cell.is_none()).count()
    }

    pub fn clear(&mut self) {
        self.particles.clear();
        self.by_cell.clear();
    }
}

impl<const D: usize> DebugInvariants for ParticleStore<D> {
    fn validate_invariants(&self) -> Result<(), ParticleError> {
        let mut indexed = 0;
        for (&cell, ids) in &self.by_cell {
            if ids.is_empty() {
                return Err(ParticleError::InvariantViolation(format!("empty index bucket for cell {cell}")));
            }
            for &id in ids {
                match self.particles.get(&id) {
                    Some(e) if e.cell == Some(cell) => indexed += 1,
                    _ => {
                        return Err(ParticleError::InvariantViolation(format!(
                            "cell index lists {id} under {cell}, store disagrees"
                        )));
                    }
                }
            }
        }
        let located = self.particles.values().filter(|e| e.cell.is_some()).count();
        if indexed != located {
            return Err(ParticleError::InvariantViolation(format!(
                "{located} located particles but {indexed} index entries"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: u64) -> Particle<2> {
        Particle::new(id, [0.1 * id as f64, 0.0])
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut s = ParticleStore::new();
        s.insert(p(1), None).unwrap();
        let err = s.insert(p(1), Some(CellRef::new(0, 0))).unwrap_err();
        assert!(matches!(err, ParticleError::DuplicateIdentifier { .. }));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn iteration_groups_by_cell_then_id() {
        let mut s = ParticleStore::new();
        let (a, b) = (CellRef::new(1, 0), CellRef::new(1, 2));
        s.insert(p(5), Some(b)).unwrap();
        s.insert(p(9), Some(a)).unwrap();
        s.insert(p(2), Some(b)).unwrap();
        s.insert(p(7), None).unwrap();
        let order: Vec<_> = s.iter().map(|(p, c)| (p.id().get(), c)).collect();
        assert_eq!(order, vec![(7, None), (9, Some(a)), (2, Some(b)), (5, Some(b))]);
        assert_eq!(s.max_per_cell(), 2);
        s.validate_invariants().unwrap();
    }

    #[test]
    fn relocation_moves_index_entry() {
        let mut s = ParticleStore::new();
        let (a, b) = (CellRef::new(0, 0), CellRef::new(0, 1));
        s.insert(p(3), Some(a)).unwrap();
        s.set_cell(ParticleId::new(3), b, [0.5, 0.5]).unwrap();
        assert_eq!(s.n_in_cell(a), 0);
        assert_eq!(s.n_in_cell(b), 1);
        assert_eq!(s.get(ParticleId::new(3)).unwrap().reference_position(), &[0.5, 0.5]);
        s.forget_cells();
        assert_eq!(s.n_unlocated(), 1);
        assert_eq!(s.occupied_cells().count(), 0);
        s.validate_invariants().unwrap();
        assert!(s.remove(ParticleId::new(3)).is_some());
        assert!(s.is_empty());
    }
}
