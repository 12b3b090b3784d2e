//! Sort: reconcile every particle with the cell that contains it, moving
//! particles between ranks where needed.
//!
//! One round is fully collective:
//! 1. every particle is located locally (hint, neighbors, full scan);
//! 2. particles no local cell contains are sent to *every* candidate rank
//!    of the subdomain index ([`tags::SORT_MIGRATE`]);
//! 3. receivers locate what they got and acknowledge what they adopt
//!    ([`tags::SORT_ACK`]);
//! 4. senders drop acknowledged particles. A particle nobody adopted is a
//!    [`ParticleError::GlobalLocationFailure`], one adopted twice an
//!    [`ParticleError::AmbiguousOwnership`];
//! 5. all ranks agree on the outcome, so a failure anywhere fails everyone.
//!
//! Adoptions are staged and applied after the acknowledgement round, so no
//! particle is ever held by two ranks at the end of a round.

use super::locator::{CellLocator, CellSearchSpace, Location};
use super::particle::{Particle, ParticleId};
use super::store::ParticleStore;
use crate::algs::communicator::{Communicator, tags};
use crate::algs::exchange::agree;
use crate::algs::wire::{RecordLayout, WireKind, decode_ids, encode_ids};
use crate::mesh::PartitionedMesh;
use crate::particle_error::ParticleError;
use crate::topology::cell::CellRef;
use std::collections::{BTreeMap, HashSet};

/// Counts of one sort round on this rank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SortReport {
    /// Particles whose recorded cell was still correct.
    pub kept: usize,
    /// Particles moved to another local cell (or located for the first time).
    pub relocated: usize,
    /// Particles offered to other ranks.
    pub sent: usize,
    /// Particle records received from other ranks.
    pub received: usize,
    /// Received particles this rank took ownership of.
    pub adopted: usize,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct RouterOptions {
    pub payload_size: usize,
    pub check_unique: bool,
    pub neighbors_first: bool,
}

type Work<const D: usize> = (ParticleId, [f64; D], Option<CellRef>);

fn locate_all<const D: usize, M>(locator: &CellLocator<'_, M>, work: &[Work<D>]) -> Vec<Location<D>>
where
    M: CellSearchSpace<D> + Sync,
{
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        work.par_iter()
            .map(|(_, x, hint)| locator.locate(x, *hint))
            .collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        work.iter()
            .map(|(_, x, hint)| locator.locate(x, *hint))
            .collect()
    }
}

/// Staged result of a round, applied once both exchanges completed.
struct Round<const D: usize> {
    /// Sent particles and how many acknowledgements each received.
    pending: BTreeMap<ParticleId, usize>,
    /// Strays with no candidate rank at all.
    orphans: Vec<ParticleId>,
    adopt: Vec<(Particle<D>, CellRef, [f64; D])>,
    duplicates: Vec<ParticleId>,
    protocol: Option<ParticleError>,
}

/// Collective over `comm`; every rank must call it in the same round.
pub(crate) fn sort_particles<const D: usize, const M: usize, C>(
    store: &mut ParticleStore<D>,
    mesh: &PartitionedMesh<M, D>,
    comm: &C,
    opts: RouterOptions,
) -> Result<SortReport, ParticleError>
where
    C: Communicator + ?Sized,
{
    let me = comm.rank();
    let locator = CellLocator::new(mesh, opts.neighbors_first);
    let layout = RecordLayout::<D>::migration(opts.payload_size);
    let mut report = SortReport::default();

    let work: Vec<Work<D>> = store
        .iter()
        .map(|(p, cell)| (p.id(), *p.position(), cell))
        .collect();
    let located = locate_all(&locator, &work);

    let mut strays = Vec::new();
    for ((id, _, hint), loc) in work.iter().zip(located) {
        match loc {
            Location::Found { cell, reference } => {
                if *hint == Some(cell) {
                    report.kept += 1;
                } else {
                    report.relocated += 1;
                }
                store.set_cell(*id, cell, reference)?;
            }
            Location::NotFoundLocally => strays.push(*id),
        }
    }

    let mut round = Round {
        pending: BTreeMap::new(),
        orphans: Vec::new(),
        adopt: Vec::new(),
        duplicates: Vec::new(),
        protocol: None,
    };

    // stage 1: offer strays to every candidate owner
    let mut outgoing: Vec<Vec<&Particle<D>>> = vec![Vec::new(); comm.size()];
    for id in &strays {
        let Some(p) = store.get(*id) else { continue };
        let candidates: Vec<usize> = mesh
            .candidate_ranks(p.position())
            .into_iter()
            .filter(|&r| r != me)
            .collect();
        if candidates.is_empty() {
            round.orphans.push(*id);
            continue;
        }
        log::trace!("[sort] rank {me} offers particle {id} to ranks {candidates:?}");
        for r in candidates {
            outgoing[r].push(p);
        }
        round.pending.insert(*id, 0);
    }
    report.sent = round.pending.len();
    let frames = outgoing
        .iter()
        .map(|ps| match ps.len() {
            0 => Vec::new(),
            _ => layout.encode(WireKind::Migrate, ps.iter().copied()).to_vec(),
        })
        .collect();
    let incoming = comm.exchange_all(tags::SORT_MIGRATE, frames)?;

    // stage 2: adopt what we contain, acknowledge it
    let mut acks: Vec<Vec<ParticleId>> = vec![Vec::new(); comm.size()];
    let mut seen = HashSet::new();
    for (src, raw) in incoming.iter().enumerate() {
        if src == me || raw.is_empty() {
            continue;
        }
        let particles = match layout.decode(WireKind::Migrate, raw) {
            Ok(ps) => ps,
            Err(e) => {
                round.protocol.get_or_insert(ParticleError::CollectiveDesync {
                    peer: src,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        for p in particles {
            report.received += 1;
            let Location::Found { cell, reference } = locator.locate(p.position(), None) else {
                continue;
            };
            let id = p.id();
            acks[src].push(id);
            let resident = store.contains(id) || !seen.insert(id);
            if resident && opts.check_unique {
                round.duplicates.push(id);
            } else {
                log::trace!("[sort] rank {me} adopts particle {id} from rank {src} into cell {cell}");
                round.adopt.push((p, cell, reference));
            }
        }
    }
    let frames = acks
        .iter()
        .map(|ids| match ids.len() {
            0 => Vec::new(),
            _ => encode_ids(WireKind::Ack, ids).to_vec(),
        })
        .collect();
    let incoming = comm.exchange_all(tags::SORT_ACK, frames)?;

    // stage 3: count acknowledgements for what we sent
    for (src, raw) in incoming.iter().enumerate() {
        if src == me || raw.is_empty() {
            continue;
        }
        match decode_ids(WireKind::Ack, raw) {
            Ok(ids) => {
                for id in ids {
                    match round.pending.get_mut(&id) {
                        Some(n) => *n += 1,
                        None => {
                            round.protocol.get_or_insert(ParticleError::CollectiveDesync {
                                peer: src,
                                reason: format!("acknowledged particle {id} that was never offered"),
                            });
                        }
                    }
                }
            }
            Err(e) => {
                round.protocol.get_or_insert(ParticleError::CollectiveDesync {
                    peer: src,
                    reason: e.to_string(),
                });
            }
        }
    }

    let outcome = apply_round(store, round, &mut report);
    log::debug!(
        "[sort] rank {me}: kept {}, relocated {}, sent {}, received {}, adopted {}",
        report.kept,
        report.relocated,
        report.sent,
        report.received,
        report.adopted
    );
    agree(comm, outcome)?;
    Ok(report)
}

fn apply_round<const D: usize>(
    store: &mut ParticleStore<D>,
    round: Round<D>,
    report: &mut SortReport,
) -> Result<(), ParticleError> {
    let mut lost = round.orphans;
    let mut ambiguous = None;
    for (&id, &acks) in &round.pending {
        match acks {
            0 => lost.push(id),
            1 => {
                store.remove(id);
            }
            _ => {
                store.remove(id);
                ambiguous.get_or_insert(id);
            }
        }
    }
    lost.sort_unstable();
    let mut first_lost = None;
    for id in &lost {
        if let Some((p, _)) = store.remove(*id) {
            log::warn!("[sort] particle {id} at {:?} is outside every cell", p.position());
            first_lost.get_or_insert(ParticleError::GlobalLocationFailure {
                id: *id,
                position: p.position().to_vec(),
            });
        }
    }
    for (p, cell, reference) in round.adopt {
        let id = p.id();
        store.remove(id);
        store.insert(p, Some(cell))?;
        store.set_cell(id, cell, reference)?;
        report.adopted += 1;
    }

    if let Some(err) = round.protocol {
        log::warn!("[sort] protocol violation: {err}");
        return Err(err);
    }
    if let Some(id) = ambiguous {
        return Err(ParticleError::AmbiguousOwnership { id });
    }
    if let Some(err) = first_lost {
        return Err(err);
    }
    if let Some(&id) = round.duplicates.iter().min() {
        return Err(ParticleError::DuplicateIdentifier { id });
    }
    Ok(())
}

/// Collective: identifiers occurring more than once across all ranks among
/// `ids`. Each id is checked by the rank `id % size`; the result lists the
/// duplicates this rank found as a bucket owner.
pub(crate) fn find_global_duplicates<C, I>(ids: I, comm: &C) -> Result<Vec<ParticleId>, ParticleError>
where
    C: Communicator + ?Sized,
    I: IntoIterator<Item = ParticleId>,
{
    let size = comm.size();
    let mut buckets: Vec<Vec<ParticleId>> = vec![Vec::new(); size];
    for id in ids {
        buckets[(id.get() % size as u64) as usize].push(id);
    }
    let frames = buckets
        .iter()
        .map(|ids| encode_ids(WireKind::IdBucket, ids).to_vec())
        .collect();
    let incoming = comm.exchange_all(tags::UNIQUE_IDS, frames)?;
    let mut counts: BTreeMap<ParticleId, usize> = BTreeMap::new();
    for (src, raw) in incoming.iter().enumerate() {
        let ids = decode_ids(WireKind::IdBucket, raw).map_err(|e| ParticleError::CollectiveDesync {
            peer: src,
            reason: e.to_string(),
        })?;
        for id in ids {
            *counts.entry(id).or_default() += 1;
        }
    }
    Ok(counts
        .into_iter()
        .filter_map(|(id, n)| (n > 1).then_some(id))
        .collect())
}
