//! ParticleError: unified error type for particle-sieve public APIs
//!
//! Every failure that can leave a rank's particle ownership in doubt is a
//! distinct, named variant so that calling code can log it and abort a
//! simulation deterministically instead of continuing with corrupted state.
//! A point that merely misses every *local* cell is not an error; see
//! [`Location::NotFoundLocally`](crate::particles::locator::Location).

use crate::particles::particle::ParticleId;
use crate::topology::cell::CellRef;
use thiserror::Error;

/// Unified error type for particle-sieve operations.
#[derive(Debug, Error)]
pub enum ParticleError {
    /// After a full exchange round no queried rank owned a cell containing the
    /// particle. Either the position lies outside the mesh or the coarse
    /// subdomain index under-approximated the candidate ranks.
    #[error("particle {id} at {position:?} is not contained in any cell of the distributed mesh")]
    GlobalLocationFailure { id: ParticleId, position: Vec<f64> },
    /// `count` ranks failed during the same collective (lost or duplicate
    /// particles, bad checkpoint data); every rank aborts with an error.
    /// `fatal` is set when any of those failures was fatal.
    #[error("{count} rank(s) failed during the same collective operation")]
    RemoteFailure { count: u64, fatal: bool },
    /// A checkpoint/restart call arrived in the wrong order.
    #[error("checkpoint order violation: `{operation}` is not allowed in state {state}")]
    CheckpointOrderViolation {
        operation: &'static str,
        state: String,
    },
    /// A particle identifier is already resident in the distributed store.
    #[error("duplicate particle identifier {id}")]
    DuplicateIdentifier { id: ParticleId },
    /// A rank did not take part in a collective round (or sent garbage).
    #[error("collective exchange desynchronized with rank {peer}: {reason}")]
    CollectiveDesync { peer: usize, reason: String },
    /// More than one rank claimed the same migrating particle.
    #[error("particle {id} was adopted by more than one rank")]
    AmbiguousOwnership { id: ParticleId },
    /// Particle properties must have the fixed per-handler byte size.
    #[error("particle {id} carries {found} property bytes, expected {expected}")]
    PayloadSizeMismatch {
        id: ParticleId,
        expected: usize,
        found: usize,
    },
    /// No particle with this identifier lives on the current rank.
    #[error("unknown particle {0}")]
    UnknownParticle(ParticleId),
    /// A cell reference does not name a cell of the current local mesh.
    #[error("cell {0} is not a locally owned cell")]
    CellNotLocal(CellRef),
    /// The particle archive or a wire record is malformed.
    #[error("particle archive format error: {0}")]
    ArchiveFormat(String),
    /// The mesh checkpoint on disk (or in memory) is malformed or inconsistent.
    #[error("mesh checkpoint error: {0}")]
    MeshCheckpoint(String),
    /// Bytes filled into an attachment slot do not match the registered size.
    #[error("attachment for cell {cell} holds {found} bytes, placeholder is {expected}")]
    AttachmentSizeMismatch {
        cell: CellRef,
        expected: usize,
        found: usize,
    },
    /// Internal bookkeeping disagrees with itself (debug validation).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// A previous collective failed part-way; only `clear()` is allowed.
    #[error("particle store is poisoned by an interrupted collective; call clear()")]
    Poisoned,
    /// Underlying I/O failure from a checkpoint store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParticleError {
    /// Shorthand used by state guards.
    pub(crate) fn order(operation: &'static str, state: impl std::fmt::Display) -> Self {
        ParticleError::CheckpointOrderViolation {
            operation,
            state: state.to_string(),
        }
    }

    /// Returns true for failures after which the distributed ownership state
    /// can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParticleError::CollectiveDesync { .. }
                | ParticleError::AmbiguousOwnership { .. }
                | ParticleError::RemoteFailure { fatal: true, .. }
                | ParticleError::Poisoned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_particle() {
        let err = ParticleError::GlobalLocationFailure {
            id: ParticleId::new(7),
            position: vec![1.5, 0.25],
        };
        let msg = err.to_string();
        assert!(msg.contains("particle 7"));
        assert!(msg.contains("1.5"));
    }

    #[test]
    fn desync_is_fatal_but_duplicate_is_not() {
        let desync = ParticleError::CollectiveDesync {
            peer: 1,
            reason: "timeout".into(),
        };
        assert!(desync.is_fatal());
        let dup = ParticleError::DuplicateIdentifier {
            id: ParticleId::new(3),
        };
        assert!(!dup.is_fatal());
    }
}
