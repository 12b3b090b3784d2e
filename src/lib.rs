#![cfg_attr(docsrs, feature(doc_cfg))]
//! # particle-sieve
//!
//! particle-sieve keeps point particles associated with the cells of a
//! distributed quad/oct-tree mesh. Each rank stores the particles inside the
//! cells it owns; a collective *sort* moves particles to the right cell and
//! the right rank after they moved, and a checkpoint/restart cycle persists
//! them through the mesh so a run can resume on a different number of ranks.
//!
//! ## Features
//! - Point location with hints, vertex neighbors and a full-scan fallback
//! - Cross-rank migration with acknowledgements: a particle is never lost or
//!   held twice without every rank reporting an error
//! - Checkpoint/restart through per-cell mesh attachments, independent of the
//!   partition layout that wrote the checkpoint
//! - Flat meshes (`PartitionedMesh<2, 3>`: a 2-D tree in 3-D space)
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! particle-sieve = "0.1"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ```
//! use particle_sieve::prelude::*;
//!
//! # fn main() -> Result<(), ParticleError> {
//! let comm = NoComm;
//! let mesh = PartitionedMesh::<2>::hyper_cube(Aabb::unit(), 2, &comm)?;
//! let mut particles = ParticleHandler::<2>::default();
//! particles.insert_particle(Particle::new(0u64, [0.125, 0.125]), None)?;
//! particles.insert_particle(Particle::new(1u64, [0.525, 0.525]), None)?;
//! particles.sort(&mesh, &comm)?;
//! assert_eq!(particles.n_global_particles(&comm)?, 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Collectives
//!
//! Operations documented as *collective* must be called by every rank of the
//! communicator in the same order. Failures inside a collective are agreed
//! on: a rank that did not fail itself returns
//! [`ParticleError::RemoteFailure`].

pub mod algs;
pub mod debug_invariants;
pub mod forest;
pub mod geometry;
pub mod io;
pub mod mesh;
pub mod particle_error;
pub mod particles;
pub mod topology;

pub use debug_invariants::DebugInvariants;
pub use particle_error::ParticleError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::forest::{Forest, TreeCell};
    pub use crate::geometry::{Aabb, GeometryOracle};
    pub use crate::io::{CheckpointStore, DirStore, MemoryStore};
    pub use crate::mesh::attachment::AttachmentHandle;
    pub use crate::mesh::{CheckpointPhase, PartitionedMesh, SubdomainIndex};
    pub use crate::particle_error::ParticleError;
    pub use crate::particles::config::{ParticleHandlerConfig, RestorePolicy};
    pub use crate::particles::handler::{HandlerState, ParticleHandler, ParticleRef};
    pub use crate::particles::locator::{CellLocator, Location};
    pub use crate::particles::particle::{Particle, ParticleId};
    pub use crate::particles::router::SortReport;
    pub use crate::topology::cell::CellRef;
}
