//! Particles and the machinery that keeps them in the right cell.
//!
//! - [`store`]: rank-local container indexed by id and by cell
//! - [`locator`]: local point location
//! - [`router`]: the collective sort with cross-rank migration
//! - [`codec`]: checkpoint records and the handler archive
//! - [`handler`]: [`ParticleHandler`], the facade tying them together

pub mod codec;
pub mod config;
pub mod handler;
pub mod locator;
pub mod particle;
pub mod router;
pub mod store;

pub use config::{ParticleHandlerConfig, RestorePolicy};
pub use handler::{HandlerState, ParticleHandler, ParticleRef};
pub use particle::{Particle, ParticleId};
pub use router::SortReport;
