//! Self-checks for the bookkeeping structures of the particle layers.

use crate::particle_error::ParticleError;

/// Structures with internal indices that must agree with each other.
pub trait DebugInvariants {
    /// First inconsistency found, if any.
    fn validate_invariants(&self) -> Result<(), ParticleError>;

    /// Panics on an inconsistency in debug builds or with the
    /// `check-invariants` feature; no-op otherwise.
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self);
    }
}

/// Validate `$target` (anything implementing [`DebugInvariants`]) and panic
/// with its type name when invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($target:expr) => {{
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        {
            if let Err(e) = $crate::debug_invariants::DebugInvariants::validate_invariants($target) {
                panic!("[invariants] {}: {}", ::std::any::type_name_of_val($target), e);
            }
        }
    }};
}
