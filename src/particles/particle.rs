//! `ParticleId` and `Particle`: identity, position and opaque properties.
//!
//! A particle's identifier is chosen by whoever creates it and never reused
//! by the library. Its properties are an uninterpreted byte blob of fixed,
//! handler-wide size that is copied verbatim through every migration and
//! checkpoint.

use bytes::Bytes;
use std::fmt;

/// Globally unique, creator-assigned particle identifier.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ParticleId(u64);

impl ParticleId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        ParticleId(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ParticleId").field(&self.0).finish()
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ParticleId {
    fn from(raw: u64) -> Self {
        ParticleId(raw)
    }
}

/// A point-like particle in `D` space dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct Particle<const D: usize> {
    id: ParticleId,
    position: [f64; D],
    reference_position: [f64; D],
    properties: Bytes,
}

impl<const D: usize> Particle<D> {
    /// New particle with an unset (zero) reference position; the locator
    /// fills it in when the containing cell is established.
    pub fn new(id: impl Into<ParticleId>, position: [f64; D]) -> Self {
        Self {
            id: id.into(),
            position,
            reference_position: [0.0; D],
            properties: Bytes::new(),
        }
    }

    /// Attach opaque property bytes.
    pub fn with_properties(mut self, properties: impl Into<Bytes>) -> Self {
        self.properties = properties.into();
        self
    }

    pub(crate) fn from_parts(
        id: ParticleId,
        position: [f64; D],
        reference_position: [f64; D],
        properties: Bytes,
    ) -> Self {
        Self {
            id,
            position,
            reference_position,
            properties,
        }
    }

    #[inline]
    pub fn id(&self) -> ParticleId {
        self.id
    }

    #[inline]
    pub fn position(&self) -> &[f64; D] {
        &self.position
    }

    /// Coordinates inside the containing cell's reference frame. Only
    /// meaningful after the particle has been sorted.
    #[inline]
    pub fn reference_position(&self) -> &[f64; D] {
        &self.reference_position
    }

    #[inline]
    pub fn properties(&self) -> &Bytes {
        &self.properties
    }

    pub fn set_position(&mut self, position: [f64; D]) {
        self.position = position;
    }

    pub fn set_properties(&mut self, properties: impl Into<Bytes>) {
        self.properties = properties.into();
    }

    pub(crate) fn set_reference_position(&mut self, reference: [f64; D]) {
        self.reference_position = reference;
    }
}
