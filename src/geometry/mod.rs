//! Geometry primitives and the cell containment oracle.
//!
//! Cells are axis-aligned boxes (quad/oct-tree leaves), so the reference
//! map of a cell is the affine map of its box onto `[0, 1]^D`.

pub mod cartesian;

use crate::topology::cell::CellRef;

/// Axis-aligned bounding box in `D` dimensions.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Aabb<const D: usize> {
    #[serde(with = "serde_arrays")]
    pub lo: [f64; D],
    #[serde(with = "serde_arrays")]
    pub hi: [f64; D],
}

impl<const D: usize> Aabb<D> {
    pub fn new(lo: [f64; D], hi: [f64; D]) -> Self {
        Self { lo, hi }
    }

    /// The unit hypercube `[0, 1]^D`.
    pub fn unit() -> Self {
        Self {
            lo: [0.0; D],
            hi: [1.0; D],
        }
    }

    /// Closed containment test.
    pub fn contains(&self, p: &[f64; D]) -> bool {
        (0..D).all(|k| self.lo[k] <= p[k] && p[k] <= self.hi[k])
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        for k in 0..D {
            out.lo[k] = out.lo[k].min(other.lo[k]);
            out.hi[k] = out.hi[k].max(other.hi[k]);
        }
        out
    }

    /// Grow every side by `eps` times the box extent along that axis.
    pub fn inflate_relative(&self, eps: f64) -> Self {
        let mut out = *self;
        for k in 0..D {
            let pad = eps * (self.hi[k] - self.lo[k]).abs().max(f64::MIN_POSITIVE);
            out.lo[k] -= pad;
            out.hi[k] += pad;
        }
        out
    }

    pub fn extent(&self, axis: usize) -> f64 {
        self.hi[axis] - self.lo[axis]
    }
}

/// Answers whether a global point lies in a cell and where it sits in that
/// cell's reference frame.
///
/// Implementations own the boundary tie-break: a point on a face shared by
/// several cells must be reported as contained by exactly one of them.
pub trait GeometryOracle<const D: usize> {
    fn contains(&self, cell: CellRef, point: &[f64; D]) -> bool;

    /// Reference coordinates of `point` in `cell`; `None` when
    /// [`contains`](Self::contains) is false.
    fn to_reference(&self, cell: CellRef, point: &[f64; D]) -> Option<[f64; D]>;
}

// serde only derives arrays up to 32 for fixed sizes, not const generics.
mod serde_arrays {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, const D: usize>(
        v: &[f64; D],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(s)
    }

    pub fn deserialize<'de, De: Deserializer<'de>, const D: usize>(
        d: De,
    ) -> Result<[f64; D], De::Error> {
        let v = Vec::<f64>::deserialize(d)?;
        let n = v.len();
        v.try_into()
            .map_err(|_| De::Error::custom(format!("expected {D} coordinates, found {n}")))
    }
}
