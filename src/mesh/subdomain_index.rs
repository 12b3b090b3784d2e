//! Coarse spatial index: which ranks might own a cell containing a point.
//!
//! Built once per mesh instance from one allgather of every rank's subdomain
//! bounding box. Lookups are conservative: a rank whose cells contain the
//! point is always among the candidates, others may be too.

use crate::algs::communicator::Communicator;
use crate::geometry::Aabb;
use crate::particle_error::ParticleError;
use bytes::{Buf, BufMut, BytesMut};

/// Relative padding applied to every subdomain box.
pub const INDEX_TOLERANCE: f64 = 1e-10;

#[derive(Clone, Debug, Default)]
pub struct SubdomainIndex<const D: usize> {
    boxes: Vec<Option<Aabb<D>>>,
}

impl<const D: usize> SubdomainIndex<D> {
    /// Collective: gather every rank's box. Ranks owning no cells pass `None`.
    pub fn gather<C>(local: Option<&Aabb<D>>, comm: &C) -> Result<Self, ParticleError>
    where
        C: Communicator + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(1 + 16 * D);
        match local {
            Some(b) => {
                buf.put_u8(1);
                b.lo.iter().chain(&b.hi).for_each(|x| buf.put_f64_le(*x));
            }
            None => buf.put_u8(0),
        }
        let all = comm.allgather(&buf)?;
        let boxes = all
            .iter()
            .enumerate()
            .map(|(peer, raw)| decode_box::<D>(raw).ok_or_else(|| ParticleError::CollectiveDesync {
                peer,
                reason: format!("malformed subdomain box of {} bytes", raw.len()),
            }))
            .collect::<Result<_, _>>()?;
        Ok(Self { boxes })
    }

    /// Index from already known boxes (serial use, tests).
    pub fn from_boxes(boxes: Vec<Option<Aabb<D>>>) -> Self {
        Self { boxes }
    }

    pub fn n_ranks(&self) -> usize {
        self.boxes.len()
    }

    pub fn bounds(&self, rank: usize) -> Option<&Aabb<D>> {
        self.boxes.get(rank).and_then(Option::as_ref)
    }

    /// Ranks whose padded box contains `point`, ascending.
    pub fn candidate_ranks(&self, point: &[f64; D]) -> Vec<usize> {
        self.boxes
            .iter()
            .enumerate()
            .filter_map(|(rank, b)| {
                b.as_ref()
                    .filter(|b| b.inflate_relative(INDEX_TOLERANCE).contains(point))
                    .map(|_| rank)
            })
            .collect()
    }
}

fn decode_box<const D: usize>(mut raw: &[u8]) -> Option<Option<Aabb<D>>> {
    if raw.is_empty() {
        return None;
    }
    match raw.get_u8() {
        0 if raw.is_empty() => Some(None),
        1 if raw.len() == 16 * D => {
            let mut b = Aabb::new([0.0; D], [0.0; D]);
            b.lo.iter_mut().for_each(|x| *x = raw.get_f64_le());
            b.hi.iter_mut().for_each(|x| *x = raw.get_f64_le());
            Some(Some(b))
        }
        _ => None,
    }
}
