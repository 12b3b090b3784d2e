//! Fixed, versioned, little-endian wire types for migration and checkpoints.
//!
//! Every frame starts with a [`WireHdr`] naming its [`WireKind`] and a
//! [`WireCount`] of the records that follow. Particle records have a fixed
//! stride per handler (see [`RecordLayout`]) and always carry the particle
//! identifier explicitly, so a frame is self-delimiting and never depends on
//! the order particles appear in.

use crate::particle_error::ParticleError;
use crate::particles::particle::{Particle, ParticleId};
use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// What a frame contains.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum WireKind {
    /// Particles handed to a candidate owner (no reference coordinates).
    Migrate = 1,
    /// Identifiers adopted by the receiving rank.
    Ack = 2,
    /// Particles of one cell attached to a mesh checkpoint.
    CellAttachment = 3,
    /// Particle handler archive header.
    Archive = 4,
    /// Identifiers sent to their hash bucket owner for a uniqueness check.
    IdBucket = 5,
    /// One rank's cells in a mesh checkpoint.
    MeshPiece = 6,
}

impl WireKind {
    fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => WireKind::Migrate,
            2 => WireKind::Ack,
            3 => WireKind::CellAttachment,
            4 => WireKind::Archive,
            5 => WireKind::IdBucket,
            6 => WireKind::MeshPiece,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,  // = WIRE_VERSION.to_le()
    pub kind_le: u16,     // WireKind
    pub reserved_le: u32, // future use; keep zero
}

impl WireHdr {
    pub fn new(kind: WireKind) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: (kind as u16).to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> Option<WireKind> {
        WireKind::from_u16(u16::from_le(self.kind_le))
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32, // count of following records
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// Size of the header + count prefix of every frame.
pub const FRAME_PREFIX: usize = size_of::<WireHdr>() + size_of::<WireCount>();

static_assertions::assert_eq_size!(WireHdr, u64);
static_assertions::assert_eq_size!(WireCount, u32);

/// Start a frame of `count` records of `kind`.
pub fn put_frame_prefix(buf: &mut BytesMut, kind: WireKind, count: usize) {
    buf.put_slice(cast_slice(&[WireHdr::new(kind)]));
    buf.put_slice(cast_slice(&[WireCount::new(count)]));
}

/// Consume and validate a frame prefix; returns the record count.
pub fn take_frame_prefix(buf: &mut &[u8], expected: WireKind) -> Result<usize, ParticleError> {
    if buf.len() < FRAME_PREFIX {
        return Err(ParticleError::ArchiveFormat(format!(
            "frame of {} bytes is shorter than its {FRAME_PREFIX}-byte prefix",
            buf.len()
        )));
    }
    let hdr: WireHdr = bytemuck::pod_read_unaligned(&buf[..size_of::<WireHdr>()]);
    let cnt: WireCount =
        bytemuck::pod_read_unaligned(&buf[size_of::<WireHdr>()..FRAME_PREFIX]);
    buf.advance(FRAME_PREFIX);
    if hdr.version() != WIRE_VERSION {
        return Err(ParticleError::ArchiveFormat(format!(
            "wire version {} is not supported (expected {WIRE_VERSION})",
            hdr.version()
        )));
    }
    match hdr.kind() {
        Some(kind) if kind == expected => Ok(cnt.get()),
        other => Err(ParticleError::ArchiveFormat(format!(
            "expected a {expected:?} frame, found {other:?}"
        ))),
    }
}

/// Fixed-stride particle record layout:
/// `id u64 | position D×f64 | [reference D×f64] | properties`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordLayout<const D: usize> {
    pub payload_size: usize,
    pub with_reference: bool,
}

impl<const D: usize> RecordLayout<D> {
    /// Records exchanged between ranks; the receiver re-derives the cell.
    pub const fn migration(payload_size: usize) -> Self {
        Self {
            payload_size,
            with_reference: false,
        }
    }

    /// Records attached to a mesh checkpoint.
    pub const fn checkpoint(payload_size: usize) -> Self {
        Self {
            payload_size,
            with_reference: true,
        }
    }

    pub const fn stride(&self) -> usize {
        let coords = if self.with_reference { 2 * D } else { D };
        size_of::<u64>() + coords * size_of::<f64>() + self.payload_size
    }

    /// Bytes of a frame holding `n` records.
    pub const fn frame_len(&self, n: usize) -> usize {
        FRAME_PREFIX + n * self.stride()
    }

    pub fn put(&self, buf: &mut BytesMut, particle: &Particle<D>) {
        buf.put_u64_le(particle.id().get());
        for x in particle.position() {
            buf.put_f64_le(*x);
        }
        if self.with_reference {
            for x in particle.reference_position() {
                buf.put_f64_le(*x);
            }
        }
        buf.put_slice(particle.properties());
    }

    pub fn take(&self, buf: &mut &[u8]) -> Result<Particle<D>, ParticleError> {
        if buf.remaining() < self.stride() {
            return Err(ParticleError::ArchiveFormat(format!(
                "particle record needs {} bytes, {} left",
                self.stride(),
                buf.remaining()
            )));
        }
        let id = ParticleId::new(buf.get_u64_le());
        let mut position = [0.0; D];
        for x in &mut position {
            *x = buf.get_f64_le();
        }
        let mut reference = [0.0; D];
        if self.with_reference {
            for x in &mut reference {
                *x = buf.get_f64_le();
            }
        }
        let properties = Bytes::copy_from_slice(&buf[..self.payload_size]);
        buf.advance(self.payload_size);
        Ok(Particle::from_parts(id, position, reference, properties))
    }

    /// Encode a whole frame.
    pub fn encode<'a, I>(&self, kind: WireKind, particles: I) -> Bytes
    where
        I: ExactSizeIterator<Item = &'a Particle<D>>,
    {
        let mut buf = BytesMut::with_capacity(self.frame_len(particles.len()));
        put_frame_prefix(&mut buf, kind, particles.len());
        for p in particles {
            self.put(&mut buf, p);
        }
        buf.freeze()
    }

    /// Decode a whole frame; trailing bytes are an error.
    pub fn decode(&self, kind: WireKind, mut raw: &[u8]) -> Result<Vec<Particle<D>>, ParticleError> {
        let n = take_frame_prefix(&mut raw, kind)?;
        if raw.len() != n * self.stride() {
            return Err(ParticleError::ArchiveFormat(format!(
                "{kind:?} frame announces {n} records of {} bytes but carries {} bytes",
                self.stride(),
                raw.len()
            )));
        }
        (0..n).map(|_| self.take(&mut raw)).collect()
    }
}

/// Encode a frame of bare identifiers.
pub fn encode_ids(kind: WireKind, ids: &[ParticleId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX + ids.len() * size_of::<u64>());
    put_frame_prefix(&mut buf, kind, ids.len());
    for id in ids {
        buf.put_u64_le(id.get());
    }
    buf.freeze()
}

pub fn decode_ids(kind: WireKind, mut raw: &[u8]) -> Result<Vec<ParticleId>, ParticleError> {
    let n = take_frame_prefix(&mut raw, kind)?;
    if raw.len() != n * size_of::<u64>() {
        return Err(ParticleError::ArchiveFormat(format!(
            "{kind:?} frame announces {n} ids but carries {} bytes",
            raw.len()
        )));
    }
    Ok((0..n).map(|_| ParticleId::new(raw.get_u64_le())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_guard() {
        let hdr = WireHdr::new(WireKind::Ack);
        assert_eq!(hdr.version(), WIRE_VERSION);
        assert_eq!(hdr.kind(), Some(WireKind::Ack));
    }

    #[test]
    fn stride_accounts_for_reference_and_payload() {
        assert_eq!(RecordLayout::<2>::migration(4).stride(), 8 + 16 + 4);
        assert_eq!(RecordLayout::<3>::checkpoint(0).stride(), 8 + 48);
    }

    #[test]
    fn checkpoint_record_keeps_reference_and_properties() {
        let layout = RecordLayout::<2>::checkpoint(3);
        let mut p = Particle::new(11u64, [0.25, 0.75]).with_properties(vec![7u8, 8, 9]);
        p.set_reference_position([0.5, 0.125]);
        let frame = layout.encode(WireKind::CellAttachment, [p.clone()].iter());
        assert_eq!(frame.len(), layout.frame_len(1));
        let back = layout.decode(WireKind::CellAttachment, &frame).unwrap();
        assert_eq!(back, vec![p]);
    }

    #[test]
    fn migration_record_drops_reference() {
        let layout = RecordLayout::<1>::migration(0);
        let mut p = Particle::new(2u64, [0.3]);
        p.set_reference_position([0.9]);
        let frame = layout.encode(WireKind::Migrate, [p].iter());
        let back = layout.decode(WireKind::Migrate, &frame).unwrap();
        assert_eq!(back[0].reference_position(), &[0.0]);
        assert_eq!(back[0].position(), &[0.3]);
    }

    #[test]
    fn wrong_kind_and_truncation_are_rejected() {
        let frame = encode_ids(WireKind::Ack, &[ParticleId::new(1), ParticleId::new(2)]);
        assert!(matches!(
            decode_ids(WireKind::IdBucket, &frame),
            Err(ParticleError::ArchiveFormat(_))
        ));
        assert!(matches!(
            decode_ids(WireKind::Ack, &frame[..frame.len() - 1]),
            Err(ParticleError::ArchiveFormat(_))
        ));
        let ids = decode_ids(WireKind::Ack, &frame).unwrap();
        assert_eq!(ids, vec![ParticleId::new(1), ParticleId::new(2)]);
    }
}
