//! Checkpoint encoding of particles: the per-cell attachment frames and the
//! handler archive.
//!
//! The archive holds only global facts (no per-rank counts), so it is the
//! same on every rank and any rank of a restart can read any copy.

use super::particle::Particle;
use super::store::ParticleStore;
use crate::algs::wire::{RecordLayout, WireKind, cast_slice, put_frame_prefix, take_frame_prefix};
use crate::mesh::attachment::AttachmentHandle;
use crate::particle_error::ParticleError;
use crate::topology::cell::CellRef;
use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};
use std::mem::size_of;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct WireArchive {
    dimension_le: u32,
    payload_size_le: u32,
    attachment_le: u32,
    reserved_le: u32,
    n_global_le: u64,
    next_free_id_le: u64,
}

static_assertions::assert_eq_size!(WireArchive, [u64; 4]);

/// Decoded archive header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub dimension: usize,
    pub payload_size: usize,
    pub attachment: AttachmentHandle,
    pub n_global: u64,
    pub next_free_id: u64,
}

impl ArchiveHeader {
    pub fn encode(&self) -> Bytes {
        let wire = WireArchive {
            dimension_le: (self.dimension as u32).to_le(),
            payload_size_le: (self.payload_size as u32).to_le(),
            attachment_le: self.attachment.get().to_le(),
            reserved_le: 0,
            n_global_le: self.n_global.to_le(),
            next_free_id_le: self.next_free_id.to_le(),
        };
        let mut buf = BytesMut::new();
        put_frame_prefix(&mut buf, WireKind::Archive, 1);
        buf.put_slice(cast_slice(&[wire]));
        buf.freeze()
    }

    /// Decode and check the archive against the restoring handler.
    pub fn decode(mut raw: &[u8], dimension: usize, payload_size: usize) -> Result<Self, ParticleError> {
        let n = take_frame_prefix(&mut raw, WireKind::Archive)?;
        if n != 1 || raw.len() != size_of::<WireArchive>() {
            return Err(ParticleError::ArchiveFormat(format!(
                "archive body has {} bytes, expected one {}-byte record",
                raw.len(),
                size_of::<WireArchive>()
            )));
        }
        let wire: WireArchive = bytemuck::pod_read_unaligned(raw);
        let header = Self {
            dimension: u32::from_le(wire.dimension_le) as usize,
            payload_size: u32::from_le(wire.payload_size_le) as usize,
            attachment: AttachmentHandle::new(u32::from_le(wire.attachment_le)),
            n_global: u64::from_le(wire.n_global_le),
            next_free_id: u64::from_le(wire.next_free_id_le),
        };
        if header.dimension != dimension {
            return Err(ParticleError::ArchiveFormat(format!(
                "archive written in dimension {}, handler has {dimension}",
                header.dimension
            )));
        }
        if header.payload_size != payload_size {
            return Err(ParticleError::ArchiveFormat(format!(
                "archive payload size {} differs from configured {payload_size}",
                header.payload_size
            )));
        }
        Ok(header)
    }
}

/// Bytes `cell` needs in the checkpoint attachment: nothing for an empty
/// cell, a frame of records otherwise.
pub fn cell_attachment_size<const D: usize>(store: &ParticleStore<D>, cell: CellRef, layout: &RecordLayout<D>) -> usize {
    match store.n_in_cell(cell) {
        0 => 0,
        n => layout.frame_len(n),
    }
}

pub fn pack_cell<const D: usize>(store: &ParticleStore<D>, cell: CellRef, layout: &RecordLayout<D>) -> Bytes {
    if store.n_in_cell(cell) == 0 {
        return Bytes::new();
    }
    let particles: Vec<_> = store.particles_in_cell(cell).collect();
    layout.encode(WireKind::CellAttachment, particles.into_iter())
}

pub fn unpack_cell<const D: usize>(raw: &[u8], layout: &RecordLayout<D>) -> Result<Vec<Particle<D>>, ParticleError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    layout.decode(WireKind::CellAttachment, raw)
}
