//! Saving and reloading a [`PartitionedMesh`] together with its attachments.
//!
//! Layout in a [`CheckpointStore`]:
//! - `<tag>.mesh.json`: [`MeshCheckpointMetadata`], written by rank 0.
//! - `<tag>.rank<r>.cells`: one [`WireKind::MeshPiece`] frame per writer
//!   rank. After the frame prefix comes the attachment count (`u32`), then
//!   per cell its `TreeCell` key (`level u8`, `coords D×u32`) followed by one
//!   length-prefixed blob per attachment.
//!
//! Cells are keyed by `TreeCell`, never by `CellRef`, so a checkpoint can be
//! loaded on any number of ranks: every reader decodes all pieces, rebuilds
//! the leaf set and keeps the chunk the current partition assigns to it.

use super::attachment::Attachment;
use super::{CheckpointPhase, PartitionedMesh, chunk_range};
use crate::algs::communicator::Communicator;
use crate::algs::exchange::agree;
use crate::algs::wire::{WireKind, put_frame_prefix, take_frame_prefix};
use crate::forest::{Forest, TreeCell};
use crate::geometry::Aabb;
use crate::io::CheckpointStore;
use crate::particle_error::ParticleError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MESH_CHECKPOINT_VERSION: u32 = 1;

/// Global description of a saved mesh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshCheckpointMetadata {
    /// Metadata format version.
    pub version: u32,
    /// Dimension of the tree cells.
    pub dimension: usize,
    /// Dimension of the space the cells are embedded in.
    pub space_dimension: usize,
    pub domain_lo: Vec<f64>,
    pub domain_hi: Vec<f64>,
    /// Number of `<tag>.rank<r>.cells` pieces.
    pub n_pieces: usize,
    /// Total number of leaves over all pieces.
    pub n_cells: u64,
    /// Attachments stored with every cell.
    pub n_attachments: usize,
}

pub fn metadata_name(tag: &str) -> String {
    format!("{tag}.mesh.json")
}

pub fn piece_name(tag: &str, rank: usize) -> String {
    format!("{tag}.rank{rank}.cells")
}

type CellBlobs<const D: usize> = (TreeCell<D>, Vec<Bytes>);

impl<const D: usize, const S: usize> PartitionedMesh<D, S> {
    /// Collective: write this mesh and every registered attachment under
    /// `tag`. Each attachment must be completely filled. Registered
    /// attachments are consumed.
    pub fn save<St, C>(&mut self, store: &St, tag: &str, comm: &C) -> Result<(), ParticleError>
    where
        St: CheckpointStore + ?Sized,
        C: Communicator + ?Sized,
    {
        let filled = self.check_attachments_filled();
        agree(comm, filled)?;

        let n_cells = comm.allreduce_sum(self.cells.len() as u64)?;
        let written = self.write_pieces(store, tag, n_cells, comm);
        agree(comm, written)?;
        comm.barrier()?;

        self.attachments.clear();
        self.phase = CheckpointPhase::Saved(tag.to_owned());
        self.save_epoch += 1;
        log::info!(
            "[mesh] rank {} saved checkpoint `{tag}` ({} of {n_cells} cells)",
            self.rank,
            self.cells.len()
        );
        Ok(())
    }

    fn check_attachments_filled(&self) -> Result<(), ParticleError> {
        for (handle, attachment) in self.attachments.iter() {
            if let Some(slot) = attachment.first_unfilled() {
                return Err(ParticleError::order(
                    "save",
                    format!(
                        "{} with attachment {} unfilled for cell {}",
                        self.phase,
                        handle.get(),
                        self.cell_ref(slot)
                    ),
                ));
            }
        }
        Ok(())
    }

    fn write_pieces<St, C>(&self, store: &St, tag: &str, n_cells: u64, comm: &C) -> Result<(), ParticleError>
    where
        St: CheckpointStore + ?Sized,
        C: Communicator + ?Sized,
    {
        if comm.rank() == 0 {
            let meta = MeshCheckpointMetadata {
                version: MESH_CHECKPOINT_VERSION,
                dimension: D,
                space_dimension: S,
                domain_lo: self.domain.lo.to_vec(),
                domain_hi: self.domain.hi.to_vec(),
                n_pieces: comm.size(),
                n_cells,
                n_attachments: self.attachments.len(),
            };
            let json = serde_json::to_vec_pretty(&meta)
                .map_err(|e| ParticleError::MeshCheckpoint(e.to_string()))?;
            store.write(&metadata_name(tag), &json)?;
        }
        store.write(&piece_name(tag, comm.rank()), &self.encode_piece())
    }

    fn encode_piece(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_frame_prefix(&mut buf, WireKind::MeshPiece, self.cells.len());
        buf.put_u32_le(self.attachments.len() as u32);
        for (slot, cell) in self.cells.iter().enumerate() {
            buf.put_u8(cell.tree.level);
            cell.tree.coords.iter().for_each(|&c| buf.put_u32_le(c));
            for (_, attachment) in self.attachments.iter() {
                let blob = attachment.bytes_or_empty(slot);
                buf.put_u32_le(blob.len() as u32);
                buf.put_slice(&blob);
            }
        }
        buf.freeze()
    }

    /// Collective: replace this (cleared) mesh by the checkpoint `tag`,
    /// repartitioned over the current communicator. Attachments become
    /// readable through [`read_attachment`](Self::read_attachment).
    pub fn load<St, C>(&mut self, store: &St, tag: &str, comm: &C) -> Result<(), ParticleError>
    where
        St: CheckpointStore + ?Sized,
        C: Communicator + ?Sized,
    {
        let read = if self.is_cleared() {
            read_checkpoint::<D, St>(store, tag, S)
        } else {
            Err(ParticleError::order("load", format!("{} with live cells", self.phase)))
        };
        let (meta, mut cells) = agree(comm, read)?;

        let leaves = Forest::from_leaves(cells.iter().map(|(tree, _)| *tree))
            .ok_or_else(|| {
                ParticleError::MeshCheckpoint(format!("cells of `{tag}` do not tile the domain"))
            })?
            .morton_sorted_leaves();
        let range = chunk_range(leaves.len(), comm.size(), comm.rank());
        let local = leaves[range].to_vec();

        self.domain = domain_of(&meta)?;
        self.assemble(local, comm)?;

        let mut blobs: HashMap<TreeCell<D>, Vec<Bytes>> = cells
            .drain(..)
            .filter(|(tree, _)| self.lookup.contains_key(tree))
            .collect();
        self.attachments.clear();
        for a in 0..meta.n_attachments {
            let data = self
                .cells
                .iter()
                .map(|c| {
                    blobs
                        .get_mut(&c.tree)
                        .and_then(|per| per.get_mut(a).map(std::mem::take))
                        .unwrap_or_default()
                })
                .collect();
            self.attachments.push(Attachment::loaded(data));
        }
        self.phase = CheckpointPhase::Loaded(tag.to_owned());
        log::info!(
            "[mesh] rank {} loaded checkpoint `{tag}` ({} of {} cells, {} attachment(s), written by {} rank(s))",
            self.rank,
            self.cells.len(),
            meta.n_cells,
            meta.n_attachments,
            meta.n_pieces
        );
        Ok(())
    }
}

fn domain_of<const D: usize>(meta: &MeshCheckpointMetadata) -> Result<Aabb<D>, ParticleError> {
    let lo: [f64; D] = meta.domain_lo.as_slice().try_into().map_err(|_| {
        ParticleError::MeshCheckpoint(format!("domain has {} coordinates", meta.domain_lo.len()))
    })?;
    let hi: [f64; D] = meta.domain_hi.as_slice().try_into().map_err(|_| {
        ParticleError::MeshCheckpoint(format!("domain has {} coordinates", meta.domain_hi.len()))
    })?;
    Ok(Aabb::new(lo, hi))
}

fn read_checkpoint<const D: usize, St>(
    store: &St,
    tag: &str,
    space_dimension: usize,
) -> Result<(MeshCheckpointMetadata, Vec<CellBlobs<D>>), ParticleError>
where
    St: CheckpointStore + ?Sized,
{
    let raw = store.read(&metadata_name(tag))?;
    let meta: MeshCheckpointMetadata = serde_json::from_slice(&raw)
        .map_err(|e| ParticleError::MeshCheckpoint(e.to_string()))?;
    if meta.version != MESH_CHECKPOINT_VERSION {
        return Err(ParticleError::MeshCheckpoint(format!(
            "metadata version {} is not supported (expected {MESH_CHECKPOINT_VERSION})",
            meta.version
        )));
    }
    if (meta.dimension, meta.space_dimension) != (D, space_dimension) {
        return Err(ParticleError::MeshCheckpoint(format!(
            "checkpoint `{tag}` is a {}-d mesh in {}-d space, mesh is {D}-d in {space_dimension}-d",
            meta.dimension, meta.space_dimension
        )));
    }
    domain_of::<D>(&meta)?;

    let mut cells = Vec::with_capacity(meta.n_cells as usize);
    for rank in 0..meta.n_pieces {
        let piece = store.read(&piece_name(tag, rank))?;
        decode_piece::<D>(&piece, meta.n_attachments, &mut cells)
            .map_err(|e| ParticleError::MeshCheckpoint(format!("piece {rank} of `{tag}`: {e}")))?;
    }
    if cells.len() as u64 != meta.n_cells {
        return Err(ParticleError::MeshCheckpoint(format!(
            "`{tag}` announces {} cells, pieces hold {}",
            meta.n_cells,
            cells.len()
        )));
    }
    Ok((meta, cells))
}

fn decode_piece<const D: usize>(
    mut raw: &[u8],
    n_attachments: usize,
    out: &mut Vec<CellBlobs<D>>,
) -> Result<(), String> {
    let n = take_frame_prefix(&mut raw, WireKind::MeshPiece).map_err(|e| e.to_string())?;
    let need = |raw: &[u8], k: usize| {
        if raw.remaining() < k {
            Err(format!("truncated: need {k} bytes, {} left", raw.remaining()))
        } else {
            Ok(())
        }
    };
    need(raw, 4)?;
    let stored = raw.get_u32_le() as usize;
    if stored != n_attachments {
        return Err(format!("{stored} attachments, metadata says {n_attachments}"));
    }
    for _ in 0..n {
        need(raw, 1 + 4 * D)?;
        let level = raw.get_u8();
        let mut coords = [0u32; D];
        coords.iter_mut().for_each(|c| *c = raw.get_u32_le());
        let tree = TreeCell { level, coords };
        let mut blobs = Vec::with_capacity(n_attachments);
        for _ in 0..n_attachments {
            need(raw, 4)?;
            let len = raw.get_u32_le() as usize;
            need(raw, len)?;
            blobs.push(Bytes::copy_from_slice(&raw[..len]));
            raw.advance(len);
        }
        out.push((tree, blobs));
    }
    if raw.has_remaining() {
        return Err(format!("{} trailing bytes", raw.remaining()));
    }
    Ok(())
}
