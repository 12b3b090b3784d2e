//! Named-blob storage for mesh checkpoints.
//!
//! A checkpoint is a handful of named byte blobs (`<tag>.mesh.json`,
//! `<tag>.rank<r>.cells`). [`CheckpointStore`] abstracts where they live:
//! [`DirStore`] writes them into a directory, [`MemoryStore`] keeps them in a
//! map shared by all in-process ranks.

use crate::particle_error::ParticleError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage backend for checkpoint blobs. Names are flat (no separators).
pub trait CheckpointStore: Send + Sync {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), ParticleError>;
    fn read(&self, name: &str) -> Result<Bytes, ParticleError>;
    fn exists(&self, name: &str) -> bool;
}

/// Checkpoint blobs as files in one directory.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Use `root`, creating it if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ParticleError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl CheckpointStore for DirStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), ParticleError> {
        // Readers only ever see complete blobs.
        let tmp = self.path_of(&format!("{name}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path_of(name))?;
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Bytes, ParticleError> {
        Ok(Bytes::from(fs::read(self.path_of(name))?))
    }

    fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }
}

/// In-memory store; clones share the same blobs.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    blobs: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.blobs.lock().keys().cloned().collect()
    }

    pub fn remove(&self, name: &str) -> Option<Bytes> {
        self.blobs.lock().remove(name)
    }
}

impl CheckpointStore for MemoryStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), ParticleError> {
        self.blobs
            .lock()
            .insert(name.to_owned(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Bytes, ParticleError> {
        self.blobs.lock().get(name).cloned().ok_or_else(|| {
            ParticleError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no checkpoint blob named `{name}`"),
            ))
        })
    }

    fn exists(&self, name: &str) -> bool {
        self.blobs.lock().contains_key(name)
    }
}
