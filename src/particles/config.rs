//! Handler configuration.

use serde::{Deserialize, Serialize};

/// What `restore_from_mesh` does once the attachments are unpacked.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePolicy {
    /// Run a full sort, re-validating every particle against the new mesh.
    #[default]
    AlwaysSort,
    /// Keep the cell each particle was attached to. Valid because an
    /// attachment is only ever delivered to the cell it was written for.
    TrustAttachments,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleHandlerConfig {
    /// Exact byte size of every particle's properties.
    pub payload_size: usize,
    pub restore_policy: RestorePolicy,
    /// Reject a migrating particle whose id is already resident on the
    /// receiving rank.
    pub check_unique_on_sort: bool,
    /// Try the vertex neighbors of the previous cell before a full scan.
    pub search_neighbors_first: bool,
}

impl Default for ParticleHandlerConfig {
    fn default() -> Self {
        Self {
            payload_size: 0,
            restore_policy: RestorePolicy::AlwaysSort,
            check_unique_on_sort: true,
            search_neighbors_first: true,
        }
    }
}

impl ParticleHandlerConfig {
    pub fn with_payload_size(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }

    pub fn with_restore_policy(mut self, policy: RestorePolicy) -> Self {
        self.restore_policy = policy;
        self
    }
}
