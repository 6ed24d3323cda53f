//! Diff resolution: which content hashes must travel over the wire.
//!
//! The remote answer is authoritative. Hashes are never filtered locally;
//! a hash the local manifest cannot account for is a protocol error.

use super::backend::SyncBackend;
use crate::manifest::Manifest;
use crate::{DynoError, Result};
use std::collections::BTreeSet;

/// Content hashes the remote side does not hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingHashes(BTreeSet<String>);

impl MissingHashes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.0.contains(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl FromIterator<String> for MissingHashes {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        MissingHashes(iter.into_iter().collect())
    }
}

/// Ask `backend` which of `manifest`'s hashes it is missing.
pub async fn resolve_missing(backend: &dyn SyncBackend, manifest: &Manifest) -> Result<MissingHashes> {
    let missing: MissingHashes = backend.missing_hashes(manifest).await?.into_iter().collect();

    if let Some(unknown) = missing.iter().find(|hash| manifest.path_for_hash(hash).is_none()) {
        return Err(DynoError::Protocol(format!(
            "diff referenced unknown hash {}",
            unknown
        )));
    }

    Ok(missing)
}
