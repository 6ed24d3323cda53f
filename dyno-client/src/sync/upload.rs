//! Parallel upload of missing content.
//!
//! Each missing hash lands in exactly one of `workers` buckets, picked by
//! hashing the hash string. One task per non-empty bucket uploads its
//! hashes in sequence. The first failure aborts every other worker and
//! becomes the scheduler's result; there is no partial-success report.
//! Uploading content the remote already has is a no-op, so a failed run
//! can simply be retried.

use super::backend::SyncBackend;
use super::diff::MissingHashes;
use crate::manifest::Manifest;
use crate::{DynoError, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default upload parallelism.
pub const DEFAULT_WORKERS: usize = 40;

/// Totals of a completed upload run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: usize,
    pub bytes: u64,
}

pub struct UploadScheduler {
    backend: Arc<dyn SyncBackend>,
    workers: usize,
}

impl UploadScheduler {
    pub fn new(backend: Arc<dyn SyncBackend>, workers: usize) -> Self {
        Self {
            backend,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Bucket index of `hash` among `workers` buckets.
    pub fn bucket_for(hash: &str, workers: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        hash.hash(&mut hasher);
        (hasher.finish() % workers.max(1) as u64) as usize
    }

    /// Split `missing` into this scheduler's buckets.
    pub fn buckets(&self, missing: &MissingHashes) -> Vec<Vec<String>> {
        let mut buckets = vec![Vec::new(); self.workers];
        for hash in missing.iter() {
            buckets[Self::bucket_for(hash, self.workers)].push(hash.clone());
        }
        buckets
    }

    /// Upload every missing hash exactly once and wait for all workers.
    pub async fn upload(&self, manifest: &Manifest, missing: &MissingHashes) -> Result<UploadSummary> {
        if missing.is_empty() {
            return Ok(UploadSummary::default());
        }

        let mut work: Vec<Vec<(String, PathBuf)>> = Vec::with_capacity(self.workers);
        for bucket in self.buckets(missing) {
            let mut resolved = Vec::with_capacity(bucket.len());
            for hash in bucket {
                let source = manifest.source_for_hash(&hash).ok_or_else(|| {
                    DynoError::Protocol(format!("no local file for hash {}", hash))
                })?;
                resolved.push((hash, source));
            }
            work.push(resolved);
        }

        let active = work.iter().filter(|b| !b.is_empty()).count();
        info!("Uploading {} files with {} workers", missing.len(), active);

        let mut workers = JoinSet::new();
        for (index, bucket) in work.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let backend = Arc::clone(&self.backend);
            workers.spawn(async move {
                let mut summary = UploadSummary::default();
                for (hash, path) in bucket {
                    summary.bytes += backend.upload_file(&hash, &path).await?;
                    summary.files += 1;
                }
                debug!("Upload worker {} finished {} files", index, summary.files);
                Ok::<_, DynoError>(summary)
            });
        }

        let mut total = UploadSummary::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(summary)) => {
                    total.files += summary.files;
                    total.bytes += summary.bytes;
                }
                Ok(Err(e)) => {
                    warn!("Upload worker failed, aborting remaining uploads: {}", e);
                    workers.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    workers.abort_all();
                    return Err(DynoError::Io(std::io::Error::other(format!(
                        "upload worker panicked: {}",
                        e
                    ))));
                }
            }
        }

        info!("Uploaded {} files ({} bytes)", total.files, total.bytes);
        Ok(total)
    }
}
