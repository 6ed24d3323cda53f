//! Initial sync: diff a manifest against the backend and upload the gap.

pub mod backend;
pub mod diff;
pub mod push;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BuildRequest, HttpBackend, SyncBackend};
pub use diff::{resolve_missing, MissingHashes};
pub use push::{Pusher, SyncedManifest};
pub use upload::{UploadScheduler, UploadSummary, DEFAULT_WORKERS};
