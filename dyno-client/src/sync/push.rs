//! Push: manifest a directory, upload what the backend lacks, build it.
//!
//! Any manifest or protocol failure aborts the whole push; nothing from a
//! failed run is reused.

use super::backend::{BuildOutput, BuildRequest, SyncBackend};
use super::diff::resolve_missing;
use super::upload::{UploadScheduler, UploadSummary};
use crate::fs::walker::WalkOptions;
use crate::manifest::Manifest;
use crate::session::command::{InlineCommandParser, LogEvent};
use crate::{DynoError, Result};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

/// Result of syncing a directory's content to the backend.
#[derive(Debug)]
pub struct SyncedManifest {
    pub manifest: Manifest,
    pub needed: usize,
    pub uploaded: UploadSummary,
}

pub struct Pusher {
    backend: Arc<dyn SyncBackend>,
    scheduler: UploadScheduler,
    walk: WalkOptions,
}

impl Pusher {
    pub fn new(backend: Arc<dyn SyncBackend>, workers: usize, walk: WalkOptions) -> Self {
        Self {
            scheduler: UploadScheduler::new(Arc::clone(&backend), workers),
            backend,
            walk,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.backend
    }

    pub fn scheduler(&self) -> &UploadScheduler {
        &self.scheduler
    }

    /// Manifest `dir`, diff it against the backend and upload missing content.
    pub async fn sync_directory(&self, dir: &Path) -> Result<SyncedManifest> {
        let manifest = Manifest::build_async(dir.to_path_buf(), self.walk.clone()).await?;
        info!("Manifest of {}: {} files", dir.display(), manifest.len());

        let missing = resolve_missing(self.backend.as_ref(), &manifest).await?;
        info!("{} files needed", missing.len());

        let uploaded = self.scheduler.upload(&manifest, &missing).await?;

        Ok(SyncedManifest {
            needed: missing.len(),
            manifest,
            uploaded,
        })
    }

    /// Resolve a `--buildpack` argument to a URL.
    ///
    /// A local directory is synced and its manifest saved remotely; anything
    /// else is taken as a URL; no argument means `default_url`.
    pub async fn prepare_buildpack(&self, buildpack: Option<&str>, default_url: &str) -> Result<String> {
        let Some(buildpack) = buildpack else {
            return Ok(default_url.to_string());
        };

        let local = PathBuf::from(buildpack);
        if !local.is_dir() {
            return Ok(buildpack.to_string());
        }

        info!("Synchronizing local buildpack {}", local.display());
        let synced = self.sync_directory(&local).await?;
        self.backend.save_manifest(&synced.manifest).await
    }

    /// Start a remote build of `manifest` and relay its log to `out`.
    ///
    /// Returns the slug URL. A non-zero inline exit becomes `RemoteExit`.
    pub async fn build<W>(&self, manifest: &Manifest, request: &BuildRequest, out: &mut W) -> Result<Option<String>>
    where
        W: AsyncWrite + Unpin,
    {
        let BuildOutput { slug_url, log } = self.backend.build(manifest, request).await?;
        relay_build_log(log, out).await?;
        Ok(slug_url)
    }
}

/// Copy a build log to `out`, acting on inline commands embedded in it.
pub async fn relay_build_log<S, W>(mut log: S, out: &mut W) -> Result<()>
where
    S: futures_util::Stream<Item = Result<bytes::Bytes>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut parser = InlineCommandParser::new();

    while let Some(chunk) = log.next().await {
        for event in parser.feed(&chunk?) {
            match event {
                LogEvent::Output(bytes) => {
                    out.write_all(&bytes).await?;
                    out.flush().await?;
                }
                LogEvent::Exit(status) => return Err(DynoError::RemoteExit(status)),
                LogEvent::Unknown(code) => warn!("unknown[{}]", code),
            }
        }
    }

    if let Some(rest) = parser.finish() {
        out.write_all(&rest).await?;
        out.flush().await?;
    }
    Ok(())
}
