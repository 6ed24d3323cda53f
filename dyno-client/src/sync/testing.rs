//! In-memory [`SyncBackend`] that records every call.

use super::backend::{BuildOutput, BuildRequest, SyncBackend};
use crate::manifest::Manifest;
use crate::{DynoError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct RecordingBackend {
    /// Fixed diff answer; `None` reports every manifest hash as missing
    missing: Option<Vec<String>>,
    fail_on: Option<String>,
    build_log: Vec<Bytes>,
    uploads: Mutex<Vec<(String, PathBuf)>>,
    diffs: Mutex<Vec<usize>>,
    saved: Mutex<Vec<usize>>,
    builds: Mutex<Vec<BuildRequest>>,
}

impl RecordingBackend {
    pub fn with_missing(hashes: &[&str]) -> Self {
        Self {
            missing: Some(hashes.iter().map(|h| h.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn failing_on(mut self, hash: &str) -> Self {
        self.fail_on = Some(hash.to_string());
        self
    }

    pub fn with_build_log(mut self, chunks: &[&[u8]]) -> Self {
        self.build_log = chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect();
        self
    }

    pub fn uploads(&self) -> Vec<(String, PathBuf)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn diff_sizes(&self) -> Vec<usize> {
        self.diffs.lock().unwrap().clone()
    }

    pub fn saved_manifests(&self) -> Vec<usize> {
        self.saved.lock().unwrap().clone()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.builds.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncBackend for RecordingBackend {
    async fn missing_hashes(&self, manifest: &Manifest) -> Result<Vec<String>> {
        self.diffs.lock().unwrap().push(manifest.len());
        Ok(match &self.missing {
            Some(hashes) => hashes.clone(),
            None => manifest.entries().map(|(_, e)| e.hash.clone()).collect(),
        })
    }

    async fn upload_file(&self, hash: &str, path: &Path) -> Result<u64> {
        if self.fail_on.as_deref() == Some(hash) {
            return Err(DynoError::Connection(format!("upload of {} refused", hash)));
        }
        tokio::task::yield_now().await;
        self.uploads
            .lock()
            .unwrap()
            .push((hash.to_string(), path.to_path_buf()));
        Ok(1)
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<String> {
        let mut saved = self.saved.lock().unwrap();
        saved.push(manifest.len());
        Ok(format!("http://backend.test/manifests/{}", saved.len()))
    }

    async fn build(&self, _manifest: &Manifest, request: &BuildRequest) -> Result<BuildOutput> {
        self.builds.lock().unwrap().push(request.clone());
        let chunks: Vec<Result<Bytes>> = self.build_log.iter().cloned().map(Ok).collect();
        Ok(BuildOutput {
            slug_url: Some("http://backend.test/slugs/1.tgz".to_string()),
            log: stream::iter(chunks).boxed(),
        })
    }
}
