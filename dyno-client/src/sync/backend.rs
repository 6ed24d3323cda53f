//! Build/sync backend client.
//!
//! [`SyncBackend`] is the seam between the sync engine and the remote
//! content store; [`HttpBackend`] is the reqwest implementation:
//!
//! - `POST /manifest/diff`  form `manifest` → JSON array of missing hashes
//! - `POST /file/{hash}`    raw file bytes (idempotent)
//! - `POST /manifest`       form `manifest` → `Location` of the saved manifest
//! - `POST /manifest/build` form `env`, `manifest`, `buildpack` → streamed log, `x-slug-url`

use crate::config::BackendConfig;
use crate::manifest::Manifest;
use crate::transfer::progress_stream::ProgressStream;
use crate::{DynoError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Parameters of a remote build.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub env: BTreeMap<String, String>,
    pub buildpack: String,
}

/// A running remote build: its raw log stream and the slug it will produce.
pub struct BuildOutput {
    pub slug_url: Option<String>,
    pub log: BoxStream<'static, Result<Bytes>>,
}

#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Hashes from `manifest` the backend does not hold yet.
    async fn missing_hashes(&self, manifest: &Manifest) -> Result<Vec<String>>;

    /// Stream `path` to the content-addressed slot for `hash`. Returns bytes sent.
    async fn upload_file(&self, hash: &str, path: &Path) -> Result<u64>;

    /// Store a manifest remotely and return its URL.
    async fn save_manifest(&self, manifest: &Manifest) -> Result<String>;

    /// Start a build of `manifest`.
    async fn build(&self, manifest: &Manifest, request: &BuildRequest) -> Result<BuildOutput>;
}

/// reqwest-backed [`SyncBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    uploaded_bytes: Arc<AtomicU64>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dyno-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            uploaded_bytes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Running total of file bytes streamed by this backend.
    pub fn uploaded_bytes(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.uploaded_bytes)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }
}

#[async_trait]
impl SyncBackend for HttpBackend {
    async fn missing_hashes(&self, manifest: &Manifest) -> Result<Vec<String>> {
        let response = self
            .post("/manifest/diff")
            .form(&[("manifest", manifest.to_json()?)])
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let missing: Vec<String> = serde_json::from_str(&body)
            .map_err(|e| DynoError::Protocol(format!("malformed diff response: {}", e)))?;

        debug!("Diff: {} of {} files needed", missing.len(), manifest.len());
        Ok(missing)
    }

    async fn upload_file(&self, hash: &str, path: &Path) -> Result<u64> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| DynoError::file_system(path, e))?;

        let stream = ProgressStream::new(ReaderStream::new(file), Arc::clone(&self.uploaded_bytes));
        let body = reqwest::Body::wrap_stream(stream);

        let response = self
            .post(&format!("/file/{}", hash))
            .header("content-type", "application/octet-stream")
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        debug!("Uploaded {} ({} bytes, status {})", hash, size, response.status());
        Ok(size)
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<String> {
        let response = self
            .post("/manifest")
            .form(&[("manifest", manifest.to_json()?)])
            .send()
            .await?
            .error_for_status()?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DynoError::Protocol("saved manifest has no location".into()))?;

        Ok(absolute_url(&self.base_url, location))
    }

    async fn build(&self, manifest: &Manifest, request: &BuildRequest) -> Result<BuildOutput> {
        let env = serde_json::to_string(&request.env)?;
        let response = self
            .post("/manifest/build")
            .form(&[
                ("env", env),
                ("manifest", manifest.to_json()?),
                ("buildpack", request.buildpack.clone()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let slug_url = response
            .headers()
            .get("x-slug-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        info!("Build started (slug: {})", slug_url.as_deref().unwrap_or("unknown"));

        let log = response.bytes_stream().map_err(DynoError::from).boxed();
        Ok(BuildOutput { slug_url, log })
    }
}

fn absolute_url(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}/{}", base, location.trim_start_matches('/'))
    }
}
