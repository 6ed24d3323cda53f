//! Remote process control.
//!
//! A live session is hosted by a process started through the platform API;
//! starting it yields the rendezvous URL the session dials.

use crate::config::ApiConfig;
use crate::{DynoError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A started remote process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StartedProcess {
    pub process: String,
    pub rendezvous_url: String,
}

#[async_trait]
pub trait ProcessApi: Send + Sync {
    /// Release `slug_url` as the app's current code.
    async fn release(&self, app: &str, description: &str, slug_url: &str) -> Result<()>;

    /// Start `command` attached, with `env` added to its environment.
    async fn start(&self, app: &str, command: &str, env: &BTreeMap<String, String>) -> Result<StartedProcess>;

    async fn stop(&self, app: &str, process: &str) -> Result<()>;
}

/// Stop `process` without waiting for the outcome.
pub fn stop_in_background(api: Arc<dyn ProcessApi>, app: String, process: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        match api.stop(&app, &process).await {
            Ok(()) => debug!("Stopped {} on {}", process, app),
            Err(e) => debug!("Stopping {} on {} failed: {}", process, app, e),
        }
    })
}

/// How long a finished session waits for the remote stop to go out.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Stop `process` in the background and give the request up to `grace` to
/// complete. Returns whether it did; the outcome itself is only logged.
pub async fn stop_with_grace(api: Arc<dyn ProcessApi>, app: String, process: String, grace: Duration) -> bool {
    let stop = stop_in_background(api, app, process);
    match tokio::time::timeout(grace, stop).await {
        Ok(_) => true,
        Err(_) => {
            warn!("Remote stop still pending after {}ms, leaving it", grace.as_millis());
            false
        }
    }
}

/// reqwest-backed [`ProcessApi`].
pub struct HttpProcessApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpProcessApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dyno-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.basic_auth("", Some(token)),
            None => request,
        }
    }
}

/// Form fields for a process start.
fn start_form(command: &str, env: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut form = vec![
        ("command".to_string(), command.to_string()),
        ("attach".to_string(), "true".to_string()),
    ];
    form.extend(
        env.iter()
            .map(|(key, value)| (format!("ps_env[{}]", key), value.clone())),
    );
    form
}

#[async_trait]
impl ProcessApi for HttpProcessApi {
    async fn release(&self, app: &str, description: &str, slug_url: &str) -> Result<()> {
        self.post(&format!("/apps/{}/releases", app))
            .form(&[("description", description), ("slug_url", slug_url)])
            .send()
            .await?
            .error_for_status()?;
        info!("Released {} on {}", slug_url, app);
        Ok(())
    }

    async fn start(&self, app: &str, command: &str, env: &BTreeMap<String, String>) -> Result<StartedProcess> {
        let response = self
            .post(&format!("/apps/{}/ps", app))
            .form(&start_form(command, env))
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let started: StartedProcess = serde_json::from_str(&body)
            .map_err(|e| DynoError::Protocol(format!("malformed process start response: {}", e)))?;

        info!("Started {} on {}", started.process, app);
        Ok(started)
    }

    async fn stop(&self, app: &str, process: &str) -> Result<()> {
        let response = self
            .post(&format!("/apps/{}/ps/stop", app))
            .form(&[("ps", process)])
            .send()
            .await?;
        if !response.status().is_success() {
            warn!("Stop of {} answered {}", process, response.status());
        }
        Ok(())
    }
}
