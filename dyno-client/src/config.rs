//! Configuration management for the dyno client.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Components receive the section they need at construction; nothing reads
//! the environment after start-up.

use crate::{DynoError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Build/sync backend URL
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Basic auth user
    #[serde(default)]
    pub user: Option<String>,

    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Platform API used to start and stop remote processes
    #[serde(default = "default_api_url")]
    pub url: String,

    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of parallel upload workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-directory metadata directory name, never synced
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Inactivity timeout; unset disables it (long sessions)
    #[serde(default)]
    pub activity_timeout_secs: Option<u64>,

    /// Process started through the process API to host the session
    #[serde(default = "default_process_command")]
    pub process_command: String,

    /// Main process run on the development dyno
    #[serde(default = "default_command")]
    pub command: String,

    /// Command run for each console connection
    #[serde(default = "default_console_command")]
    pub console_command: String,

    /// Remote port the HTTP tunnel forwards to
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Local port the HTTP tunnel listens on
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Debounce window for file change notifications
    #[serde(default = "default_watch_latency_ms")]
    pub watch_latency_ms: u64,

    #[serde(default = "default_buildpack_url")]
    pub buildpack_url: String,

    #[serde(default = "default_development_slug_url")]
    pub development_slug_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backend_url() -> String {
    "https://api.anvilworks.org".to_string()
}

fn default_api_url() -> String {
    "https://api.heroku.com".to_string()
}

fn default_workers() -> usize {
    40
}

fn default_metadata_dir() -> String {
    ".dyno".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    120
}

fn default_process_command() -> String {
    "bin/development-dyno".to_string()
}

fn default_command() -> String {
    "foreman start -c -p 5000 -m all=1,rake=0,console=0".to_string()
}

fn default_console_command() -> String {
    "env TERM=xterm bash".to_string()
}

fn default_remote_port() -> u16 {
    5000
}

fn default_local_port() -> u16 {
    9000
}

fn default_watch_latency_ms() -> u64 {
    1500
}

fn default_buildpack_url() -> String {
    "https://buildkit.herokuapp.com/buildkit/default.tgz".to_string()
}

fn default_development_slug_url() -> String {
    "https://api.anvilworks.org/slugs/development-dyno.tgz".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            user: None,
            password: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            token: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            metadata_dir: default_metadata_dir(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            activity_timeout_secs: None,
            process_command: default_process_command(),
            command: default_command(),
            console_command: default_console_command(),
            remote_port: default_remote_port(),
            local_port: default_local_port(),
            watch_latency_ms: default_watch_latency_ms(),
            buildpack_url: default_buildpack_url(),
            development_slug_url: default_development_slug_url(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: BackendConfig::default(),
            api: ApiConfig::default(),
            sync: SyncConfig::default(),
            session: SessionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn activity_timeout(&self) -> Option<Duration> {
        self.activity_timeout_secs.map(Duration::from_secs)
    }

    pub fn watch_latency(&self) -> Duration {
        Duration::from_millis(self.watch_latency_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DynoError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| DynoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DYNO_*` environment overrides.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok());
        self.validate()?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("DYNO_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(user) = var("DYNO_BACKEND_USER") {
            self.backend.user = Some(user);
        }
        if let Some(password) = var("DYNO_BACKEND_PASSWORD") {
            self.backend.password = Some(password);
        }
        if let Some(url) = var("DYNO_API_URL") {
            self.api.url = url;
        }
        if let Some(token) = var("DYNO_API_TOKEN") {
            self.api.token = Some(token);
        }
        if let Some(slug) = var("DYNO_DEVELOPMENT_SLUG_URL") {
            self.session.development_slug_url = slug;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sync.workers == 0 {
            return Err(DynoError::Config("sync.workers must be at least 1".into()));
        }
        if self.session.connect_timeout_secs == 0 {
            return Err(DynoError::Config(
                "session.connect_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.workers, 40);
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(120));
        assert!(config.session.activity_timeout().is_none());
        assert_eq!(config.sync.metadata_dir, ".dyno");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [backend]
            url = "http://localhost:5000"

            [sync]
            workers = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.url, "http://localhost:5000");
        assert_eq!(config.sync.workers, 4);
        assert_eq!(config.session.remote_port, 5000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::from_toml("[sync]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, DynoError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DYNO_BACKEND_URL", "http://anvil.test"),
            ("DYNO_BACKEND_USER", "dev@example.com"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.backend.url, "http://anvil.test");
        assert_eq!(config.backend.user.as_deref(), Some("dev@example.com"));
        assert!(config.backend.password.is_none());
    }
}
