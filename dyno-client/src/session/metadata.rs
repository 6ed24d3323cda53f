//! Per-directory metadata record.
//!
//! One small file per key under the directory's metadata folder
//! (`.dyno/console.port`), shared between a running session and the
//! `console` command.

use crate::{DynoError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const CONSOLE_PORT: &str = "console.port";

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(root: &Path, metadata_dir: &str) -> Self {
        Self {
            dir: root.join(metadata_dir),
        }
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Value stored under `key`, or `None` if it was never written.
    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DynoError::file_system(path, e)),
        }
    }

    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| DynoError::file_system(&self.dir, e))?;
        let path = self.path(key);
        fs::write(&path, value).map_err(|e| DynoError::file_system(path, e))
    }

    pub fn console_port(&self) -> Result<Option<u16>> {
        match self.read(CONSOLE_PORT)? {
            Some(value) => value.parse().map(Some).map_err(|_| {
                DynoError::Config(format!("invalid {} value: {:?}", CONSOLE_PORT, value))
            }),
            None => Ok(None),
        }
    }

    pub fn set_console_port(&self, port: u16) -> Result<()> {
        self.write(CONSOLE_PORT, &port.to_string())
    }
}
