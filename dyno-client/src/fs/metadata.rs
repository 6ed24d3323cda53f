//! File metadata recorded in manifest entries.

use std::fs;
use std::path::Path;

/// Timestamps and mode of a single file, at second resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Inode change time (seconds since Unix epoch)
    pub ctime: i64,

    /// Last modified time (seconds since Unix epoch)
    pub mtime: i64,

    /// Full `st_mode`, rendered in octal (e.g. `100644`)
    pub mode: String,
}

impl FileMetadata {
    /// Extract metadata from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            ctime: metadata.ctime(),
            mtime: metadata.mtime(),
            mode: format!("{:o}", metadata.mode()),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let mtime = epoch_secs(metadata.modified().ok());
        let ctime = epoch_secs(metadata.created().ok()).max(mtime);
        let mode = if metadata.permissions().readonly() {
            "100444"
        } else {
            "100644"
        };

        Self {
            ctime,
            mtime,
            mode: mode.to_string(),
        }
    }
}

#[cfg(not(unix))]
fn epoch_secs(time: Option<std::time::SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
