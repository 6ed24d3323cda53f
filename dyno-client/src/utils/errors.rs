//! Error taxonomy for the dyno client.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DynoError {
    /// A file vanished or became unreadable while it was being manifested.
    #[error("File system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote side sent an explicit `error` control command.
    #[error("{0}")]
    RemoteReported(String),

    #[error("Interrupted")]
    UserInterrupt,

    /// A remote build reported a non-zero status through the inline marker.
    #[error("Build exited with code: {0}")]
    RemoteExit(u8),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DynoError {
    pub fn file_system(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DynoError::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DynoError::UserInterrupt => 0,
            DynoError::RemoteExit(code) => i32::from(*code),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, DynoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DynoError::UserInterrupt.exit_code(), 0);
        assert_eq!(DynoError::RemoteExit(7).exit_code(), 7);
        assert_eq!(DynoError::Protocol("bad".into()).exit_code(), 1);
        assert_eq!(DynoError::RemoteReported("boom".into()).exit_code(), 1);
    }

    #[test]
    fn test_remote_reported_message_is_verbatim() {
        let err = DynoError::RemoteReported("disk full".into());
        assert_eq!(err.to_string(), "disk full");
    }
}
