//! Directory traversal for manifest building.
//!
//! Visits regular files only. Directories and symlinks are never reported,
//! and entries come back in a stable, name-sorted order.

use crate::{DynoError, Result};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Descend into and report dot-files
    pub include_hidden: bool,

    /// Directory or file names that are skipped entirely
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            exclude_names: vec![".dyno".to_string()],
        }
    }
}

impl WalkOptions {
    /// Default options with `metadata_dir` as the reserved directory.
    pub fn with_metadata_dir(metadata_dir: &str) -> Self {
        Self {
            include_hidden: false,
            exclude_names: vec![metadata_dir.to_string()],
        }
    }

    /// Whether an entry called `name` is left out of the walk, along with
    /// everything beneath it.
    pub fn excludes(&self, name: &str) -> bool {
        if !self.include_hidden && name.starts_with('.') {
            return true;
        }
        self.exclude_names.iter().any(|excluded| name == excluded.as_str())
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

/// Walk a directory tree and collect all regular files.
///
/// Any unreadable entry aborts the walk; no partial listing is returned.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, options));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            DynoError::file_system(path, source)
        })?;

        // Regular files only: no directories, no symlinks
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| DynoError::file_system(entry.path(), e.into()))?;

        files.push(FileInfo {
            path: entry.path().to_path_buf(),
            relative_path: relative_path(root, entry.path()),
            size: metadata.len(),
        });
    }

    Ok(files)
}

/// Relative, `/`-separated form of `path` under `root`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Check if a directory entry should be excluded
fn should_exclude(entry: &DirEntry, options: &WalkOptions) -> bool {
    options.excludes(&entry.file_name().to_string_lossy())
}
