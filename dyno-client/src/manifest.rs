//! Content-addressed manifests of a directory tree.
//!
//! A manifest maps every regular file's relative path to its timestamps,
//! mode and the SHA-256 of its full contents. It serializes to the JSON
//! object the build backend expects:
//!
//! ```json
//! { "app/main.rb": { "ctime": 1700000000, "mtime": 1700000000, "mode": "100644", "hash": "ab12..." } }
//! ```

use crate::fs::metadata::FileMetadata;
use crate::fs::walker::{relative_path, walk_directory, WalkOptions};
use crate::{DynoError, Result};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Metadata for a single file. The relative path is the manifest key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub ctime: i64,
    pub mtime: i64,
    pub mode: String,
    pub hash: String,
}

impl ManifestEntry {
    /// Snapshot one file. Any read failure is a `FileSystem` error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let metadata = FileMetadata::from_path(path).map_err(|e| DynoError::file_system(path, e))?;
        let hash = hash_file(path)?;

        Ok(Self {
            ctime: metadata.ctime,
            mtime: metadata.mtime,
            mode: metadata.mode,
            hash,
        })
    }
}

/// Hex SHA-256 of a file's full contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| DynoError::file_system(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| DynoError::file_system(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Snapshot of a directory: relative path → entry, plus a hash → path index.
#[derive(Debug, Clone)]
pub struct Manifest {
    root: PathBuf,
    files: BTreeMap<String, ManifestEntry>,
    // hash -> lexicographically smallest path holding that content
    by_hash: HashMap<String, String>,
}

impl Manifest {
    /// Empty manifest rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: BTreeMap::new(),
            by_hash: HashMap::new(),
        }
    }

    /// Walk `root` and snapshot every regular file.
    ///
    /// All-or-nothing: the first unreadable file fails the whole build.
    pub fn build(root: &Path, options: &WalkOptions) -> Result<Self> {
        let mut manifest = Manifest::new(root);

        for file in walk_directory(root, options)? {
            let entry = ManifestEntry::from_file(&file.path)?;
            manifest.insert(file.relative_path, entry);
        }

        debug!(
            "Built manifest for {}: {} files",
            root.display(),
            manifest.len()
        );
        Ok(manifest)
    }

    /// [`Manifest::build`] on the blocking pool.
    pub async fn build_async(root: PathBuf, options: WalkOptions) -> Result<Self> {
        tokio::task::spawn_blocking(move || Manifest::build(&root, &options))
            .await
            .map_err(|e| DynoError::Io(std::io::Error::other(e)))?
    }

    /// Single-file manifest for `path` under `root`.
    pub fn for_file(root: &Path, path: &Path) -> Result<Self> {
        let mut manifest = Manifest::new(root);
        let entry = ManifestEntry::from_file(path)?;
        manifest.insert(relative_path(root, path), entry);
        Ok(manifest)
    }

    /// Add or replace an entry. The reverse index keeps the smallest path per hash.
    pub fn insert(&mut self, path: String, entry: ManifestEntry) {
        if let Some(previous) = self.files.get(&path) {
            if previous.hash != entry.hash && self.by_hash.get(&previous.hash) == Some(&path) {
                let stale = previous.hash.clone();
                self.by_hash.remove(&stale);
                if let Some(other) = self
                    .files
                    .iter()
                    .find(|(p, e)| e.hash == stale && **p != path)
                    .map(|(p, _)| p.clone())
                {
                    self.by_hash.insert(stale, other);
                }
            }
        }

        match self.by_hash.get(&entry.hash) {
            Some(existing) if existing <= &path => {}
            _ => {
                self.by_hash.insert(entry.hash.clone(), path.clone());
            }
        }
        self.files.insert(path, entry);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Relative path of some file with this content hash.
    pub fn path_for_hash(&self, hash: &str) -> Option<&str> {
        self.by_hash.get(hash).map(String::as_str)
    }

    /// Absolute path to read when uploading `hash`.
    pub fn source_for_hash(&self, hash: &str) -> Option<PathBuf> {
        self.path_for_hash(hash).map(|rel| self.root.join(rel))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.files.serialize(serializer)
    }
}
