//! File-change bridge.
//!
//! Turns local directory changes into remote file operations. Changes are
//! collected over a latency window and coalesced per path, then each path
//! is handled once:
//!
//! - an existing regular file is manifested on its own, uploaded if the
//!   backend lacks its content, and announced with `file.download`;
//! - a path removed and still absent is announced with `file.delete`.
//!
//! Directories, named pipes, editor scratch files and anything under the
//! local metadata directory never produce traffic.

use super::command::ControlCommand;
use super::mux::Multiplexer;
use super::watcher::{ChangeEvent, ChangeKind};
use crate::fs::walker::{relative_path, WalkOptions};
use crate::manifest::Manifest;
use crate::sync::{resolve_missing, SyncBackend, UploadScheduler};
use crate::{DynoError, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Single-file uploads need no parallelism.
const BRIDGE_WORKERS: usize = 1;

pub struct FileChangeBridge {
    root: PathBuf,
    walk: WalkOptions,
    latency: Duration,
    backend: Arc<dyn SyncBackend>,
    scheduler: UploadScheduler,
    mux: Multiplexer,
}

impl FileChangeBridge {
    pub fn new(
        root: &Path,
        metadata_dir: &str,
        latency: Duration,
        backend: Arc<dyn SyncBackend>,
        mux: Multiplexer,
    ) -> Self {
        // Watchers report canonical paths
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Self {
            root,
            walk: WalkOptions::with_metadata_dir(metadata_dir),
            latency,
            scheduler: UploadScheduler::new(Arc::clone(&backend), BRIDGE_WORKERS),
            backend,
            mux,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process change batches until the event source or the session ends.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ChangeEvent>) -> Result<()> {
        info!("Watching {} for changes", self.root.display());

        loop {
            let first = tokio::select! {
                event = events.recv() => event,
                _ = self.mux.closed() => None,
            };
            let Some(first) = first else {
                break;
            };

            let batch = self.collect(first, &mut events).await;
            self.process(batch).await?;
        }

        debug!("File-change bridge stopped");
        Ok(())
    }

    /// Gather events for one latency window, keeping the last kind per path.
    async fn collect(
        &self,
        first: ChangeEvent,
        events: &mut mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> BTreeMap<PathBuf, ChangeKind> {
        let mut batch = BTreeMap::new();
        batch.insert(first.path, first.kind);

        let deadline = Instant::now() + self.latency;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            batch.insert(event.path, event.kind);
        }
        batch
    }

    /// Handle one coalesced batch of changes.
    pub async fn process(&self, batch: BTreeMap<PathBuf, ChangeKind>) -> Result<()> {
        for (path, kind) in batch {
            if self.is_ignored(&path) {
                debug!("Ignoring change to {}", path.display());
                continue;
            }
            let name = relative_path(&self.root, &path);

            // Judged by the entry itself: links are never followed, and
            // directories and pipes are skipped like the initial walk does
            if let Ok(metadata) = std::fs::symlink_metadata(&path) {
                if !metadata.file_type().is_file() {
                    continue;
                }
                match self.sync_file(&name, &path).await {
                    Ok(()) => {}
                    // Vanished or unreadable mid-hash; a later event will catch up
                    Err(DynoError::FileSystem { path, source }) => {
                        warn!("Skipping {}: {}", path.display(), source);
                    }
                    Err(e) => return Err(e),
                }
            } else if kind == ChangeKind::Removed {
                info!("Deleting {}", name);
                self.mux.command(ControlCommand::FileDelete { name }).await?;
            }
        }
        Ok(())
    }

    async fn sync_file(&self, name: &str, path: &Path) -> Result<()> {
        let manifest = Manifest::for_file(&self.root, path)?;
        let Some(entry) = manifest.get(name) else {
            return Ok(());
        };
        let hash = entry.hash.clone();

        let missing = resolve_missing(self.backend.as_ref(), &manifest).await?;
        self.scheduler.upload(&manifest, &missing).await?;

        info!("Syncing {}", name);
        self.mux
            .command(ControlCommand::FileDownload {
                name: name.to_string(),
                hash,
            })
            .await
    }

    /// Paths that never generate protocol traffic.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };

        // Same rule as the initial walk: hidden entries and the metadata dir
        let excluded = relative.components().any(|c| match c {
            Component::Normal(part) => self.walk.excludes(&part.to_string_lossy()),
            _ => false,
        });
        if excluded {
            return true;
        }

        path.file_name()
            .and_then(|name| name.to_str())
            .map(is_editor_scratch)
            .unwrap_or(true)
    }
}

fn is_editor_scratch(name: &str) -> bool {
    name.ends_with(".swp")
        || name.ends_with(".swx")
        || name.ends_with('~')
        || name.starts_with(".#")
        || name == "4913"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::command::CommandMessage;
    use crate::session::frame::CONTROL_CHANNEL;
    use crate::session::mux::testing::{pair, FakeAgent};
    use crate::sync::testing::RecordingBackend;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        backend: Arc<RecordingBackend>,
        bridge: FileChangeBridge,
        agent: FakeAgent,
        _connection: crate::session::mux::Connection,
    }

    async fn fixture(backend: RecordingBackend) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (connection, mut agent) = pair();
        agent.hello().await;
        connection.mux().wait_active().await.unwrap();

        let backend = Arc::new(backend);
        let bridge = FileChangeBridge::new(
            dir.path(),
            ".dyno",
            Duration::from_millis(50),
            backend.clone(),
            connection.mux().clone(),
        );
        Fixture {
            dir,
            backend,
            bridge,
            agent,
            _connection: connection,
        }
    }

    async fn next_command(agent: &mut FakeAgent) -> CommandMessage {
        let frame = agent.next().await;
        assert_eq!(frame.channel, CONTROL_CHANNEL);
        CommandMessage::from_slice(&frame.payload).unwrap()
    }

    fn batch(events: &[(ChangeKind, PathBuf)]) -> BTreeMap<PathBuf, ChangeKind> {
        events.iter().map(|(k, p)| (p.clone(), *k)).collect()
    }

    #[tokio::test]
    async fn test_modified_file_is_uploaded_and_announced() {
        let mut fx = fixture(RecordingBackend::default()).await;
        let root = fx.bridge.root().to_path_buf();
        fs::create_dir(root.join("lib")).unwrap();
        fs::write(root.join("lib/app.rb"), b"hello").unwrap();

        fx.bridge
            .process(batch(&[(ChangeKind::Modified, root.join("lib/app.rb"))]))
            .await
            .unwrap();

        let command = next_command(&mut fx.agent).await;
        assert_eq!(command.command, "file.download");
        assert_eq!(command.data["name"], "lib/app.rb");
        assert_eq!(
            command.data["hash"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(fx.backend.uploads().len(), 1);
        assert_eq!(fx.backend.diff_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_known_content_is_not_reuploaded() {
        let mut fx = fixture(RecordingBackend::with_missing(&[])).await;
        let root = fx.bridge.root().to_path_buf();
        fs::write(root.join("a.txt"), b"same").unwrap();

        fx.bridge
            .process(batch(&[(ChangeKind::Added, root.join("a.txt"))]))
            .await
            .unwrap();

        assert_eq!(next_command(&mut fx.agent).await.command, "file.download");
        assert!(fx.backend.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_removed_file_is_deleted() {
        let mut fx = fixture(RecordingBackend::default()).await;
        let root = fx.bridge.root().to_path_buf();

        fx.bridge
            .process(batch(&[(ChangeKind::Removed, root.join("gone.rb"))]))
            .await
            .unwrap();

        let command = next_command(&mut fx.agent).await;
        assert_eq!(command.command, "file.delete");
        assert_eq!(command.data["name"], "gone.rb");
    }

    #[tokio::test]
    async fn test_ignored_paths_generate_no_traffic() {
        let mut fx = fixture(RecordingBackend::default()).await;
        let root = fx.bridge.root().to_path_buf();
        fs::create_dir(root.join(".dyno")).unwrap();
        fs::write(root.join(".dyno/console.port"), b"4000").unwrap();
        fs::write(root.join(".app.rb.swp"), b"x").unwrap();
        fs::create_dir(root.join("tmp")).unwrap();

        fx.bridge
            .process(batch(&[
                (ChangeKind::Modified, root.join(".dyno/console.port")),
                (ChangeKind::Added, root.join(".app.rb.swp")),
                (ChangeKind::Added, root.join("tmp")),
                (ChangeKind::Modified, root.join("vanished.rb")),
            ]))
            .await
            .unwrap();

        // A marker command proves nothing was queued ahead of it
        fx.bridge
            .mux
            .command(CommandMessage::new("file.marker"))
            .await
            .unwrap();
        assert_eq!(next_command(&mut fx.agent).await.command, "file.marker");
        assert!(fx.backend.uploads().is_empty());
        assert!(fx.backend.diff_sizes().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fifo_is_ignored() {
        let fx = fixture(RecordingBackend::default()).await;
        let root = fx.bridge.root().to_path_buf();
        let fifo = root.join("pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        fx.bridge
            .process(batch(&[(ChangeKind::Added, fifo)]))
            .await
            .unwrap();
        assert!(fx.backend.diff_sizes().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_and_hidden_files_stay_local() {
        let mut fx = fixture(RecordingBackend::default()).await;
        let root = fx.bridge.root().to_path_buf();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"token").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.join("linked")).unwrap();
        fs::write(root.join(".env"), b"PASSWORD=x").unwrap();
        fs::create_dir(root.join(".git")).unwrap();
        fs::write(root.join(".git/HEAD"), b"ref").unwrap();

        fx.bridge
            .process(batch(&[
                (ChangeKind::Added, root.join("linked")),
                (ChangeKind::Modified, root.join(".env")),
                (ChangeKind::Modified, root.join(".git/HEAD")),
            ]))
            .await
            .unwrap();

        fx.bridge
            .mux
            .command(CommandMessage::new("file.marker"))
            .await
            .unwrap();
        assert_eq!(next_command(&mut fx.agent).await.command, "file.marker");
        assert!(fx.backend.uploads().is_empty());
        assert!(fx.backend.diff_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_removed_then_recreated_is_synced() {
        let mut fx = fixture(RecordingBackend::default()).await;
        let root = fx.bridge.root().to_path_buf();
        fs::write(root.join("Gemfile"), b"source").unwrap();

        fx.bridge
            .process(batch(&[(ChangeKind::Removed, root.join("Gemfile"))]))
            .await
            .unwrap();

        assert_eq!(next_command(&mut fx.agent).await.command, "file.download");
    }

    #[tokio::test]
    async fn test_run_coalesces_events_per_path() {
        let mut fx = fixture(RecordingBackend::default()).await;
        let root = fx.bridge.root().to_path_buf();
        fs::write(root.join("a.rb"), b"a").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            tx.send(ChangeEvent::new(ChangeKind::Modified, root.join("a.rb")))
                .unwrap();
        }
        drop(tx);

        let Fixture { bridge, backend, .. } = fx;
        bridge.run(rx).await.unwrap();

        assert_eq!(next_command(&mut fx.agent).await.data["name"], "a.rb");
        assert_eq!(backend.diff_sizes(), vec![1]);
    }

    #[test]
    fn test_editor_scratch_names() {
        assert!(is_editor_scratch(".app.rb.swp"));
        assert!(is_editor_scratch("app.rb~"));
        assert!(is_editor_scratch(".#app.rb"));
        assert!(!is_editor_scratch("app.rb"));
    }
}
