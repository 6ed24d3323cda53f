//! Directory change notifications from the platform watcher.

use crate::{DynoError, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Keeps the platform watcher alive; dropping it stops notifications.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Watch `root` recursively, delivering changes on the returned receiver.
    pub fn watch(root: &Path) -> Result<(Self, mpsc::UnboundedReceiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |event: notify::Result<Event>| match event {
            Ok(event) => {
                for change in classify(event) {
                    if tx.send(change).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("watcher event error: {}", e),
        })
        .map_err(|e| watch_error(root, e))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| watch_error(root, e))?;

        Ok((Self { _watcher: watcher }, rx))
    }
}

fn watch_error(root: &Path, e: notify::Error) -> DynoError {
    DynoError::file_system(root, std::io::Error::other(e))
}

/// Translate one platform event into the changes it describes.
pub fn classify(event: Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Added,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            return match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![
                    ChangeEvent::new(ChangeKind::Removed, from),
                    ChangeEvent::new(ChangeKind::Added, to),
                ],
                (Some(path), None) => vec![ChangeEvent::new(ChangeKind::Modified, path)],
                _ => Vec::new(),
            };
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Added,
        EventKind::Modify(_) => ChangeKind::Modified,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .map(|path| ChangeEvent::new(kind, path))
        .collect()
}
