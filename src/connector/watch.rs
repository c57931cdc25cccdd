//! Filesystem change watching for the file connector.
//!
//! Wraps a `notify` watcher and normalizes its events into
//! [`FileChangeEvent`]s (`add`, `change`, `unlink`) delivered over a bounded
//! tokio channel. The watcher also keeps the connector's last-processed
//! timestamp map current: `unlink` evicts the path, other events refresh it
//! from the file's new modification time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::Utc;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{FileChangeEvent, FileChangeKind};

/// Capacity of the change-event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub type TimestampMap = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;
pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// A running watcher. Dropping it stops delivery.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Start watching `root`.
    ///
    /// Only paths accepted by `accept` produce events. When the channel is
    /// full the event is dropped with a warning.
    pub fn start(
        source_id: &str,
        root: &Path,
        recursive: bool,
        timestamps: TimestampMap,
        accept: PathFilter,
    ) -> Result<(Self, mpsc::Receiver<FileChangeEvent>), notify::Error> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let source_id = source_id.to_string();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(source_id = %source_id, error = %e, "watch error");
                    return;
                }
            };
            for change in convert_event(&event) {
                if !accept(&change.path) {
                    continue;
                }
                apply_to_timestamps(&timestamps, &change);
                match tx.try_send(change) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(dropped)) => {
                        warn!(
                            source_id = %source_id,
                            path = %dropped.path.display(),
                            "change channel full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(source_id = %source_id, "change channel closed");
                    }
                }
            }
        })?;

        let mode = if recursive && root.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;
        debug!(root = %root.display(), ?mode, "watching for changes");

        Ok((Self { _watcher: watcher }, rx))
    }
}

fn apply_to_timestamps(timestamps: &TimestampMap, change: &FileChangeEvent) {
    let mut map = timestamps
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match change.kind {
        FileChangeKind::Unlink => {
            map.remove(&change.path);
        }
        FileChangeKind::Add | FileChangeKind::Change => {
            if let Ok(modified) = std::fs::metadata(&change.path).and_then(|m| m.modified()) {
                map.insert(change.path.clone(), modified);
            }
        }
    }
}

/// Map one `notify` event to zero or more normalized changes.
fn convert_event(event: &notify::Event) -> Vec<FileChangeEvent> {
    let now = Utc::now();
    let make = |kind, path: &PathBuf| FileChangeEvent {
        kind,
        path: path.clone(),
        timestamp: now,
    };

    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| make(FileChangeKind::Add, p))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| make(FileChangeKind::Unlink, p))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| make(FileChangeKind::Unlink, p))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| make(FileChangeKind::Add, p))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => vec![
            make(FileChangeKind::Unlink, &event.paths[0]),
            make(FileChangeKind::Add, &event.paths[1]),
        ],
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| make(FileChangeKind::Change, p))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    fn kinds(events: Vec<FileChangeEvent>) -> Vec<FileChangeKind> {
        events.into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_convert_basic_kinds() {
        let create = event(EventKind::Create(CreateKind::File), &["/d/a.md"]);
        assert_eq!(kinds(convert_event(&create)), vec![FileChangeKind::Add]);

        let modify = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/d/a.md"],
        );
        assert_eq!(kinds(convert_event(&modify)), vec![FileChangeKind::Change]);

        let remove = event(EventKind::Remove(RemoveKind::File), &["/d/a.md"]);
        assert_eq!(kinds(convert_event(&remove)), vec![FileChangeKind::Unlink]);
    }

    #[test]
    fn test_rename_becomes_unlink_then_add() {
        let rename = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/d/old.md", "/d/new.md"],
        );
        let changes = convert_event(&rename);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, FileChangeKind::Unlink);
        assert_eq!(changes[0].path, PathBuf::from("/d/old.md"));
        assert_eq!(changes[1].kind, FileChangeKind::Add);
        assert_eq!(changes[1].path, PathBuf::from("/d/new.md"));
    }

    #[test]
    fn test_metadata_and_access_events_are_ignored() {
        let meta = event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/d/a.md"],
        );
        assert!(convert_event(&meta).is_empty());
        let access = event(EventKind::Access(notify::event::AccessKind::Any), &["/d/a.md"]);
        assert!(convert_event(&access).is_empty());
    }

    #[test]
    fn test_unlink_evicts_timestamp() {
        let timestamps: TimestampMap = Arc::default();
        let path = PathBuf::from("/d/gone.md");
        timestamps
            .lock()
            .unwrap()
            .insert(path.clone(), SystemTime::now());
        apply_to_timestamps(
            &timestamps,
            &FileChangeEvent {
                kind: FileChangeKind::Unlink,
                path: path.clone(),
                timestamp: Utc::now(),
            },
        );
        assert!(!timestamps.lock().unwrap().contains_key(&path));
    }
}
