//! File connector.
//!
//! Discovers documents under a single file or directory root and extracts
//! their text. Supported extensions are `pdf`, `txt`, `md`, `docx`, and
//! `doc`, optionally narrowed by `file_types`.
//!
//! # Configuration
//!
//! ```toml
//! [sources.handbook]
//! type = "file"
//! path = "./handbook"
//! recursive = true
//! exclude_patterns = ["*/drafts/*", "*.tmp.md"]
//! file_types = ["md", "pdf"]
//! watch_changes = true
//! ```
//!
//! # Exclusion
//!
//! Exclude patterns are glob-like: `*` matches any run of characters, `?`
//! matches one character, everything else is literal. A pattern excludes a
//! file when it matches anywhere in the file's path.
//!
//! # Incremental sync
//!
//! The connector remembers the modification time it last processed for
//! every file. An incremental pass re-reads only files whose mtime moved
//! past that record; files that vanished are counted as deleted and evicted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::mpsc;
use uuid::Uuid;
use walkdir::WalkDir;

use super::watch::{FileWatcher, PathFilter, TimestampMap};
use super::{ConnectorCore, SourceConnector};
use crate::config::{DataSourceConfig, FileSourceConfig, SourceConfig, SUPPORTED_FILE_TYPES};
use crate::error::DataSourceError;
use crate::extract::extract_text;
use crate::models::{Content, FileChangeEvent, SourceStatus, SyncResult};

pub struct FileConnector {
    core: ConnectorCore,
    config: FileSourceConfig,
    filter: Arc<FileFilter>,
    timestamps: TimestampMap,
    watcher: Mutex<Option<FileWatcher>>,
    events: Mutex<Option<mpsc::Receiver<FileChangeEvent>>>,
}

/// Extension allow-list plus compiled exclude patterns.
#[derive(Debug)]
struct FileFilter {
    extensions: Vec<String>,
    excludes: Vec<Regex>,
}

impl FileFilter {
    fn new(source_id: &str, config: &FileSourceConfig) -> Result<Self, DataSourceError> {
        let extensions = if config.file_types.is_empty() {
            SUPPORTED_FILE_TYPES.iter().map(|s| s.to_string()).collect()
        } else {
            config.file_types.clone()
        };
        let excludes = config
            .exclude_patterns
            .iter()
            .map(|p| {
                Regex::new(&glob_to_regex(p)).map_err(|e| {
                    DataSourceError::validation(
                        source_id,
                        format!("invalid exclude pattern '{}': {}", p, e),
                    )
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            extensions,
            excludes,
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        let ext = match extension_of(path) {
            Some(ext) => ext,
            None => return false,
        };
        if !self.extensions.iter().any(|e| *e == ext) {
            return false;
        }
        let path_str = path.to_string_lossy();
        !self.excludes.iter().any(|re| re.is_match(&path_str))
    }
}

/// Translate a `*`/`?` glob into an unanchored regex.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

fn modified_time(metadata: &std::fs::Metadata) -> SystemTime {
    metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)
}

impl FileConnector {
    pub fn new(id: &str, config: &SourceConfig) -> Result<Self, DataSourceError> {
        let file_config = match &config.settings {
            DataSourceConfig::File(cfg) => cfg.clone(),
            other => {
                return Err(DataSourceError::validation(
                    id,
                    format!("expected a file source, got {}", other.source_type()),
                ))
            }
        };
        Ok(Self {
            core: ConnectorCore::new(id, config),
            filter: Arc::new(FileFilter::new(id, &file_config)?),
            config: file_config,
            timestamps: Arc::default(),
            watcher: Mutex::new(None),
            events: Mutex::new(None),
        })
    }

    /// Take the receiving end of the change-event channel.
    ///
    /// Returns `None` unless `watch_changes` is set and the connector is
    /// connected, or when the receiver was already taken.
    pub fn take_change_events(&self) -> Option<mpsc::Receiver<FileChangeEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn root(&self) -> &Path {
        &self.config.path
    }

    /// Every accepted file under the root, sorted for deterministic output.
    fn discover(&self) -> Result<Vec<PathBuf>, DataSourceError> {
        let root = self.root();
        let meta = std::fs::metadata(root).map_err(|e| self.io_error(root, e))?;
        if meta.is_file() {
            return Ok(if self.filter.accepts(root) {
                vec![root.to_path_buf()]
            } else {
                Vec::new()
            });
        }

        let mut walker = WalkDir::new(root);
        if !self.config.recursive {
            walker = walker.max_depth(1);
        }
        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(source_id = %self.id(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && self.filter.accepts(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn io_error(&self, path: &Path, err: std::io::Error) -> DataSourceError {
        if err.kind() == std::io::ErrorKind::NotFound {
            DataSourceError::validation(self.id(), format!("path does not exist: {}", path.display()))
        } else {
            DataSourceError::classify(self.id(), format!("{}: {}", path.display(), err))
        }
    }

    /// Read and parse one file.
    async fn read_file(&self, path: &Path) -> Result<(Content, SystemTime), DataSourceError> {
        let item = path.display().to_string();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DataSourceError::parse(self.id(), &item, e.to_string()))?;
        if metadata.len() > self.config.max_file_bytes {
            return Err(DataSourceError::parse(
                self.id(),
                &item,
                format!(
                    "file is {} bytes, limit is {}",
                    metadata.len(),
                    self.config.max_file_bytes
                ),
            ));
        }
        let modified = modified_time(&metadata);

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DataSourceError::parse(self.id(), &item, e.to_string()))?;
        let ext = extension_of(path).unwrap_or_default();
        let ext_for_task = ext.clone();
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, &ext_for_task))
            .await
            .map_err(|e| DataSourceError::parse(self.id(), &item, e.to_string()))?
            .map_err(|e| DataSourceError::parse(self.id(), &item, e.to_string()))?;

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let id = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("file://{}/{}", self.id(), path.display()).as_bytes(),
        );
        let modified_at: DateTime<Utc> = modified.into();
        let content = Content::new(
            id.to_string(),
            self.id(),
            title,
            text,
            serde_json::json!({
                "path": path.display().to_string(),
                "file_name": path.file_name().map(|n| n.to_string_lossy().to_string()),
                "extension": ext,
                "size_bytes": metadata.len(),
                "modified_at": modified_at.to_rfc3339(),
            }),
            modified_at,
        );
        Ok((content, modified))
    }

    async fn sync_pass(&self, incremental: bool) -> Result<SyncResult, DataSourceError> {
        let files = self.discover()?;
        let mut result = SyncResult::default();
        let mut seen = HashSet::with_capacity(files.len());

        for path in files {
            seen.insert(path.clone());
            let recorded = self.timestamp_of(&path);
            if incremental {
                let current = std::fs::metadata(&path).map(|m| modified_time(&m)).ok();
                if let (Some(recorded), Some(current)) = (recorded, current) {
                    if current <= recorded {
                        continue;
                    }
                }
            }

            match self.read_file(&path).await {
                Ok((_, modified)) => {
                    result.documents_processed += 1;
                    if recorded.is_some() {
                        result.documents_updated += 1;
                    } else {
                        result.documents_added += 1;
                    }
                    self.lock_timestamps().insert(path, modified);
                }
                Err(e) => {
                    tracing::warn!(source_id = %self.id(), code = e.code(), error = %e, "skipping file");
                    result.errors.push(e.to_string());
                }
            }
        }

        let mut timestamps = self.lock_timestamps();
        let before = timestamps.len();
        timestamps.retain(|path, _| seen.contains(path));
        result.documents_deleted = (before - timestamps.len()) as u64;
        self.core.set_document_count(timestamps.len() as u64);
        Ok(result)
    }

    fn timestamp_of(&self, path: &Path) -> Option<SystemTime> {
        self.lock_timestamps().get(path).copied()
    }

    fn lock_timestamps(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, SystemTime>> {
        self.timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_watching(&self) -> Result<(), DataSourceError> {
        let filter = self.filter.clone();
        let accept: PathFilter = Arc::new(move |path: &Path| filter.accepts(path));
        let (watcher, rx) = FileWatcher::start(
            self.id(),
            self.root(),
            self.config.recursive,
            self.timestamps.clone(),
            accept,
        )
        .map_err(|e| DataSourceError::connection(self.id(), format!("failed to watch: {}", e)))?;
        *self.watcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(watcher);
        *self.events.lock().unwrap_or_else(|p| p.into_inner()) = Some(rx);
        Ok(())
    }
}

#[async_trait]
impl SourceConnector for FileConnector {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), DataSourceError> {
        let root = self.root().to_path_buf();
        let outcome = self
            .core
            .execute_with_retry(|| {
                let root = root.clone();
                async move {
                    tokio::fs::metadata(&root)
                        .await
                        .map(|_| ())
                        .map_err(|e| self.io_error(&root, e))
                }
            })
            .await;
        let outcome = match outcome {
            Ok(()) if self.config.watch_changes => self.start_watching(),
            other => other,
        };
        self.core.record_connect(&outcome);
        outcome
    }

    async fn disconnect(&self) -> Result<(), DataSourceError> {
        self.watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        self.core.set_status(SourceStatus::Inactive, None);
        Ok(())
    }

    async fn validate_connection(&self) -> bool {
        tokio::fs::metadata(self.root()).await.is_ok()
    }

    async fn sync(&self, incremental: bool) -> SyncResult {
        self.core
            .track_sync(incremental, || self.sync_pass(incremental))
            .await
    }

    async fn get_content(
        &self,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<Vec<Content>, DataSourceError> {
        let files = self.discover()?;
        let mut contents = Vec::with_capacity(files.len());
        for path in files {
            if let Some(since) = last_sync {
                let modified = std::fs::metadata(&path).map(|m| modified_time(&m));
                if let Ok(modified) = modified {
                    if DateTime::<Utc>::from(modified) <= since {
                        continue;
                    }
                }
            }
            match self.read_file(&path).await {
                Ok((content, _)) => contents.push(content),
                Err(e) => {
                    tracing::warn!(source_id = %self.id(), code = e.code(), error = %e, "skipping file");
                }
            }
        }
        tracing::debug!(source_id = %self.id(), documents = contents.len(), "read files");
        Ok(contents)
    }
}
