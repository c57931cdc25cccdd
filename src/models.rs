//! Core data models used throughout the ingest harness.
//!
//! These types represent the sources, content units, chunks, and per-call
//! results that flow through the connector and indexing pipeline. All of them
//! serialize to JSON so callers can print or forward them unchanged.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DataSourceConfig;

/// The kind of system a connector talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Database,
    Api,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Database => "database",
            SourceType::Api => "api",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
    Error,
    Syncing,
}

/// Snapshot of a configured data source, owned by its connector.
#[derive(Debug, Clone, Serialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    pub config: DataSourceConfig,
    pub status: SourceStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub document_count: u64,
    pub error_message: Option<String>,
}

/// One normalized unit of ingested text.
///
/// Content is treated as an immutable value: re-indexing produces a new
/// `Content` with a bumped [`version`](Content::version) rather than mutating
/// the input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub embedding: Vec<f32>,
    pub chunks: Vec<ContentChunk>,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
}

impl Content {
    /// Build a fresh, not-yet-indexed content unit.
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
        metadata: serde_json::Value,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            title: title.into(),
            text: text.into(),
            metadata,
            embedding: Vec::new(),
            chunks: Vec::new(),
            last_updated,
            version: 0,
        }
    }
}

/// A positioned sub-span of a content's text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentChunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    /// 0-based, contiguous within one content.
    pub position: usize,
    pub metadata: ChunkMetadata,
}

/// Character offsets of a chunk within its source text.
///
/// `end_index - start_index == chunk_size` always holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub start_index: usize,
    pub end_index: usize,
    pub chunk_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap: Option<usize>,
}

/// Outcome of a single `sync` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    pub documents_processed: u64,
    pub documents_added: u64,
    pub documents_updated: u64,
    pub documents_deleted: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Where the API connector's fetch loop goes next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationState {
    pub has_more: bool,
    pub next_offset: Option<u64>,
    pub next_cursor: Option<String>,
    pub next_page: Option<u64>,
}

/// Result of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct DataSourceHealth {
    pub source_id: String,
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Request counters kept by every connector.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ConnectorMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponential moving average over successful calls.
    pub average_response_time_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Normalized filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChangeEvent {
    pub kind: FileChangeKind,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// What happened to a piece of content upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A change event applied through [`crate::indexing::IndexingService::update_index`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChange {
    pub content_id: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub content: Option<Content>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_result_serializes_snake_case() {
        let result = SyncResult {
            success: true,
            documents_processed: 3,
            documents_added: 2,
            documents_updated: 1,
            documents_deleted: 0,
            errors: vec![],
            duration_ms: 12,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["documents_added"], 2);
        assert_eq!(json["duration_ms"], 12);
    }

    #[test]
    fn test_chunk_metadata_omits_missing_overlap() {
        let meta = ChunkMetadata {
            start_index: 0,
            end_index: 10,
            chunk_size: 10,
            overlap: None,
        };
        let json = serde_json::to_value(meta).unwrap();
        assert!(json.get("overlap").is_none());
    }

    #[test]
    fn test_new_content_starts_unindexed() {
        let content = Content::new("c1", "docs", "Title", "body", serde_json::json!({}), Utc::now());
        assert_eq!(content.version, 0);
        assert!(content.chunks.is_empty());
        assert!(content.embedding.is_empty());
    }
}
