//! Turning raw [`Content`] into embedded, positioned chunks.
//!
//! # Pipeline
//!
//! ```text
//! Content ─▶ sha256(text) ──unchanged──▶ success, 0 embeddings
//!                │ changed
//!                ▼
//!         metadata extraction (optional)
//!                ▼
//!         ChunkingStrategy::chunk
//!                ▼
//!         embed chunks in batches + whole document
//!                ▼
//!         new Content (version + 1) ─▶ persist hash
//! ```
//!
//! The service holds no source state. Besides its strategy registry it owns
//! only the content-hash cache (`content_hash:{id}`) and a queue of changes
//! waiting to be re-indexed.
//!
//! Nothing here returns an error to the caller: every failure becomes an
//! [`IndexingResult`] with status `failed` (nothing assembled) or `partial`
//! (assembled, some embeddings missing).

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{create_cache, CacheError, HashCache};
use crate::chunk::{builtin_strategies, ChunkingStrategy, TextSpan};
use crate::config::{Config, IndexingConfig};
use crate::embedding::{create_embedder, Embedder, EmbeddingError};
use crate::metadata::extract_metadata;
use crate::models::{ChangeKind, ChunkMetadata, Content, ContentChange, ContentChunk};

const HASH_KEY_PREFIX: &str = "content_hash:";

#[derive(Debug, Error)]
pub enum IndexingError {
    #[error("unknown chunking strategy: {0}")]
    UnknownStrategy(String),
    #[error("chunking failed: {0}")]
    Chunking(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("indexing task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingResult {
    pub content_id: String,
    pub status: IndexingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub processing_time_ms: u64,
    pub errors: Vec<String>,
}

impl IndexingResult {
    fn failed(content_id: &str, error: impl ToString, started: Instant) -> Self {
        Self {
            content_id: content_id.to_string(),
            status: IndexingStatus::Failed,
            content: None,
            chunks_created: 0,
            embeddings_generated: 0,
            processing_time_ms: started.elapsed().as_millis() as u64,
            errors: vec![error.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchIndexingResult {
    pub total: usize,
    /// Items whose status is `success` or `partial`.
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<IndexingResult>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateIndexResult {
    pub processed: usize,
    pub failed: usize,
    pub reindex_queued: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

/// Outcome of the fallible part of one indexing pass.
struct Indexed {
    content: Content,
    chunks_created: usize,
    embeddings_generated: usize,
    errors: Vec<String>,
}

pub struct IndexingService {
    config: IndexingConfig,
    embedder: Arc<dyn Embedder>,
    cache: Arc<dyn HashCache>,
    cache_ttl: Option<Duration>,
    strategies: RwLock<Vec<Arc<dyn ChunkingStrategy>>>,
    pending: Mutex<Vec<ContentChange>>,
}

impl IndexingService {
    pub fn new(
        config: IndexingConfig,
        embedder: Arc<dyn Embedder>,
        cache: Arc<dyn HashCache>,
    ) -> Self {
        Self {
            config,
            embedder,
            cache,
            cache_ttl: None,
            strategies: RwLock::new(builtin_strategies()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Expire stored hashes after `ttl`.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Wire the embedder and hash cache named in the configuration.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::from(
            create_embedder(&config.embedding).context("Failed to create embedding provider")?,
        );
        let cache = create_cache(&config.cache)
            .await
            .context("Failed to open hash cache")?;
        Ok(Self::new(config.indexing.clone(), embedder, cache)
            .with_cache_ttl(Duration::from_secs(config.cache.ttl_secs)))
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════
    // Strategies
    // ═══════════════════════════════════════════════════════════════════

    /// Names of all registered chunking strategies, in registration order.
    pub fn get_available_strategies(&self) -> Vec<String> {
        self.strategies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Add a strategy, replacing any registered under the same name.
    pub fn register_strategy(&self, strategy: Arc<dyn ChunkingStrategy>) {
        let mut strategies = self
            .strategies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        strategies.retain(|s| s.name() != strategy.name());
        strategies.push(strategy);
    }

    fn strategy(&self, name: &str) -> Result<Arc<dyn ChunkingStrategy>, IndexingError> {
        self.strategies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| IndexingError::UnknownStrategy(name.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Single item
    // ═══════════════════════════════════════════════════════════════════

    /// Index one content unit with `strategy` (or the configured default).
    pub async fn index_content(&self, content: &Content, strategy: Option<&str>) -> IndexingResult {
        let started = Instant::now();
        let hash = content_hash(&content.text);
        let key = hash_key(&content.id);

        match self.cache.get(&key).await {
            Ok(Some(cached)) if cached == hash => {
                tracing::debug!(content_id = %content.id, "content unchanged, skipping");
                return IndexingResult {
                    content_id: content.id.clone(),
                    status: IndexingStatus::Success,
                    content: Some(content.clone()),
                    chunks_created: 0,
                    embeddings_generated: 0,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    errors: Vec::new(),
                };
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(content_id = %content.id, error = %e, "hash cache lookup failed");
            }
        }

        let indexed = match self.build(content, strategy).await {
            Ok(indexed) => indexed,
            Err(e) => {
                tracing::warn!(content_id = %content.id, error = %e, "indexing failed");
                return IndexingResult::failed(&content.id, e, started);
            }
        };

        let status = if indexed.errors.is_empty() {
            if let Err(e) = self.cache.set(&key, &hash, self.cache_ttl).await {
                tracing::warn!(content_id = %content.id, error = %e, "failed to persist content hash");
            }
            IndexingStatus::Success
        } else {
            IndexingStatus::Partial
        };

        tracing::debug!(
            content_id = %content.id,
            chunks = indexed.chunks_created,
            embeddings = indexed.embeddings_generated,
            ?status,
            "indexed content"
        );

        IndexingResult {
            content_id: content.id.clone(),
            status,
            content: Some(indexed.content),
            chunks_created: indexed.chunks_created,
            embeddings_generated: indexed.embeddings_generated,
            processing_time_ms: started.elapsed().as_millis() as u64,
            errors: indexed.errors,
        }
    }

    async fn build(&self, content: &Content, strategy: Option<&str>) -> Result<Indexed, IndexingError> {
        let strategy = self.strategy(strategy.unwrap_or(&self.config.default_strategy))?;

        let mut metadata = content.metadata.clone();
        if self.config.enable_metadata_extraction {
            let analysis = extract_metadata(&content.text, self.config.keyword_limit);
            merge_metadata(&mut metadata, serde_json::to_value(analysis).unwrap_or_default());
        }

        let spans = strategy
            .chunk(&content.text, &self.config)
            .map_err(|e| IndexingError::Chunking(format!("{:#}", e)))?;

        let mut errors = Vec::new();
        let mut chunk_vectors: Vec<Vec<f32>> = vec![Vec::new(); spans.len()];
        let mut document_vector = Vec::new();
        let mut embeddings_generated = 0;

        if self.embedder.is_enabled() {
            let batch_size = self.config.batch_size.max(1);
            for (batch_idx, batch) in spans.chunks(batch_size).enumerate() {
                let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
                match self.embedder.embed_batch(&texts).await {
                    Ok(vectors) if vectors.len() == texts.len() => {
                        let offset = batch_idx * batch_size;
                        for (i, vector) in vectors.into_iter().enumerate() {
                            chunk_vectors[offset + i] = vector;
                        }
                        embeddings_generated += texts.len();
                    }
                    Ok(vectors) => errors.push(
                        EmbeddingError::CountMismatch {
                            expected: texts.len(),
                            actual: vectors.len(),
                        }
                        .to_string(),
                    ),
                    Err(e) => errors.push(format!("chunk batch {}: {}", batch_idx, e)),
                }
            }

            match self.embedder.embed(&content.text).await {
                Ok(vector) => {
                    document_vector = vector;
                    embeddings_generated += 1;
                }
                Err(e) => errors.push(format!("document embedding: {}", e)),
            }
        }

        let chunks: Vec<ContentChunk> = spans
            .into_iter()
            .zip(chunk_vectors)
            .enumerate()
            .map(|(position, (span, embedding))| make_chunk(&content.id, position, span, embedding))
            .collect();

        let chunks_created = chunks.len();
        let updated = Content {
            metadata,
            embedding: document_vector,
            chunks,
            last_updated: next_timestamp(content),
            version: content.version + 1,
            ..content.clone()
        };

        Ok(Indexed {
            content: updated,
            chunks_created,
            embeddings_generated,
            errors,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Batches and change events
    // ═══════════════════════════════════════════════════════════════════

    /// Index many items: groups of `batch_size`, each with up to
    /// `concurrency` items in flight, joined before the next group starts.
    ///
    /// Results keep input order. A panicking item becomes a `failed` result.
    pub async fn batch_index_content(
        &self,
        contents: &[Content],
        strategy: Option<&str>,
    ) -> BatchIndexingResult {
        let started = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.concurrency.max(1);

        let mut results = Vec::with_capacity(contents.len());
        for (group_idx, group) in contents.chunks(batch_size).enumerate() {
            let group_results: Vec<IndexingResult> = stream::iter(group)
                .map(|content| self.index_guarded(content, strategy))
                .buffered(concurrency)
                .collect()
                .await;
            tracing::debug!(group = group_idx, items = group.len(), "indexed group");
            results.extend(group_results);
        }

        let failed = results
            .iter()
            .filter(|r| r.status == IndexingStatus::Failed)
            .count();
        let batch = BatchIndexingResult {
            total: contents.len(),
            successful: results.len() - failed,
            failed,
            results,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            total = batch.total,
            successful = batch.successful,
            failed = batch.failed,
            duration_ms = batch.processing_time_ms,
            "batch indexing complete"
        );
        batch
    }

    async fn index_guarded(&self, content: &Content, strategy: Option<&str>) -> IndexingResult {
        let started = Instant::now();
        match AssertUnwindSafe(self.index_content(content, strategy))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(content_id = %content.id, %message, "indexing panicked");
                IndexingResult::failed(&content.id, IndexingError::Panicked(message), started)
            }
        }
    }

    /// Apply upstream change events for `source_id`.
    ///
    /// Created and updated items are queued for re-indexing (see
    /// [`drain_pending`](Self::drain_pending)) and their stored hash is
    /// dropped so the next [`index_content`](Self::index_content) re-embeds
    /// them. Deleted items lose their hash bookkeeping. Each change is
    /// handled independently.
    pub async fn update_index(&self, source_id: &str, changes: Vec<ContentChange>) -> UpdateIndexResult {
        let mut result = UpdateIndexResult::default();

        for change in changes {
            let key = hash_key(&change.content_id);
            match change.kind {
                ChangeKind::Created | ChangeKind::Updated => {
                    let Some(content) = change.content.as_ref() else {
                        result.failed += 1;
                        result
                            .errors
                            .push(format!("{}: change carries no content", change.content_id));
                        continue;
                    };
                    if content.source_id != source_id {
                        result.failed += 1;
                        result.errors.push(format!(
                            "{}: belongs to source '{}', not '{}'",
                            change.content_id, content.source_id, source_id
                        ));
                        continue;
                    }
                    if let Err(e) = self.cache.delete(&key).await {
                        result.failed += 1;
                        result
                            .errors
                            .push(format!("{}: {}", change.content_id, IndexingError::from(e)));
                        continue;
                    }
                    let mut pending = self.pending_queue();
                    pending.retain(|p| p.content_id != change.content_id);
                    pending.push(change);
                    result.reindex_queued += 1;
                }
                ChangeKind::Deleted => {
                    if let Err(e) = self.cache.delete(&key).await {
                        result.failed += 1;
                        result
                            .errors
                            .push(format!("{}: {}", change.content_id, IndexingError::from(e)));
                        continue;
                    }
                    self.pending_queue()
                        .retain(|p| p.content_id != change.content_id);
                    result.removed += 1;
                }
            }
            result.processed += 1;
        }

        tracing::info!(
            source_id,
            processed = result.processed,
            queued = result.reindex_queued,
            removed = result.removed,
            failed = result.failed,
            "applied change events"
        );
        result
    }

    /// Take every change queued by [`update_index`](Self::update_index).
    pub fn drain_pending(&self) -> Vec<ContentChange> {
        std::mem::take(&mut *self.pending_queue())
    }

    fn pending_queue(&self) -> std::sync::MutexGuard<'_, Vec<ContentChange>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// SHA-256 of `text`, lowercase hex.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_key(content_id: &str) -> String {
    format!("{}{}", HASH_KEY_PREFIX, content_id)
}

/// `now`, or one millisecond past the previous stamp if the clock lags.
fn next_timestamp(content: &Content) -> chrono::DateTime<Utc> {
    let floor = content.last_updated + chrono::Duration::milliseconds(1);
    Utc::now().max(floor)
}

fn make_chunk(content_id: &str, position: usize, span: TextSpan, embedding: Vec<f32>) -> ContentChunk {
    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", content_id, position).as_bytes(),
    );
    ContentChunk {
        id: id.to_string(),
        metadata: ChunkMetadata {
            start_index: span.start,
            end_index: span.end,
            chunk_size: span.end - span.start,
            overlap: span.overlap,
        },
        text: span.text,
        embedding,
        position,
    }
}

/// Fold extracted analysis into the content's metadata object.
fn merge_metadata(metadata: &mut serde_json::Value, analysis: serde_json::Value) {
    if !metadata.is_object() {
        let original = std::mem::take(metadata);
        *metadata = if original.is_null() {
            serde_json::json!({})
        } else {
            serde_json::json!({ "source": original })
        };
    }
    if let (Some(target), serde_json::Value::Object(fields)) = (metadata.as_object_mut(), analysis) {
        for (key, value) in fields {
            target.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryHashCache;
    use crate::embedding::DisabledEmbedder;

    fn service() -> IndexingService {
        IndexingService::new(
            IndexingConfig::default(),
            Arc::new(DisabledEmbedder),
            Arc::new(InMemoryHashCache::new()),
        )
    }

    fn content(id: &str, text: &str) -> Content {
        Content::new(id, "docs", "Title", text, serde_json::json!({"path": "a.md"}), Utc::now())
    }

    #[test]
    fn test_content_hash_is_hex_sha256() {
        assert_eq!(
            content_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_merge_metadata_keeps_existing_fields() {
        let mut meta = serde_json::json!({"path": "a.md"});
        merge_metadata(&mut meta, serde_json::json!({"word_count": 3}));
        assert_eq!(meta["path"], "a.md");
        assert_eq!(meta["word_count"], 3);

        let mut scalar = serde_json::json!("raw");
        merge_metadata(&mut scalar, serde_json::json!({"word_count": 1}));
        assert_eq!(scalar["source"], "raw");
    }

    #[tokio::test]
    async fn test_unknown_strategy_fails() {
        let svc = service();
        let result = svc
            .index_content(&content("a", &"x".repeat(500)), Some("paragraph"))
            .await;
        assert_eq!(result.status, IndexingStatus::Failed);
        assert!(result.errors[0].contains("paragraph"));
        assert!(result.content.is_none());
    }

    #[tokio::test]
    async fn test_metadata_is_attached() {
        let svc = service();
        let result = svc
            .index_content(&content("a", "The quick brown fox jumps over the lazy dog."), None)
            .await;
        let indexed = result.content.unwrap();
        assert_eq!(indexed.metadata["path"], "a.md");
        assert_eq!(indexed.metadata["language"], "en");
        assert_eq!(indexed.metadata["word_count"], 9);
    }

    #[tokio::test]
    async fn test_deleted_change_drops_pending_entry() {
        let svc = service();
        let updated = ContentChange {
            content_id: "a".into(),
            kind: ChangeKind::Updated,
            content: Some(content("a", "body")),
        };
        let deleted = ContentChange {
            content_id: "a".into(),
            kind: ChangeKind::Deleted,
            content: None,
        };
        let result = svc.update_index("docs", vec![updated, deleted]).await;
        assert_eq!(result.processed, 2);
        assert_eq!(result.reindex_queued, 1);
        assert_eq!(result.removed, 1);
        assert!(svc.drain_pending().is_empty());
    }
}
