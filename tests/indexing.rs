//! Integration tests for the indexing service: change detection, chunk
//! layout, versioning, batch fault isolation, and change events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use ingest_harness::cache::{InMemoryHashCache, SqliteHashCache};
use ingest_harness::chunk::{ChunkingStrategy, SlidingWindow, TextSpan};
use ingest_harness::config::{Config, IndexingConfig};
use ingest_harness::embedding::{Embedder, EmbeddingError};
use ingest_harness::indexing::{IndexingService, IndexingStatus};
use ingest_harness::models::{ChangeKind, Content, ContentChange};

/// Returns `[len; 4]` per text; fails any batch containing `FAIL_EMBED`.
#[derive(Default)]
struct MockEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn model_name(&self) -> &str {
        "mock"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|t| t.contains("FAIL_EMBED")) {
            return Err(EmbeddingError::Api {
                provider: "mock",
                status: 500,
                body: "mock failure".into(),
            });
        }
        Ok(texts.iter().map(|t| vec![t.len() as f32; 4]).collect())
    }
}

/// Sliding window that rejects texts containing `boom` and panics on `panic!`.
struct Fragile;

impl ChunkingStrategy for Fragile {
    fn name(&self) -> &str {
        "fragile"
    }

    fn chunk(&self, text: &str, config: &IndexingConfig) -> anyhow::Result<Vec<TextSpan>> {
        if text.contains("panic!") {
            panic!("fragile strategy panicked");
        }
        if text.contains("boom") {
            bail!("cannot chunk this text");
        }
        SlidingWindow.chunk(text, config)
    }
}

fn service_with(config: IndexingConfig) -> (IndexingService, Arc<MockEmbedder>) {
    let embedder = Arc::new(MockEmbedder::default());
    let service = IndexingService::new(config, embedder.clone(), Arc::new(InMemoryHashCache::new()));
    (service, embedder)
}

fn content(id: &str, text: &str) -> Content {
    Content::new(
        id,
        "docs",
        format!("Doc {}", id),
        text,
        serde_json::json!({ "path": format!("{}.md", id) }),
        Utc::now(),
    )
}

fn long_text(chars: usize) -> String {
    "abcdefghij".repeat(chars / 10)
}

#[tokio::test]
async fn test_unchanged_content_is_a_noop() {
    let (service, embedder) = service_with(IndexingConfig::default());
    let doc = content("a", &long_text(1500));

    let first = service.index_content(&doc, None).await;
    assert_eq!(first.status, IndexingStatus::Success);
    assert!(first.embeddings_generated > 0);
    let calls = embedder.calls.load(Ordering::SeqCst);

    let second = service.index_content(&doc, None).await;
    assert_eq!(second.status, IndexingStatus::Success);
    assert_eq!(second.embeddings_generated, 0);
    assert_eq!(second.chunks_created, 0);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_sliding_window_chunk_layout() {
    let (service, _) = service_with(IndexingConfig::default());
    let result = service.index_content(&content("a", &long_text(2500)), None).await;

    assert_eq!(result.status, IndexingStatus::Success);
    assert_eq!(result.chunks_created, 3);
    // Three chunk vectors plus the whole-document vector.
    assert_eq!(result.embeddings_generated, 4);

    let indexed = result.content.unwrap();
    let bounds: Vec<(usize, usize)> = indexed
        .chunks
        .iter()
        .map(|c| (c.metadata.start_index, c.metadata.end_index))
        .collect();
    assert_eq!(bounds, vec![(0, 1000), (800, 1800), (1600, 2500)]);
    for (i, chunk) in indexed.chunks.iter().enumerate() {
        assert_eq!(chunk.position, i);
        assert_eq!(chunk.metadata.chunk_size, chunk.metadata.end_index - chunk.metadata.start_index);
        assert_eq!(chunk.embedding.len(), 4);
    }
    assert_eq!(indexed.chunks[1].metadata.overlap, Some(200));
    assert_eq!(indexed.chunks[2].metadata.overlap, Some(200));
    assert_eq!(indexed.embedding.len(), 4);
}

#[tokio::test]
async fn test_version_and_timestamp_advance() {
    let (service, _) = service_with(IndexingConfig::default());
    let original = content("a", &long_text(500));

    let v1 = service.index_content(&original, None).await.content.unwrap();
    assert_eq!(v1.version, 1);
    assert!(v1.last_updated > original.last_updated);
    assert!(v1.metadata["word_count"].as_u64().is_some());
    assert_eq!(v1.metadata["path"], "a.md");

    let edited = Content {
        text: format!("{} edited", v1.text),
        ..v1.clone()
    };
    let v2 = service.index_content(&edited, None).await.content.unwrap();
    assert_eq!(v2.version, 2);
    assert!(v2.last_updated > v1.last_updated);
}

#[tokio::test]
async fn test_batch_isolates_failing_item() {
    let (service, _) = service_with(IndexingConfig {
        batch_size: 2,
        concurrency: 2,
        ..IndexingConfig::default()
    });
    service.register_strategy(Arc::new(Fragile));

    let items: Vec<Content> = (0..5)
        .map(|i| {
            let text = if i == 2 {
                format!("{} boom", long_text(300))
            } else {
                long_text(300 + i * 10)
            };
            content(&i.to_string(), &text)
        })
        .collect();

    let batch = service.batch_index_content(&items, Some("fragile")).await;
    assert_eq!(batch.total, 5);
    assert_eq!(batch.successful, 4);
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.results.len(), 5);
    assert_eq!(batch.results[2].status, IndexingStatus::Failed);
    assert_eq!(batch.results[2].content_id, "2");
    assert!(batch.results[2].errors[0].contains("cannot chunk"));
}

#[tokio::test]
async fn test_batch_survives_panicking_strategy() {
    let (service, _) = service_with(IndexingConfig::default());
    service.register_strategy(Arc::new(Fragile));

    let items = vec![
        content("ok-1", &long_text(200)),
        content("bad", "this one will panic! during chunking"),
        content("ok-2", &long_text(400)),
    ];
    let batch = service.batch_index_content(&items, Some("fragile")).await;
    assert_eq!(batch.successful, 2);
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.results[1].status, IndexingStatus::Failed);
    assert!(batch.results[1].errors[0].contains("panicked"));
}

#[tokio::test]
async fn test_embedding_failure_yields_partial_and_keeps_hash_unset() {
    let (service, _) = service_with(IndexingConfig::default());
    let doc = content("a", &format!("{} FAIL_EMBED", long_text(300)));

    let first = service.index_content(&doc, None).await;
    assert_eq!(first.status, IndexingStatus::Partial);
    assert!(!first.errors.is_empty());
    assert_eq!(first.chunks_created, 1);

    // Nothing was cached, so the next call tries again.
    let second = service.index_content(&doc, None).await;
    assert_eq!(second.status, IndexingStatus::Partial);
    assert_eq!(second.chunks_created, 1);
}

#[tokio::test]
async fn test_update_index_invalidates_and_queues() {
    let (service, _) = service_with(IndexingConfig::default());
    let doc = content("a", &long_text(300));
    service.index_content(&doc, None).await;

    let result = service
        .update_index(
            "docs",
            vec![
                ContentChange {
                    content_id: "a".into(),
                    kind: ChangeKind::Updated,
                    content: Some(doc.clone()),
                },
                ContentChange {
                    content_id: "b".into(),
                    kind: ChangeKind::Created,
                    content: None,
                },
                ContentChange {
                    content_id: "c".into(),
                    kind: ChangeKind::Created,
                    content: Some(Content {
                        source_id: "other".into(),
                        ..content("c", "elsewhere")
                    }),
                },
            ],
        )
        .await;
    assert_eq!(result.processed, 1);
    assert_eq!(result.reindex_queued, 1);
    assert_eq!(result.failed, 2);
    assert_eq!(result.errors.len(), 2);

    // The hash was dropped, so identical text is embedded again.
    let again = service.index_content(&doc, None).await;
    assert!(again.embeddings_generated > 0);

    let pending = service.drain_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content_id, "a");
    assert!(service.drain_pending().is_empty());

    let deleted = service
        .update_index(
            "docs",
            vec![ContentChange {
                content_id: "a".into(),
                kind: ChangeKind::Deleted,
                content: None,
            }],
        )
        .await;
    assert_eq!(deleted.removed, 1);
    assert_eq!(deleted.processed, 1);
}

#[tokio::test]
async fn test_sqlite_cache_skips_work_across_services() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("hashes.sqlite");
    let doc = content("a", &long_text(300));

    let first = IndexingService::new(
        IndexingConfig::default(),
        Arc::new(MockEmbedder::default()),
        Arc::new(SqliteHashCache::open(&path).await.unwrap()),
    );
    assert!(first.index_content(&doc, None).await.embeddings_generated > 0);
    drop(first);

    let second = IndexingService::new(
        IndexingConfig::default(),
        Arc::new(MockEmbedder::default()),
        Arc::new(SqliteHashCache::open(&path).await.unwrap()),
    );
    assert_eq!(second.index_content(&doc, None).await.embeddings_generated, 0);
}

#[tokio::test]
async fn test_from_config_lists_builtin_strategies() {
    let mut config: Config = toml::from_str("[indexing]\ndefault_strategy = \"sentence-based\"").unwrap();
    config.validate().unwrap();
    let service = IndexingService::from_config(&config).await.unwrap();

    assert_eq!(
        service.get_available_strategies(),
        vec!["sliding-window".to_string(), "sentence-based".to_string()]
    );
    service.register_strategy(Arc::new(Fragile));
    assert_eq!(service.get_available_strategies().len(), 3);

    // Disabled embeddings still index successfully.
    let result = service
        .index_content(&content("a", "First sentence here. Second sentence follows it."), None)
        .await;
    assert_eq!(result.status, IndexingStatus::Success);
    assert_eq!(result.embeddings_generated, 0);
}
