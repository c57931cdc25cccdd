//! Pipeline orchestration for the CLI.
//!
//! Coordinates connector → indexing: [`run_sync`] drives a connector's own
//! sync pass, [`run_index`] pulls content from a connector and pushes it
//! through the [`IndexingService`] in batches.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::connector::SourceConnector;
use crate::indexing::{BatchIndexingResult, IndexingService, IndexingStatus};
use crate::registry::ConnectorRegistry;

fn resolve(config: &Config, source: &str) -> Result<Arc<dyn SourceConnector>> {
    let registry = ConnectorRegistry::from_config(config)?;
    match registry.find(source) {
        Some(connector) => Ok(connector),
        None => {
            let known: Vec<&str> = registry.connectors().iter().map(|c| c.id()).collect();
            bail!(
                "Unknown source: '{}'. Configured: {}",
                source,
                if known.is_empty() {
                    "(none)".to_string()
                } else {
                    known.join(", ")
                }
            )
        }
    }
}

/// Connect, run one sync pass, and print the result as JSON.
pub async fn run_sync(config: &Config, source: &str, full: bool) -> Result<()> {
    let connector = resolve(config, source)?;
    connector
        .connect()
        .await
        .with_context(|| format!("Failed to connect to source '{}'", source))?;

    let result = connector.sync(!full).await;
    connector.disconnect().await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!("sync of '{}' failed", source);
    }
    Ok(())
}

/// Fetch content from `source` and index it.
///
/// Without `full`, only content newer than the source's last sync is
/// fetched; unchanged content is skipped by the indexing hash cache either
/// way.
pub async fn run_index(
    config: &Config,
    source: &str,
    full: bool,
    strategy: Option<&str>,
) -> Result<BatchIndexingResult> {
    let service = IndexingService::from_config(config).await?;
    if let Some(name) = strategy {
        let available = service.get_available_strategies();
        if !available.iter().any(|s| s == name) {
            bail!(
                "Unknown chunking strategy: '{}'. Available: {}",
                name,
                available.join(", ")
            );
        }
    }

    let connector = resolve(config, source)?;
    connector
        .connect()
        .await
        .with_context(|| format!("Failed to connect to source '{}'", source))?;

    let since = if full {
        None
    } else {
        connector.source().last_sync
    };
    let fetched = connector.get_content(since).await;
    connector.disconnect().await?;
    let contents = fetched.with_context(|| format!("Failed to fetch content from '{}'", source))?;
    tracing::info!(source_id = %source, documents = contents.len(), "fetched content");

    let result = service.batch_index_content(&contents, strategy).await;

    let chunks: usize = result.results.iter().map(|r| r.chunks_created).sum();
    let embeddings: usize = result.results.iter().map(|r| r.embeddings_generated).sum();
    let partial = result
        .results
        .iter()
        .filter(|r| r.status == IndexingStatus::Partial)
        .count();

    println!("index {}", source);
    println!("  fetched: {} items", contents.len());
    println!("  indexed: {}", result.successful);
    if partial > 0 {
        println!("  partial: {}", partial);
    }
    println!("  failed: {}", result.failed);
    println!("  chunks created: {}", chunks);
    println!("  embeddings generated: {}", embeddings);
    println!("  time: {}ms", result.processing_time_ms);
    for failed in result
        .results
        .iter()
        .filter(|r| r.status == IndexingStatus::Failed)
    {
        println!("  ! {}: {}", failed.content_id, failed.errors.join("; "));
    }
    println!("ok");

    Ok(result)
}
