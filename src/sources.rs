//! Source listing and health reporting.
//!
//! Used by the `ingest sources` command. Each configured source is probed
//! once with [`SourceConnector::health_check`]; probes run concurrently.

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;

use crate::config::Config;
use crate::models::{DataSourceHealth, SourceType};
use crate::registry::ConnectorRegistry;

/// One row of the `sources` listing.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    pub health: DataSourceHealth,
}

/// Build every configured connector and probe its health.
pub async fn get_sources(config: &Config) -> Result<Vec<SourceSummary>> {
    let registry = ConnectorRegistry::from_config(config)?;
    let probes = registry.connectors().iter().map(|connector| async move {
        let health = connector.health_check().await;
        let source = connector.source();
        SourceSummary {
            id: source.id,
            name: source.name,
            source_type: source.source_type,
            health,
        }
    });
    Ok(join_all(probes).await)
}

/// Print the source table.
pub async fn list_sources(config: &Config) -> Result<()> {
    let sources = get_sources(config).await?;
    if sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<10} {:<8} {:>8}  ERROR",
        "SOURCE", "TYPE", "HEALTHY", "MS"
    );
    for s in &sources {
        println!(
            "{:<16} {:<10} {:<8} {:>8}  {}",
            s.id,
            s.source_type,
            s.health.is_healthy,
            s.health
                .response_time_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".into()),
            s.health.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
