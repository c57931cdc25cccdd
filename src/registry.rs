//! Connector construction and lookup.
//!
//! [`ConnectorRegistry::from_config`] builds one connector per
//! `[sources.<id>]` entry, dispatching on the entry's `type`. Custom
//! connectors can be added afterwards with
//! [`register`](ConnectorRegistry::register).
//!
//! ```rust,no_run
//! use ingest_harness::config::load_config;
//! use ingest_harness::registry::ConnectorRegistry;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = load_config("./config/ingest.toml".as_ref())?;
//! let registry = ConnectorRegistry::from_config(&config)?;
//! for connector in registry.connectors() {
//!     println!("{} healthy={}", connector.id(), connector.health_check().await.is_healthy);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::config::{Config, DataSourceConfig, SourceConfig};
use crate::connector::{ApiConnector, DatabaseConnector, FileConnector, SourceConnector};
use crate::error::DataSourceError;

/// Build the connector for one configured source.
pub fn create_connector(
    id: &str,
    config: &SourceConfig,
) -> Result<Arc<dyn SourceConnector>, DataSourceError> {
    let connector: Arc<dyn SourceConnector> = match &config.settings {
        DataSourceConfig::File(_) => Arc::new(FileConnector::new(id, config)?),
        DataSourceConfig::Database(_) => Arc::new(DatabaseConnector::new(id, config)?),
        DataSourceConfig::Api(_) => Arc::new(ApiConnector::new(id, config)?),
    };
    Ok(connector)
}

/// The set of connectors known to this process, keyed by source id.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a connector for every configured source.
    ///
    /// Fails on the first source whose settings a connector rejects.
    pub fn from_config(config: &Config) -> Result<Self, DataSourceError> {
        let mut registry = Self::new();
        for (id, source) in &config.sources {
            registry.register(create_connector(id, source)?);
        }
        Ok(registry)
    }

    /// Add a connector, replacing any existing one with the same id.
    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        self.connectors.retain(|c| c.id() != connector.id());
        self.connectors.push(connector);
    }

    pub fn connectors(&self) -> &[Arc<dyn SourceConnector>] {
        &self.connectors
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn SourceConnector>> {
        self.connectors.iter().find(|c| c.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
