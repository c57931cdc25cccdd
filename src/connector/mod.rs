//! The source connector contract and its shared machinery.
//!
//! Every data-source integration implements [`SourceConnector`]. The trait
//! covers the full lifecycle (connect, validate, sync, fetch, health) while
//! the retry, timeout, metrics, and status bookkeeping common to all of them
//! lives in a composed [`ConnectorCore`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ConnectorRegistry              │
//! │  ┌────────────┐ ┌────────────┐ ┌──────────┐  │
//! │  │   File     │ │  Database  │ │   API    │  │
//! │  │ walk+watch │ │ sqlx pools │ │ paginate │  │
//! │  └─────┬──────┘ └─────┬──────┘ └────┬─────┘  │
//! │        └──────── ConnectorCore ─────┘        │
//! │           retry · timeout · metrics          │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!          get_content() → IndexingService
//! ```
//!
//! # Status transitions
//!
//! | Event | Status |
//! |-------|--------|
//! | created | `inactive` |
//! | `connect` ok | `active` |
//! | `connect` failed | `error` |
//! | sync started | `syncing` |
//! | sync finished | `active` or `error` |
//! | `disconnect` | `inactive` |

pub mod api;
pub mod database;
pub mod file;
pub mod watch;

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::SourceConfig;
use crate::error::DataSourceError;
use crate::models::{
    ConnectorMetrics, Content, DataSource, DataSourceHealth, SourceStatus, SyncResult,
};
use crate::retry::{with_timeout, RetryPolicy};

pub use api::ApiConnector;
pub use database::DatabaseConnector;
pub use file::FileConnector;

/// Weight of the newest sample in the response-time moving average.
const EMA_ALPHA: f64 = 0.1;

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// An adapter for one configured data source.
///
/// Implementations compose a [`ConnectorCore`] and expose it through
/// [`core`](SourceConnector::core); the provided methods derive health,
/// metrics, and the source snapshot from it.
///
/// # Error boundary
///
/// [`sync`](SourceConnector::sync) and
/// [`validate_connection`](SourceConnector::validate_connection) never fail:
/// failures are folded into the returned [`SyncResult`] or `false`. The other
/// fallible operations return a [`DataSourceError`].
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Shared retry/timeout/metrics state.
    fn core(&self) -> &ConnectorCore;

    /// The configured source id.
    fn id(&self) -> &str {
        self.core().source_id()
    }

    /// Establish readiness. Fails with a retryable `Connection` error on
    /// network trouble and `Validation` on bad configuration.
    async fn connect(&self) -> Result<(), DataSourceError>;

    /// Release resources. Safe to call when not connected.
    async fn disconnect(&self) -> Result<(), DataSourceError>;

    /// Cheap liveness probe.
    async fn validate_connection(&self) -> bool;

    /// Run one synchronization pass.
    ///
    /// With `incremental` set, only items changed since the previous pass
    /// are processed.
    async fn sync(&self, incremental: bool) -> SyncResult;

    /// Fetch content newer than `last_sync`, or everything when `None`.
    async fn get_content(
        &self,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<Vec<Content>, DataSourceError>;

    /// Probe liveness once under the timeout guard and record the outcome.
    async fn health_check(&self) -> DataSourceHealth {
        self.core().check_health(self.validate_connection()).await
    }

    fn metrics(&self) -> ConnectorMetrics {
        self.core().metrics()
    }

    fn source(&self) -> DataSource {
        self.core().source()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shared machinery
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u64,
    last_error: Option<String>,
}

/// State and helpers composed into every connector.
///
/// All interior state sits behind `std::sync::Mutex` guards that are taken
/// for short critical sections and never held across an `.await`, so
/// `get_content` and `health_check` may run while a sync is in flight.
#[derive(Debug)]
pub struct ConnectorCore {
    id: String,
    source: Mutex<DataSource>,
    retry: RetryPolicy,
    metrics: Mutex<ConnectorMetrics>,
    health: Mutex<HealthState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectorCore {
    /// Build the core from a validated source configuration.
    pub fn new(id: &str, config: &SourceConfig) -> Self {
        let source = DataSource {
            id: id.to_string(),
            name: config.display_name(id),
            source_type: config.settings.source_type(),
            config: config.settings.clone(),
            status: SourceStatus::Inactive,
            last_sync: None,
            document_count: 0,
            error_message: None,
        };
        Self {
            id: id.to_string(),
            source: Mutex::new(source),
            retry: RetryPolicy::new(
                config.retry.clone(),
                Duration::from_secs(config.timeout_secs),
            ),
            metrics: Mutex::new(ConnectorMetrics::default()),
            health: Mutex::new(HealthState::default()),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        self.retry.timeout()
    }

    pub fn source(&self) -> DataSource {
        lock(&self.source).clone()
    }

    pub fn metrics(&self) -> ConnectorMetrics {
        lock(&self.metrics).clone()
    }

    pub fn set_status(&self, status: SourceStatus, error_message: Option<String>) {
        let mut source = lock(&self.source);
        source.status = status;
        source.error_message = error_message;
    }

    pub fn set_document_count(&self, count: u64) {
        lock(&self.source).document_count = count;
    }

    /// Run `op` through the retry policy, timing every attempt.
    pub async fn execute_with_retry<T, F, Fut>(&self, op: F) -> Result<T, DataSourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataSourceError>>,
    {
        self.retry
            .execute_observed(&self.id, op, |ok, elapsed| self.record_request(ok, elapsed))
            .await
    }

    /// Run `fut` once under the per-attempt deadline.
    pub async fn execute_with_timeout<T, Fut>(&self, fut: Fut) -> Result<T, DataSourceError>
    where
        Fut: Future<Output = Result<T, DataSourceError>>,
    {
        let started = Instant::now();
        let outcome = with_timeout(&self.id, self.timeout(), fut).await;
        self.record_request(outcome.is_ok(), started.elapsed());
        outcome
    }

    /// Run one liveness probe under the deadline. The probe counts as a
    /// request in the metrics; `false` and timeouts count as failures.
    pub async fn check_health<Fut>(&self, probe: Fut) -> DataSourceHealth
    where
        Fut: Future<Output = bool>,
    {
        let started = Instant::now();
        let outcome = with_timeout(&self.id, self.timeout(), async { Ok(probe.await) }).await;
        let elapsed = started.elapsed();
        self.record_request(matches!(outcome, Ok(true)), elapsed);
        self.record_health(outcome, elapsed)
    }

    fn record_request(&self, ok: bool, elapsed: Duration) {
        let mut metrics = lock(&self.metrics);
        metrics.total_requests += 1;
        metrics.last_request_at = Some(Utc::now());
        if ok {
            let sample = elapsed.as_secs_f64() * 1000.0;
            metrics.average_response_time_ms = if metrics.successful_requests == 0 {
                sample
            } else {
                metrics.average_response_time_ms * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA
            };
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
    }

    /// Mark the source active, or errored with the connect failure.
    pub fn record_connect(&self, outcome: &Result<(), DataSourceError>) {
        match outcome {
            Ok(()) => {
                self.set_status(SourceStatus::Active, None);
                tracing::info!(source_id = %self.id, "connected");
            }
            Err(e) => {
                self.set_status(SourceStatus::Error, Some(e.to_string()));
                tracing::error!(source_id = %self.id, code = e.code(), error = %e, "connect failed");
            }
        }
    }

    fn record_health(
        &self,
        outcome: Result<bool, DataSourceError>,
        elapsed: Duration,
    ) -> DataSourceHealth {
        let mut health = lock(&self.health);
        let failure = match outcome {
            Ok(true) => None,
            Ok(false) => Some("connection validation failed".to_string()),
            Err(e) => Some(e.to_string()),
        };
        let is_healthy = failure.is_none();
        match failure {
            None => health.consecutive_failures = 0,
            Some(message) => {
                health.consecutive_failures += 1;
                health.last_error = Some(message);
            }
        }
        DataSourceHealth {
            source_id: self.id.clone(),
            is_healthy,
            last_check: Utc::now(),
            response_time_ms: Some(elapsed.as_millis() as u64),
            error_count: health.consecutive_failures,
            last_error: health.last_error.clone(),
        }
    }

    /// Drive one sync pass with status bookkeeping.
    ///
    /// The source is `syncing` while `pass` runs. A pass that returns `Err`
    /// yields `success = false` with the error recorded; otherwise the
    /// result is marked successful and `last_sync` advances.
    pub async fn track_sync<F, Fut>(&self, incremental: bool, pass: F) -> SyncResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SyncResult, DataSourceError>>,
    {
        let started = Instant::now();
        self.set_status(SourceStatus::Syncing, None);
        tracing::debug!(source_id = %self.id, incremental, "sync started");

        let mut result = match pass().await {
            Ok(mut result) => {
                result.success = true;
                {
                    let mut source = lock(&self.source);
                    source.status = SourceStatus::Active;
                    source.error_message = None;
                    source.last_sync = Some(Utc::now());
                }
                result
            }
            Err(e) => {
                self.set_status(SourceStatus::Error, Some(e.to_string()));
                tracing::error!(source_id = %self.id, code = e.code(), error = %e, "sync failed");
                SyncResult {
                    success: false,
                    errors: vec![e.to_string()],
                    ..SyncResult::default()
                }
            }
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        if result.success {
            tracing::info!(
                source_id = %self.id,
                processed = result.documents_processed,
                added = result.documents_added,
                updated = result.documents_updated,
                deleted = result.documents_deleted,
                errors = result.errors.len(),
                duration_ms = result.duration_ms,
                "sync complete"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSourceConfig, FileSourceConfig};
    use crate::retry::RetryOptions;

    fn core() -> ConnectorCore {
        let config = SourceConfig {
            name: Some("Docs".into()),
            timeout_secs: 1,
            retry: RetryOptions {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            settings: DataSourceConfig::File(FileSourceConfig {
                path: "/tmp/docs".into(),
                recursive: true,
                exclude_patterns: vec![],
                file_types: vec![],
                watch_changes: false,
                max_file_bytes: 1024,
            }),
        };
        ConnectorCore::new("docs", &config)
    }

    #[test]
    fn test_new_core_is_inactive() {
        let core = core();
        let source = core.source();
        assert_eq!(source.name, "Docs");
        assert_eq!(source.status, SourceStatus::Inactive);
        assert_eq!(core.metrics().total_requests, 0);
    }

    #[test]
    fn test_response_time_is_exponential_average() {
        let core = core();
        core.record_request(true, Duration::from_millis(100));
        core.record_request(true, Duration::from_millis(200));
        core.record_request(false, Duration::from_millis(5000));
        let metrics = core.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert!((metrics.average_response_time_ms - 110.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_retry_counts_every_attempt() {
        let core = core();
        let result: Result<(), _> = core
            .execute_with_retry(|| async { Err(DataSourceError::connection("docs", "reset")) })
            .await;
        assert!(result.is_err());
        let metrics = core.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 2);
    }

    #[tokio::test]
    async fn test_track_sync_failure_sets_error_status() {
        let core = core();
        let result = core
            .track_sync(true, || async {
                Err(DataSourceError::connection("docs", "unreachable"))
            })
            .await;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        let source = core.source();
        assert_eq!(source.status, SourceStatus::Error);
        assert!(source.error_message.unwrap().contains("unreachable"));
        assert!(source.last_sync.is_none());
    }

    #[tokio::test]
    async fn test_track_sync_success_advances_last_sync() {
        let core = core();
        let result = core
            .track_sync(false, || async {
                Ok(SyncResult {
                    documents_processed: 2,
                    documents_added: 2,
                    ..SyncResult::default()
                })
            })
            .await;
        assert!(result.success);
        let source = core.source();
        assert_eq!(source.status, SourceStatus::Active);
        assert!(source.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_health_probes_are_counted_as_requests() {
        let core = core();
        assert!(core.check_health(async { true }).await.is_healthy);
        assert!(!core.check_health(async { false }).await.is_healthy);
        let slow = core
            .check_health(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                true
            })
            .await;
        assert!(!slow.is_healthy);
        assert_eq!(slow.error_count, 2);

        let metrics = core.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 2);
    }

    #[test]
    fn test_health_failures_accumulate_until_success() {
        let core = core();
        let h = core.record_health(Ok(false), Duration::from_millis(3));
        assert!(!h.is_healthy);
        assert_eq!(h.error_count, 1);
        let h = core.record_health(
            Err(DataSourceError::connection("docs", "down")),
            Duration::from_millis(3),
        );
        assert_eq!(h.error_count, 2);
        let h = core.record_health(Ok(true), Duration::from_millis(3));
        assert!(h.is_healthy);
        assert_eq!(h.error_count, 0);
    }
}
