//! HTTP API connector.
//!
//! Pulls JSON records from a REST endpoint, following offset, cursor, or
//! page-number pagination, and maps each record to a [`Content`].
//!
//! # Configuration
//!
//! ```toml
//! [sources.tickets]
//! type = "api"
//! endpoint = "https://support.example.com/api/tickets"
//! records_field = "tickets"
//! since_param = "updated_since"
//! rate_limit_per_second = 5
//!
//! [sources.tickets.pagination]
//! type = "offset"
//! limit = 100
//!
//! [sources.tickets.credentials]
//! bearer_token = "..."
//! ```
//!
//! Authentication uses the first configured of: API key header, bearer
//! token, basic auth. Every request waits for a rate-limiter slot and runs
//! through the connector's retry policy.
//!
//! # Record mapping
//!
//! The record array is the response root when it is an array, otherwise the
//! configured `records_field`, then `data`, `items`, or `results`; failing
//! all of those the whole body is a single record. Titles come from
//! `title`/`name`/`subject`/`headline` and text from
//! `content`/`text`/`body`/`description`/`message`. Records with neither are
//! dropped; a title-only record uses its title as text.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, Url};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{ConnectorCore, SourceConnector};
use crate::config::{ApiSourceConfig, DataSourceConfig, PaginationConfig, PaginationKind, SourceConfig};
use crate::error::DataSourceError;
use crate::models::{Content, PaginationState, SourceStatus, SyncResult};
use crate::rate_limit::RateLimiter;

/// Upper bound on requests issued by one fetch.
pub const MAX_REQUESTS_PER_FETCH: usize = 100;

const RECORD_FIELDS: &[&str] = &["data", "items", "results"];
const TITLE_FIELDS: &[&str] = &["title", "name", "subject", "headline"];
const TEXT_FIELDS: &[&str] = &["content", "text", "body", "description", "message"];
const ID_FIELDS: &[&str] = &["id", "_id", "uuid", "key"];
const UPDATED_FIELDS: &[&str] = &[
    "updated_at",
    "updatedAt",
    "modified_at",
    "modifiedAt",
    "last_modified",
    "updated",
];
const CURSOR_FIELDS: &[&str] = &["next_cursor", "nextCursor", "cursor", "next"];
const TOTAL_FIELDS: &[&str] = &["total", "total_count", "totalCount"];
const TOTAL_PAGES_FIELDS: &[&str] = &["total_pages", "totalPages"];

pub struct ApiConnector {
    core: ConnectorCore,
    config: ApiSourceConfig,
    endpoint: Url,
    method: Method,
    client: reqwest::Client,
    limiter: RateLimiter,
    /// Record ids returned by earlier passes.
    seen: Mutex<HashSet<String>>,
}

impl ApiConnector {
    pub fn new(id: &str, config: &SourceConfig) -> Result<Self, DataSourceError> {
        let api_config = match &config.settings {
            DataSourceConfig::Api(cfg) => cfg.clone(),
            other => {
                return Err(DataSourceError::validation(
                    id,
                    format!("expected an api source, got {}", other.source_type()),
                ))
            }
        };
        let endpoint = Url::parse(&api_config.endpoint).map_err(|e| {
            DataSourceError::validation(id, format!("invalid endpoint '{}': {}", api_config.endpoint, e))
        })?;
        let method = Method::from_bytes(api_config.method.to_uppercase().as_bytes())
            .map_err(|_| DataSourceError::validation(id, format!("invalid method '{}'", api_config.method)))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("ingest-harness/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DataSourceError::validation(id, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            core: ConnectorCore::new(id, config),
            limiter: RateLimiter::per_second(api_config.rate_limit_per_second),
            config: api_config,
            endpoint,
            method,
            client,
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// Query parameters for the page described by `state`.
    fn page_params(
        &self,
        state: &PaginationState,
        since: Option<DateTime<Utc>>,
    ) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .config
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(p) = &self.config.pagination {
            params.push((p.limit_param.clone(), p.limit.to_string()));
            match p.kind {
                PaginationKind::Offset => {
                    params.push((p.offset_param.clone(), state.next_offset.unwrap_or(0).to_string()));
                }
                PaginationKind::Cursor => {
                    if let Some(cursor) = &state.next_cursor {
                        params.push((p.cursor_param.clone(), cursor.clone()));
                    }
                }
                PaginationKind::Page => {
                    params.push((p.page_param.clone(), state.next_page.unwrap_or(1).to_string()));
                }
            }
        }

        if let (Some(param), Some(since)) = (&self.config.since_param, since) {
            params.push((param.clone(), since.to_rfc3339()));
        }
        params
    }

    fn authorize(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let creds = &self.config.credentials;
        if let Some(key) = &creds.api_key {
            request.header(creds.api_key_header.as_str(), key.as_str())
        } else if let Some(token) = &creds.bearer_token {
            request.header(AUTHORIZATION, format!("Bearer {}", token))
        } else if let Some(user) = &creds.username {
            let pair = format!("{}:{}", user, creds.password.as_deref().unwrap_or(""));
            request.header(AUTHORIZATION, format!("Basic {}", BASE64.encode(pair)))
        } else {
            request
        }
    }

    /// One HTTP round trip: rate-limit, send, map status, decode JSON.
    async fn request_once(&self, params: &[(String, String)]) -> Result<Value, DataSourceError> {
        self.limiter.acquire().await;

        let request = self
            .client
            .request(self.method.clone(), self.endpoint.clone())
            .query(params);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| DataSourceError::from_reqwest(self.id(), &e, self.core.timeout()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(DataSourceError::from_status(self.id(), status, retry_after, &body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| DataSourceError::parse(self.id(), self.endpoint.as_str(), e.to_string()))
    }

    async fn fetch_page(
        &self,
        state: &PaginationState,
        since: Option<DateTime<Utc>>,
    ) -> Result<Value, DataSourceError> {
        let params = self.page_params(state, since);
        tracing::debug!(source_id = %self.id(), ?params, "requesting page");
        self.core
            .execute_with_retry(|| self.request_once(&params))
            .await
    }

    /// Walk every page and collect the mapped records.
    async fn fetch_all(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(String, Content)>, DataSourceError> {
        let mut state = PaginationState {
            has_more: true,
            next_offset: Some(0),
            next_cursor: None,
            next_page: Some(1),
        };
        let mut records = Vec::new();
        let mut requests = 0usize;

        while state.has_more {
            if requests >= MAX_REQUESTS_PER_FETCH {
                tracing::warn!(
                    source_id = %self.id(),
                    requests,
                    records = records.len(),
                    "request cap reached, returning partial results"
                );
                break;
            }
            let body = self.fetch_page(&state, since).await?;
            requests += 1;

            let page = extract_records(&body, self.config.records_field.as_deref());
            let page_len = page.len();
            for record in page {
                let Some((record_id, content)) = self.record_to_content(record) else {
                    continue;
                };
                if let Some(since) = since {
                    if probe_timestamp(record).is_some_and(|updated| updated <= since) {
                        continue;
                    }
                }
                records.push((record_id, content));
            }

            state = next_state(self.config.pagination.as_ref(), &state, &body, page_len);
        }

        tracing::debug!(source_id = %self.id(), requests, documents = records.len(), "fetch complete");
        Ok(records)
    }

    fn record_to_content(&self, record: &Value) -> Option<(String, Content)> {
        let obj = record.as_object()?;
        let title = probe_str(obj, TITLE_FIELDS);
        let text = probe_str(obj, TEXT_FIELDS);
        let (title, text) = match (title, text) {
            (None, None) => return None,
            (Some(t), None) => (t.to_string(), t.to_string()),
            (title, Some(text)) => (title.unwrap_or_default().to_string(), text.to_string()),
        };

        let record_id = ID_FIELDS
            .iter()
            .find_map(|f| match obj.get(*f) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| hex::encode(Sha256::digest(record.to_string().as_bytes())));

        let id = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("api://{}/{}", self.id(), record_id).as_bytes(),
        );
        let content = Content::new(
            id.to_string(),
            self.id(),
            title,
            text,
            serde_json::json!({
                "record_id": record_id,
                "endpoint": self.config.endpoint,
            }),
            probe_timestamp(record).unwrap_or_else(Utc::now),
        );
        Some((record_id, content))
    }

    async fn sync_pass(&self, incremental: bool) -> Result<SyncResult, DataSourceError> {
        let since = if incremental {
            self.core.source().last_sync
        } else {
            None
        };
        let records = self.fetch_all(since).await?;

        let mut result = SyncResult {
            documents_processed: records.len() as u64,
            ..SyncResult::default()
        };
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let current: HashSet<String> = records.into_iter().map(|(id, _)| id).collect();
        for id in &current {
            if seen.contains(id) {
                result.documents_updated += 1;
            } else {
                result.documents_added += 1;
            }
        }
        if incremental {
            seen.extend(current);
        } else {
            result.documents_deleted = seen.difference(&current).count() as u64;
            *seen = current;
        }
        self.core.set_document_count(seen.len() as u64);
        Ok(result)
    }
}

// ============ Response helpers ============

fn probe_str<'a>(obj: &'a serde_json::Map<String, Value>, fields: &[&str]) -> Option<&'a str> {
    fields.iter().find_map(|f| {
        obj.get(*f)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

fn probe_timestamp(record: &Value) -> Option<DateTime<Utc>> {
    let obj = record.as_object()?;
    let raw = probe_str(obj, UPDATED_FIELDS)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn probe_u64(body: &Value, fields: &[&str]) -> Option<u64> {
    fields.iter().find_map(|f| body.get(*f).and_then(Value::as_u64))
}

/// Locate the record array inside a response body.
fn extract_records<'a>(body: &'a Value, records_field: Option<&str>) -> Vec<&'a Value> {
    if let Value::Array(items) = body {
        return items.iter().collect();
    }
    let explicit = records_field.into_iter();
    for field in explicit.chain(RECORD_FIELDS.iter().copied()) {
        if let Some(Value::Array(items)) = body.get(field) {
            return items.iter().collect();
        }
    }
    match body {
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Advance the pagination state after a page of `page_len` records.
fn next_state(
    pagination: Option<&PaginationConfig>,
    current: &PaginationState,
    body: &Value,
    page_len: usize,
) -> PaginationState {
    let Some(p) = pagination else {
        return PaginationState::default();
    };
    let full_page = page_len as u64 >= p.limit && page_len > 0;

    match p.kind {
        PaginationKind::Offset => {
            let offset = current.next_offset.unwrap_or(0);
            let next = offset + p.limit;
            let has_more = match probe_u64(body, TOTAL_FIELDS) {
                Some(total) => next < total,
                None => full_page,
            };
            PaginationState {
                has_more,
                next_offset: Some(next),
                ..PaginationState::default()
            }
        }
        PaginationKind::Cursor => {
            let cursor = match &p.cursor_field {
                Some(field) => body.get(field.as_str()).and_then(Value::as_str),
                None => CURSOR_FIELDS
                    .iter()
                    .find_map(|f| body.get(*f).and_then(Value::as_str)),
            }
            .filter(|c| !c.is_empty())
            .map(str::to_string);
            PaginationState {
                has_more: cursor.is_some(),
                next_cursor: cursor,
                ..PaginationState::default()
            }
        }
        PaginationKind::Page => {
            let page = current.next_page.unwrap_or(1);
            let has_more = match probe_u64(body, TOTAL_PAGES_FIELDS) {
                Some(total_pages) => page < total_pages,
                None => full_page,
            };
            PaginationState {
                has_more,
                next_page: Some(page + 1),
                ..PaginationState::default()
            }
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl SourceConnector for ApiConnector {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), DataSourceError> {
        let params = self.page_params(&PaginationState::default(), None);
        let outcome = self
            .core
            .execute_with_retry(|| self.request_once(&params))
            .await
            .map(|_| ());
        self.core.record_connect(&outcome);
        outcome
    }

    async fn disconnect(&self) -> Result<(), DataSourceError> {
        self.core.set_status(SourceStatus::Inactive, None);
        Ok(())
    }

    async fn validate_connection(&self) -> bool {
        let params = self.page_params(&PaginationState::default(), None);
        self.core
            .execute_with_timeout(self.request_once(&params))
            .await
            .is_ok()
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
        let records = self.fetch_all(last_sync).await?;
        Ok(records.into_iter().map(|(_, content)| content).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pagination(kind: PaginationKind, limit: u64) -> PaginationConfig {
        PaginationConfig {
            kind,
            limit,
            limit_param: "limit".into(),
            offset_param: "offset".into(),
            cursor_param: "cursor".into(),
            cursor_field: None,
            page_param: "page".into(),
        }
    }

    #[test]
    fn test_extract_records_probe_order() {
        let root = json!([{"id": 1}, {"id": 2}]);
        assert_eq!(extract_records(&root, None).len(), 2);

        let custom = json!({"tickets": [{"id": 1}], "data": [{"id": 2}, {"id": 3}]});
        assert_eq!(extract_records(&custom, Some("tickets")).len(), 1);
        assert_eq!(extract_records(&custom, None).len(), 2);

        let single = json!({"title": "only one"});
        assert_eq!(extract_records(&single, None).len(), 1);
    }

    #[test]
    fn test_offset_uses_total_when_present() {
        let p = pagination(PaginationKind::Offset, 100);
        let mut state = PaginationState {
            has_more: true,
            next_offset: Some(0),
            ..PaginationState::default()
        };
        let body = json!({"total": 250});
        let mut pages = 0;
        while state.has_more {
            pages += 1;
            state = next_state(Some(&p), &state, &body, 100);
        }
        assert_eq!(pages, 3);
        assert_eq!(state.next_offset, Some(300));
    }

    #[test]
    fn test_offset_falls_back_to_page_fullness() {
        let p = pagination(PaginationKind::Offset, 10);
        let start = PaginationState::default();
        assert!(next_state(Some(&p), &start, &json!([]), 10).has_more);
        assert!(!next_state(Some(&p), &start, &json!([]), 9).has_more);
        assert!(!next_state(Some(&p), &start, &json!([]), 0).has_more);
    }

    #[test]
    fn test_cursor_stops_on_empty_cursor() {
        let p = pagination(PaginationKind::Cursor, 10);
        let start = PaginationState::default();
        let more = next_state(Some(&p), &start, &json!({"nextCursor": "abc"}), 10);
        assert!(more.has_more);
        assert_eq!(more.next_cursor.as_deref(), Some("abc"));

        assert!(!next_state(Some(&p), &more, &json!({"next_cursor": ""}), 10).has_more);
        assert!(!next_state(Some(&p), &more, &json!({}), 10).has_more);
    }

    #[test]
    fn test_page_uses_total_pages() {
        let p = pagination(PaginationKind::Page, 10);
        let first = PaginationState {
            next_page: Some(1),
            ..PaginationState::default()
        };
        let body = json!({"total_pages": 2});
        let second = next_state(Some(&p), &first, &body, 10);
        assert!(second.has_more);
        assert_eq!(second.next_page, Some(2));
        assert!(!next_state(Some(&p), &second, &body, 10).has_more);
    }

    #[test]
    fn test_no_pagination_is_single_request() {
        let state = next_state(None, &PaginationState::default(), &json!([]), 500);
        assert!(!state.has_more);
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_record_mapping() {
        let config: SourceConfig = toml::from_str(
            r#"
            type = "api"
            endpoint = "http://localhost:9/items"
            "#,
        )
        .unwrap();
        let connector = ApiConnector::new("tickets", &config).unwrap();

        let (id, content) = connector
            .record_to_content(&json!({"id": 42, "subject": "Printer", "body": "It jams."}))
            .unwrap();
        assert_eq!(id, "42");
        assert_eq!(content.title, "Printer");
        assert_eq!(content.text, "It jams.");
        assert_eq!(content.source_id, "tickets");

        let (_, title_only) = connector
            .record_to_content(&json!({"name": "Just a name"}))
            .unwrap();
        assert_eq!(title_only.text, "Just a name");

        assert!(connector.record_to_content(&json!({"id": 1, "n": 2})).is_none());
        assert!(connector.record_to_content(&json!("bare string")).is_none());
    }
}
