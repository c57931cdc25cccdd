//! SQL database connector.
//!
//! Reads rows from PostgreSQL, MySQL/MariaDB, or SQLite through the matching
//! `sqlx` pool. The dialect is picked from the connection-string scheme;
//! `mongodb://` strings are recognized and rejected.
//!
//! Columns are decoded one at a time against the types each driver knows,
//! including date/time columns (rendered as RFC 3339). A column whose type
//! none of them accept becomes `null` in the row metadata.
//!
//! ```toml
//! [sources.kb]
//! type = "database"
//! connection_string = "postgres://db.internal:5432/kb"
//! username = "reader"
//! password = "..."
//! table = "articles"
//! title_column = "headline"
//! content_column = "body"
//! incremental_column = "id"
//! updated_column = "updated_at"
//! ```
//!
//! With an `incremental_column`, incremental passes select only rows above
//! the highest value seen so far. Without one the full result is polled and
//! changes are detected by per-row content hash. Passes that read the full
//! result count vanished rows as deleted.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use reqwest::Url;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use uuid::Uuid;

use super::{ConnectorCore, SourceConnector};
use crate::config::{DataSourceConfig, DatabaseSourceConfig, SourceConfig};
use crate::error::DataSourceError;
use crate::models::{Content, SourceStatus, SyncResult};

/// Try each listed type in order and convert the first one that decodes.
/// `NULL` short-circuits to `Value::Null`.
macro_rules! decode_first {
    ($row:expr, $idx:expr; $($ty:ty => $conv:expr),+ $(,)?) => {{
        let mut out = None;
        $(
            if out.is_none() {
                if let Ok(v) = $row.try_get::<Option<$ty>, _>($idx) {
                    out = Some(v.map($conv).unwrap_or(Value::Null));
                }
            }
        )+
        out.unwrap_or(Value::Null)
    }};
}

/// Bind the high-water mark (if any), fetch, and decode every column.
macro_rules! fetch_fields {
    ($pool:expr, $sql:expr, $mark:expr, $decode:ident) => {{
        let mut query = sqlx::query($sql);
        if let Some(mark) = $mark {
            query = match mark {
                HighWater::Int(v) => query.bind(*v),
                HighWater::Float(v) => query.bind(*v),
                HighWater::Text(v) => query.bind(v.clone()),
                HighWater::Time(v) => query.bind(*v),
            };
        }
        let rows = query.fetch_all($pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| (column.name().to_string(), $decode(row, idx)))
                    .collect::<Fields>()
            })
            .collect())
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Detect the dialect from a connection string's scheme.
    pub fn detect(source_id: &str, connection_string: &str) -> Result<Self, DataSourceError> {
        let scheme = connection_string
            .split(':')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            "mongodb" | "mongodb+srv" => Err(DataSourceError::validation(
                source_id,
                "MongoDB sources are not supported; use a SQL database",
            )),
            other => Err(DataSourceError::validation(
                source_id,
                format!("unrecognized database scheme '{}'", other),
            )),
        }
    }

    fn placeholder(self) -> &'static str {
        match self {
            Dialect::Postgres => "$1",
            Dialect::MySql | Dialect::Sqlite => "?",
        }
    }
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("identifier pattern is valid")
    })
}

fn check_identifier(source_id: &str, field: &str, value: &str) -> Result<(), DataSourceError> {
    if identifier_re().is_match(value) {
        Ok(())
    } else {
        Err(DataSourceError::validation(
            source_id,
            format!("{} '{}' is not a valid identifier", field, value),
        ))
    }
}

/// Rewrite the connection string into a URL sqlx accepts, with credentials.
fn connection_url(
    source_id: &str,
    dialect: Dialect,
    config: &DatabaseSourceConfig,
) -> Result<String, DataSourceError> {
    if dialect == Dialect::Sqlite {
        return Ok(config.connection_string.clone());
    }
    let mut url = Url::parse(&config.connection_string).map_err(|e| {
        DataSourceError::validation(source_id, format!("invalid connection string: {}", e))
    })?;
    let bad_credentials =
        |_| DataSourceError::validation(source_id, "connection string cannot carry credentials");
    if let Some(user) = &config.username {
        url.set_username(user).map_err(bad_credentials)?;
    }
    if let Some(password) = &config.password {
        url.set_password(Some(password)).map_err(bad_credentials)?;
    }
    let mut out = url.to_string();
    if url.scheme() == "mariadb" {
        out = out.replacen("mariadb", "mysql", 1);
    } else if url.scheme() == "postgresql" {
        out = out.replacen("postgresql", "postgres", 1);
    }
    Ok(out)
}

/// Value of the incremental column, compared in its native type.
#[derive(Debug, Clone, PartialEq)]
enum HighWater {
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
}

impl HighWater {
    /// SQLite keeps timestamps as text, so they stay text there and compare
    /// lexically; the server dialects bind them back as timestamps.
    fn from_json(value: &Value, dialect: Dialect) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(HighWater::Int)
                .or_else(|| n.as_f64().map(HighWater::Float)),
            Value::String(s) if dialect != Dialect::Sqlite => Some(
                parse_timestamp(s)
                    .map(HighWater::Time)
                    .unwrap_or_else(|| HighWater::Text(s.clone())),
            ),
            Value::String(s) => Some(HighWater::Text(s.clone())),
            _ => None,
        }
    }

    fn max(self, other: Self) -> Self {
        let greater = match (&self, &other) {
            (HighWater::Int(a), HighWater::Int(b)) => b > a,
            (HighWater::Float(a), HighWater::Float(b)) => b > a,
            (HighWater::Int(a), HighWater::Float(b)) => *b > *a as f64,
            (HighWater::Float(a), HighWater::Int(b)) => *b as f64 > *a,
            (HighWater::Text(a), HighWater::Text(b)) => b > a,
            (HighWater::Time(a), HighWater::Time(b)) => b > a,
            _ => false,
        };
        if greater {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Default)]
struct SyncState {
    high_water: Option<HighWater>,
    /// Row id → SHA-256 of its mapped content.
    row_hashes: HashMap<String, String>,
}

/// One decoded row: column name → JSON value.
type Fields = serde_json::Map<String, Value>;

#[derive(Clone)]
enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    async fn close(&self) {
        match self {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            DbPool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            DbPool::MySql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            DbPool::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        }
    }

    /// Run `sql`, binding `mark` as its only parameter when given.
    async fn fetch(&self, sql: &str, mark: Option<&HighWater>) -> Result<Vec<Fields>, sqlx::Error> {
        match self {
            DbPool::Postgres(pool) => fetch_fields!(pool, sql, mark, pg_value),
            DbPool::MySql(pool) => fetch_fields!(pool, sql, mark, mysql_value),
            DbPool::Sqlite(pool) => fetch_fields!(pool, sql, mark, sqlite_value),
        }
    }
}

/// A fetched row already mapped to content.
struct MappedRow {
    row_id: String,
    hash: String,
    cursor: Option<HighWater>,
    content: Content,
}

pub struct DatabaseConnector {
    core: ConnectorCore,
    config: DatabaseSourceConfig,
    dialect: Dialect,
    url: String,
    /// `SELECT` over the configured query or table.
    select: String,
    pool: Mutex<Option<DbPool>>,
    state: Mutex<SyncState>,
}

impl DatabaseConnector {
    pub fn new(id: &str, config: &SourceConfig) -> Result<Self, DataSourceError> {
        let db_config = match &config.settings {
            DataSourceConfig::Database(cfg) => cfg.clone(),
            other => {
                return Err(DataSourceError::validation(
                    id,
                    format!("expected a database source, got {}", other.source_type()),
                ))
            }
        };
        let dialect = Dialect::detect(id, &db_config.connection_string)?;

        check_identifier(id, "id_column", &db_config.id_column)?;
        check_identifier(id, "title_column", &db_config.title_column)?;
        check_identifier(id, "content_column", &db_config.content_column)?;
        if let Some(col) = &db_config.incremental_column {
            check_identifier(id, "incremental_column", col)?;
        }
        if let Some(col) = &db_config.updated_column {
            check_identifier(id, "updated_column", col)?;
        }
        if let Some(table) = &db_config.table {
            check_identifier(id, "table", table)?;
        }
        let select = match (&db_config.query, &db_config.table) {
            (Some(query), _) => format!(
                "SELECT * FROM ({}) AS src",
                query.trim().trim_end_matches(';')
            ),
            (None, Some(table)) => format!("SELECT * FROM {}", table),
            (None, None) => {
                return Err(DataSourceError::validation(id, "either query or table is required"))
            }
        };

        let url = connection_url(id, dialect, &db_config)?;

        Ok(Self {
            core: ConnectorCore::new(id, config),
            config: db_config,
            dialect,
            url,
            select,
            pool: Mutex::new(None),
            state: Mutex::new(SyncState::default()),
        })
    }

    fn incremental_select(&self, column: &str) -> String {
        format!(
            "{} WHERE {} > {} ORDER BY {}",
            self.select,
            column,
            self.dialect.placeholder(),
            column
        )
    }

    fn current_pool(&self) -> Option<DbPool> {
        self.pool
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn open_pool(&self) -> Result<DbPool, DataSourceError> {
        if let Some(pool) = self.current_pool() {
            return Ok(pool);
        }
        let max = self.config.max_connections;
        let timeout = self.core.timeout();
        let pool = match self.dialect {
            Dialect::Postgres => PgPoolOptions::new()
                .max_connections(max)
                .acquire_timeout(timeout)
                .connect(&self.url)
                .await
                .map(DbPool::Postgres),
            Dialect::MySql => MySqlPoolOptions::new()
                .max_connections(max)
                .acquire_timeout(timeout)
                .connect(&self.url)
                .await
                .map(DbPool::MySql),
            Dialect::Sqlite => SqlitePoolOptions::new()
                .max_connections(max)
                .acquire_timeout(timeout)
                .connect(&self.url)
                .await
                .map(DbPool::Sqlite),
        }
        .map_err(|e| map_sqlx_error(self.id(), e))?;
        *self.pool.lock().unwrap_or_else(|p| p.into_inner()) = Some(pool.clone());
        Ok(pool)
    }

    async fn fetch_rows(&self, after: Option<&HighWater>) -> Result<Vec<Fields>, DataSourceError> {
        let pool = self.open_pool().await?;
        let (sql, mark) = match (after, &self.config.incremental_column) {
            (Some(mark), Some(column)) => (self.incremental_select(column), Some(mark)),
            _ => (self.select.clone(), None),
        };
        tracing::debug!(source_id = %self.id(), sql = %sql, "querying rows");

        self.core
            .execute_with_retry(|| {
                let pool = pool.clone();
                let sql = sql.as_str();
                async move {
                    pool.fetch(sql, mark)
                        .await
                        .map_err(|e| map_sqlx_error(self.id(), e))
                }
            })
            .await
    }

    fn map_row(&self, fields: &Fields) -> Result<MappedRow, DataSourceError> {
        let take_string = |name: &str| -> Option<String> {
            match fields.get(name) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                Some(Value::Bool(b)) => Some(b.to_string()),
                _ => None,
            }
        };

        let row_id = take_string(&self.config.id_column).ok_or_else(|| {
            DataSourceError::parse(
                self.id(),
                "row",
                format!("missing id column '{}'", self.config.id_column),
            )
        })?;
        let text = take_string(&self.config.content_column).ok_or_else(|| {
            DataSourceError::parse(
                self.id(),
                format!("row {}", row_id),
                format!("missing content column '{}'", self.config.content_column),
            )
        })?;
        let title = take_string(&self.config.title_column).unwrap_or_default();
        let updated = self
            .config
            .updated_column
            .as_deref()
            .and_then(take_string)
            .and_then(|raw| parse_timestamp(&raw));
        let cursor = self
            .config
            .incremental_column
            .as_deref()
            .and_then(|col| fields.get(col))
            .and_then(|value| HighWater::from_json(value, self.dialect));

        let hash = format!(
            "{:x}",
            Sha256::digest(format!("{}\u{0}{}", title, text).as_bytes())
        );

        let mut metadata = fields.clone();
        for col in [
            &self.config.id_column,
            &self.config.title_column,
            &self.config.content_column,
        ] {
            metadata.remove(col);
        }
        metadata.insert("row_id".into(), Value::String(row_id.clone()));

        let id = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("db://{}/{}", self.id(), row_id).as_bytes(),
        );
        let content = Content::new(
            id.to_string(),
            self.id(),
            title,
            text,
            Value::Object(metadata),
            updated.unwrap_or_else(Utc::now),
        );
        Ok(MappedRow {
            row_id,
            hash,
            cursor,
            content,
        })
    }

    /// Map rows, collecting per-row failures instead of aborting.
    fn map_rows(&self, rows: &[Fields], errors: &mut Vec<String>) -> Vec<MappedRow> {
        rows.iter()
            .filter_map(|row| match self.map_row(row) {
                Ok(mapped) => Some(mapped),
                Err(e) => {
                    tracing::warn!(source_id = %self.id(), error = %e, "skipping row");
                    errors.push(e.to_string());
                    None
                }
            })
            .collect()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn sync_pass(&self, incremental: bool) -> Result<SyncResult, DataSourceError> {
        let mark = if incremental {
            self.lock_state().high_water.clone()
        } else {
            None
        };
        let uses_column = mark.is_some() && self.config.incremental_column.is_some();
        let rows = self.fetch_rows(mark.as_ref()).await?;

        let mut result = SyncResult::default();
        let mapped = self.map_rows(&rows, &mut result.errors);

        let mut state = self.lock_state();
        let mut seen = HashSet::with_capacity(mapped.len());
        for row in mapped {
            seen.insert(row.row_id.clone());
            if let Some(cursor) = row.cursor {
                let next = match state.high_water.take() {
                    Some(current) => current.max(cursor),
                    None => cursor,
                };
                state.high_water = Some(next);
            }
            match state.row_hashes.get(&row.row_id) {
                None => result.documents_added += 1,
                Some(previous) if *previous != row.hash => result.documents_updated += 1,
                Some(_) if incremental && !uses_column => continue,
                Some(_) => {}
            }
            result.documents_processed += 1;
            state.row_hashes.insert(row.row_id, row.hash);
        }

        if !uses_column {
            let before = state.row_hashes.len();
            state.row_hashes.retain(|id, _| seen.contains(id));
            result.documents_deleted = (before - state.row_hashes.len()) as u64;
        }
        self.core.set_document_count(state.row_hashes.len() as u64);
        Ok(result)
    }
}

fn bytes_value(bytes: Vec<u8>) -> Value {
    Value::String(String::from_utf8_lossy(&bytes).into_owned())
}

fn utc_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

fn naive_value(at: NaiveDateTime) -> Value {
    utc_value(at.and_utc())
}

fn date_value(date: NaiveDate) -> Value {
    Value::String(date.format("%Y-%m-%d").to_string())
}

fn pg_value(row: &PgRow, idx: usize) -> Value {
    decode_first!(row, idx;
        i64 => Value::from,
        i32 => Value::from,
        i16 => Value::from,
        f64 => Value::from,
        f32 => Value::from,
        bool => Value::from,
        String => Value::from,
        DateTime<Utc> => utc_value,
        NaiveDateTime => naive_value,
        NaiveDate => date_value,
        Vec<u8> => bytes_value,
    )
}

fn mysql_value(row: &MySqlRow, idx: usize) -> Value {
    decode_first!(row, idx;
        i64 => Value::from,
        u64 => Value::from,
        f64 => Value::from,
        f32 => Value::from,
        bool => Value::from,
        String => Value::from,
        DateTime<Utc> => utc_value,
        NaiveDateTime => naive_value,
        NaiveDate => date_value,
        Vec<u8> => bytes_value,
    )
}

/// SQLite decodes by storage class, so declared `DATETIME` text arrives as
/// a string.
fn sqlite_value(row: &SqliteRow, idx: usize) -> Value {
    decode_first!(row, idx;
        i64 => Value::from,
        f64 => Value::from,
        String => Value::from,
        Vec<u8> => bytes_value,
    )
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

fn map_sqlx_error(source_id: &str, err: sqlx::Error) -> DataSourceError {
    match err {
        sqlx::Error::Io(e) => DataSourceError::connection(source_id, e.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DataSourceError::connection(source_id, err.to_string())
        }
        sqlx::Error::Configuration(e) => DataSourceError::validation(source_id, e.to_string()),
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            let lowered = message.to_lowercase();
            if lowered.contains("password") || lowered.contains("authentication") {
                DataSourceError::authentication(source_id, message)
            } else {
                DataSourceError::classify(source_id, message)
            }
        }
        other => DataSourceError::classify(source_id, other.to_string()),
    }
}

#[async_trait]
impl SourceConnector for DatabaseConnector {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), DataSourceError> {
        let outcome = self
            .core
            .execute_with_retry(|| async move {
                let pool = self.open_pool().await?;
                pool.ping().await.map_err(|e| map_sqlx_error(self.id(), e))
            })
            .await;
        self.core.record_connect(&outcome);
        outcome
    }

    async fn disconnect(&self) -> Result<(), DataSourceError> {
        let pool = self.pool.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.core.set_status(SourceStatus::Inactive, None);
        Ok(())
    }

    async fn validate_connection(&self) -> bool {
        match self.open_pool().await {
            Ok(pool) => pool.ping().await.is_ok(),
            Err(_) => false,
        }
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
        let rows = self.fetch_rows(None).await?;
        let mut errors = Vec::new();
        let contents: Vec<Content> = self
            .map_rows(&rows, &mut errors)
            .into_iter()
            .map(|row| row.content)
            .filter(|content| match (last_sync, &self.config.updated_column) {
                (Some(since), Some(_)) => content.last_updated > since,
                _ => true,
            })
            .collect();
        tracing::debug!(source_id = %self.id(), documents = contents.len(), skipped = errors.len(), "read rows");
        Ok(contents)
    }
}
