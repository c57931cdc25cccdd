//! Error taxonomy for connectors.
//!
//! Every failure that crosses a connector boundary is normalized into a
//! [`DataSourceError`]. Each variant carries the id of the source it came from
//! and a retryable flag that [`crate::retry::RetryPolicy`] consults before
//! re-attempting an operation.

use std::time::Duration;

use thiserror::Error;

/// Substrings that mark a foreign error message as a transient connection
/// problem.
const CONNECTION_HINTS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "enotfound",
    "etimedout",
    "connection",
    "network",
    "socket",
    "broken pipe",
    "timed out",
    "unreachable",
];

/// Errors raised by connectors and their shared retry/timeout machinery.
#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("[{source_id}] connection failed: {message}")]
    Connection { source_id: String, message: String },

    #[error("[{source_id}] authentication failed: {message}")]
    Authentication { source_id: String, message: String },

    #[error("[{source_id}] invalid configuration: {message}")]
    Validation { source_id: String, message: String },

    #[error("[{source_id}] operation timed out after {}ms", .timeout.as_millis())]
    Timeout { source_id: String, timeout: Duration },

    #[error("[{source_id}] rate limited by upstream{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimit {
        source_id: String,
        retry_after: Option<Duration>,
    },

    #[error("[{source_id}] failed to parse {item}: {message}")]
    Parse {
        source_id: String,
        item: String,
        message: String,
    },

    #[error("[{source_id}] {message}")]
    Unknown { source_id: String, message: String },

    #[error("[{source_id}] giving up after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        source_id: String,
        attempts: u32,
        #[source]
        last: Box<DataSourceError>,
    },
}

impl DataSourceError {
    pub fn connection(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn authentication(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn validation(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn parse(
        source_id: impl Into<String>,
        item: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Parse {
            source_id: source_id.into(),
            item: item.into(),
            message: message.into(),
        }
    }

    /// Normalize an arbitrary error message into the taxonomy.
    ///
    /// Connection-looking messages become a retryable [`Connection`](Self::Connection)
    /// error; anything else is a non-retryable [`Unknown`](Self::Unknown).
    pub fn classify(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        let source_id = source_id.into();
        let message = message.into();
        let lowered = message.to_lowercase();
        if CONNECTION_HINTS.iter().any(|hint| lowered.contains(hint)) {
            Self::Connection { source_id, message }
        } else {
            Self::Unknown { source_id, message }
        }
    }

    /// Map a `reqwest` transport error.
    pub fn from_reqwest(source_id: &str, err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                source_id: source_id.to_string(),
                timeout,
            }
        } else if err.is_connect() || err.is_request() {
            Self::connection(source_id, err.to_string())
        } else {
            Self::classify(source_id, err.to_string())
        }
    }

    /// Map an HTTP status returned by an upstream API.
    pub fn from_status(
        source_id: &str,
        status: reqwest::StatusCode,
        retry_after: Option<Duration>,
        body: &str,
    ) -> Self {
        let snippet: String = body.chars().take(200).collect();
        match status.as_u16() {
            401 | 403 => Self::authentication(source_id, format!("HTTP {}: {}", status, snippet)),
            429 => Self::RateLimit {
                source_id: source_id.to_string(),
                retry_after,
            },
            code if code >= 500 => {
                Self::connection(source_id, format!("server error HTTP {}: {}", status, snippet))
            }
            _ => Self::validation(
                source_id,
                format!("unexpected HTTP {}: {}", status, snippet),
            ),
        }
    }

    /// Whether the retry wrapper may re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::RateLimit { .. } => true,
            Self::Authentication { .. }
            | Self::Validation { .. }
            | Self::Parse { .. }
            | Self::Unknown { .. }
            | Self::MaxRetriesExceeded { .. } => false,
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            Self::Connection { source_id, .. }
            | Self::Authentication { source_id, .. }
            | Self::Validation { source_id, .. }
            | Self::Timeout { source_id, .. }
            | Self::RateLimit { source_id, .. }
            | Self::Parse { source_id, .. }
            | Self::Unknown { source_id, .. }
            | Self::MaxRetriesExceeded { source_id, .. } => source_id,
        }
    }

    /// Stable machine-readable code for logs and serialized results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Authentication { .. } => "AUTHENTICATION_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Timeout { .. } => "TIMEOUT_ERROR",
            Self::RateLimit { .. } => "RATE_LIMIT_ERROR",
            Self::Parse { .. } => "PARSE_ERROR",
            Self::Unknown { .. } => "UNKNOWN_ERROR",
            Self::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_flags() {
        assert!(DataSourceError::connection("s", "down").is_retryable());
        assert!(DataSourceError::Timeout {
            source_id: "s".into(),
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!DataSourceError::authentication("s", "bad key").is_retryable());
        assert!(!DataSourceError::validation("s", "missing path").is_retryable());
        assert!(!DataSourceError::parse("s", "a.pdf", "corrupt").is_retryable());
    }

    #[test]
    fn test_classify_connection_like_messages() {
        let err = DataSourceError::classify("s", "connect ECONNREFUSED 127.0.0.1:5432");
        assert!(matches!(err, DataSourceError::Connection { .. }));
        assert!(err.is_retryable());

        let err = DataSourceError::classify("s", "column \"title\" does not exist");
        assert!(matches!(err, DataSourceError::Unknown { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;
        let auth = DataSourceError::from_status("api", StatusCode::UNAUTHORIZED, None, "");
        assert_eq!(auth.code(), "AUTHENTICATION_ERROR");
        let forbidden = DataSourceError::from_status("api", StatusCode::FORBIDDEN, None, "");
        assert!(!forbidden.is_retryable());
        let limited = DataSourceError::from_status(
            "api",
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "",
        );
        assert!(limited.is_retryable());
        assert!(limited.to_string().contains("retry after 3s"));
        let server = DataSourceError::from_status("api", StatusCode::BAD_GATEWAY, None, "oops");
        assert!(server.is_retryable());
        assert_eq!(server.code(), "CONNECTION_ERROR");
    }

    #[test]
    fn test_max_retries_wraps_last_error() {
        let err = DataSourceError::MaxRetriesExceeded {
            source_id: "db".into(),
            attempts: 3,
            last: Box::new(DataSourceError::connection("db", "refused")),
        };
        assert_eq!(err.code(), "MAX_RETRIES_EXCEEDED");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
