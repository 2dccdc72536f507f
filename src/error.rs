use crate::http::RequestError;
use std::fmt;
use std::time::Duration;

/// Failure taxonomy shared by the resync and live-event paths.
///
/// Each variant maps to one blast radius:
/// - `Load` stops the integration from starting
/// - `Fetch` fails a single kind for the current pass
/// - `Mapping` skips a single record
/// - `Apply` fails a single batch (retried first)
/// - `Auth` / `Validation` reject a single live event
/// - `RateLimited` and transient `Upstream` errors trigger backoff
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Malformed mapping specification or configuration.
    Load(String),
    /// The raw data producer could not deliver records for a kind.
    Fetch {
        kind: String,
        message: String,
        transient: bool,
    },
    /// Expression evaluation failed for one record.
    Mapping {
        kind: String,
        record: Option<String>,
        message: String,
    },
    /// A catalog write or read failed.
    Apply { message: String, transient: bool },
    /// A live event failed authentication.
    Auth(String),
    /// A live event payload has the wrong shape.
    Validation(String),
    /// The remote asked us to slow down.
    RateLimited { retry_after: Option<Duration> },
    /// Outbound request to an upstream API failed.
    Upstream(RequestError),
    /// Work was abandoned because shutdown was requested.
    Cancelled,
}

impl SyncError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } => true,
            SyncError::Upstream(e) => e.is_transient(),
            SyncError::Fetch { transient, .. } => *transient,
            SyncError::Apply { transient, .. } => *transient,
            SyncError::Load(_)
            | SyncError::Mapping { .. }
            | SyncError::Auth(_)
            | SyncError::Validation(_)
            | SyncError::Cancelled => false,
        }
    }

    /// Re-tags an upstream failure as a fetch failure for `kind`.
    pub fn into_fetch(self, kind: &str) -> Self {
        match self {
            SyncError::Fetch { .. } | SyncError::Cancelled => self,
            other => SyncError::Fetch {
                kind: kind.to_string(),
                transient: other.is_transient(),
                message: other.to_string(),
            },
        }
    }

    /// Re-tags any failure as an apply failure, keeping its transience.
    pub fn into_apply(self) -> Self {
        match self {
            SyncError::Apply { .. } | SyncError::Cancelled => self,
            other => SyncError::Apply {
                transient: other.is_transient(),
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Load(msg) => write!(f, "invalid configuration: {}", msg),
            SyncError::Fetch { kind, message, .. } => {
                write!(f, "failed to fetch kind '{}': {}", kind, message)
            }
            SyncError::Mapping {
                kind,
                record,
                message,
            } => match record {
                Some(record) => write!(
                    f,
                    "failed to map record '{}' of kind '{}': {}",
                    record, kind, message
                ),
                None => write!(f, "failed to map record of kind '{}': {}", kind, message),
            },
            SyncError::Apply { message, .. } => write!(f, "catalog write failed: {}", message),
            SyncError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            SyncError::Validation(msg) => write!(f, "invalid payload: {}", msg),
            SyncError::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(f, "rate limited, retry after {}ms", d.as_millis()),
                None => write!(f, "rate limited"),
            },
            SyncError::Upstream(e) => write!(f, "upstream request failed: {}", e),
            SyncError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<RequestError> for SyncError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::RateLimited { retry_after } => SyncError::RateLimited { retry_after },
            other => SyncError::Upstream(other),
        }
    }
}
