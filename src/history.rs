//! History replay for observers.
//!
//! Serves a bounded, newest-first slice of stored records. Requests are
//! parsed leniently: a bad `limit` falls back to the default and unparsable
//! date filters are dropped rather than rejected.

use crate::ingest::validator::{coerce_number, parse_iso_datetime};
use crate::session::Role;
use crate::store::{ClassifiedRecord, PersistenceSink, RecordQuery, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Records returned when the request names no usable limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Hard ceiling on records returned by one request.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Server-side limits on history requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryLimits {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_HISTORY_LIMIT,
            max_limit: MAX_HISTORY_LIMIT,
        }
    }
}

/// A history request as received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryRequest {
    pub limit: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl HistoryRequest {
    /// Read a request payload. Anything that is not understood is left unset.
    pub fn from_value(value: &Value) -> Self {
        let text = |keys: [&str; 2]| {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        Self {
            limit: value
                .get("limit")
                .and_then(coerce_number)
                .map(|n| n.trunc() as i64),
            start_date: text(["start_date", "startDate"]),
            end_date: text(["end_date", "endDate"]),
        }
    }
}

/// Effective parameters after defaults, caps and date parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryParams {
    pub limit: usize,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl HistoryParams {
    pub fn to_query(&self) -> RecordQuery {
        RecordQuery {
            limit: self.limit,
            start: self.start_date,
            end: self.end_date,
        }
    }
}

impl HistoryLimits {
    /// Apply defaults and the ceiling, and parse the date filters.
    pub fn resolve(&self, request: &HistoryRequest) -> HistoryParams {
        let ceiling = self.max_limit.max(1);
        let limit = match request.limit {
            Some(n) if n > 0 => (n as u64).min(ceiling as u64) as usize,
            _ => self.default_limit.clamp(1, ceiling),
        };

        let date = |name: &str, raw: &Option<String>| -> Option<DateTime<Utc>> {
            let raw = raw.as_deref()?;
            let parsed = parse_iso_datetime(raw);
            if parsed.is_none() {
                tracing::debug!("Ignoring unparsable {} filter '{}'", name, raw);
            }
            parsed
        };

        HistoryParams {
            limit,
            start_date: date("start_date", &request.start_date),
            end_date: date("end_date", &request.end_date),
        }
    }
}

/// History request failures.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryError {
    /// Only observers may read history
    Unauthorized(Role),
    Store(StoreError),
}

impl HistoryError {
    pub fn code(&self) -> &'static str {
        match self {
            HistoryError::Unauthorized(_) => "UNAUTHORIZED",
            HistoryError::Store(_) => "PERSISTENCE_FAILURE",
        }
    }
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::Unauthorized(role) => write!(
                f,
                "Unauthorized: only observer clients can request history (role: {role})"
            ),
            HistoryError::Store(e) => write!(f, "History request error: {e}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// One page of history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub records: Vec<ClassifiedRecord>,
    pub params: HistoryParams,
}

/// Answers history requests from the record store.
#[derive(Clone)]
pub struct HistoryService {
    sink: PersistenceSink,
    limits: HistoryLimits,
}

impl HistoryService {
    pub fn new(sink: PersistenceSink, limits: HistoryLimits) -> Self {
        Self { sink, limits }
    }

    pub fn limits(&self) -> HistoryLimits {
        self.limits
    }

    pub async fn query(
        &self,
        role: Role,
        request: &HistoryRequest,
    ) -> Result<HistoryPage, HistoryError> {
        if role != Role::Observer {
            return Err(HistoryError::Unauthorized(role));
        }
        let params = self.limits.resolve(request);
        let records = self
            .sink
            .query(params.to_query())
            .await
            .map_err(HistoryError::Store)?;
        Ok(HistoryPage { records, params })
    }
}
