//! Backend adapters and the capability interface they share.
//!
//! There are exactly two backends: the official REST API and the browser
//! session scraper. Both turn an [`ActionRequest`] into a [`RawResponse`] or a
//! [`ClassifiedError`]; neither retries.

pub mod api;
pub mod scraper;
pub mod state;

pub use api::ApiAdapter;
pub use scraper::ScraperAdapter;
pub use state::{endpoint_key, BackendState, RateLimitWindow};

use crate::action::{ActionKind, ActionRequest, MAX_PAGE_SIZE};
use crate::error::{ClassifiedError, ConnectorResult};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Retry delay used when a 429 carries no usable rate-limit metadata.
pub(crate) const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Which access mechanism handled a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Api,
    Scraper,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Api => write!(f, "api"),
            BackendKind::Scraper => write!(f, "scraper"),
        }
    }
}

/// Successful backend payload, not yet normalized.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub backend: BackendKind,
    pub kind: ActionKind,
    /// Id of the tweet or user the action targeted, when the payload may omit it
    pub target_id: Option<String>,
    pub body: serde_json::Value,
}

/// Capability interface implemented by both backends.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Static list of actions this backend can perform.
    fn capabilities(&self) -> &'static [ActionKind];

    fn supports(&self, action: ActionKind) -> bool {
        self.capabilities().contains(&action)
    }

    /// Whether credentials for this backend are present.
    fn is_ready(&self) -> bool;

    /// Whether the backend drops a repeated mutation carrying the same idempotency key.
    fn deduplicates(&self, _action: ActionKind) -> bool {
        false
    }

    fn state(&self) -> &BackendState;

    /// Perform one attempt of the action.
    async fn execute(&self, request: &ActionRequest) -> ConnectorResult<RawResponse>;
}

/// Classify a failure that happened before any HTTP status was received.
///
/// A mutating request that may have reached the server is flagged as having
/// an unknown outcome.
pub(crate) fn transport_error(
    backend: BackendKind,
    err: &reqwest::Error,
    mutating: bool,
) -> ClassifiedError {
    if err.is_builder() {
        return ClassifiedError::permanent(format!("could not build request: {}", err))
            .with_backend(backend);
    }

    let classified = ClassifiedError::transient(format!("request failed: {}", err))
        .with_backend(backend);
    if mutating && !err.is_connect() {
        classified.with_unknown_outcome()
    } else {
        classified
    }
}

/// Delay requested by a 429 response.
///
/// Prefers `retry-after`, then the window reset time, then a fixed default.
pub(crate) fn retry_after_from_headers(headers: &HeaderMap) -> Duration {
    if let Some(secs) = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Duration::from_secs(secs);
    }

    match RateLimitWindow::from_headers(headers).and_then(|w| w.reset_at) {
        Some(reset_at) => (reset_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1)),
        None => DEFAULT_RETRY_AFTER,
    }
}

/// Page size to send upstream: at least the endpoint minimum, at most
/// [`MAX_PAGE_SIZE`]. A raised size is cut back after normalization.
pub(crate) fn clamp_page_size(request: &ActionRequest, default: u32, min: u32) -> u32 {
    request.page_size(default).clamp(min, MAX_PAGE_SIZE)
}
