//! Per-adapter mutable state: rate-limit windows and failure streak.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Rate-limit metadata from the last response that carried any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitWindow {
    /// Requests allowed in the window
    pub limit: Option<u32>,
    /// Requests left in the window
    pub remaining: Option<u32>,
    /// When the window resets
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitWindow {
    /// Parse the `x-rate-limit-*` headers. `None` if none are present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let number = |name: &str| -> Option<u64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        };

        let window = Self {
            limit: number("x-rate-limit-limit").and_then(|v| u32::try_from(v).ok()),
            remaining: number("x-rate-limit-remaining").and_then(|v| u32::try_from(v).ok()),
            reset_at: number("x-rate-limit-reset")
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        };

        if window == Self::default() {
            None
        } else {
            Some(window)
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// How long to hold off at `now`, if the window is used up and not yet reset.
    pub fn blocked_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_exhausted() {
            return None;
        }
        let reset_at = self.reset_at?;
        (reset_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Rate-limit bucket for a request path: numeric ids and looked-up handles
/// are replaced by placeholders, and any scheme, host or query is dropped.
///
/// `/2/users/42/likes` and `/2/users/7/likes` share one window.
pub fn endpoint_key(url_or_path: &str) -> String {
    let path = Url::parse(url_or_path)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| {
            url_or_path
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string()
        });

    let mut key = Vec::new();
    let mut after_username = false;
    for segment in path.split('/') {
        let replaced = if after_username {
            ":username"
        } else if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            ":id"
        } else {
            segment
        };
        after_username = segment == "username";
        key.push(replaced);
    }
    key.join("/")
}

/// State owned by one adapter and shared by its concurrent calls.
///
/// Windows are kept per endpoint, each replaced as a whole `Arc` so readers
/// never see a partial update.
#[derive(Debug, Default)]
pub struct BackendState {
    windows: RwLock<HashMap<String, Arc<RateLimitWindow>>>,
    consecutive_failures: AtomicU32,
}

impl BackendState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the window of `endpoint` from a response, if it carried rate-limit headers.
    pub fn observe_headers(&self, endpoint: &str, headers: &HeaderMap) {
        if let Some(window) = RateLimitWindow::from_headers(headers) {
            self.record_window(endpoint, window);
        }
    }

    pub fn record_window(&self, endpoint: &str, window: RateLimitWindow) {
        debug!(
            endpoint = %endpoint,
            remaining = ?window.remaining,
            reset_at = ?window.reset_at,
            "Rate limit window updated"
        );
        self.windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string(), Arc::new(window));
    }

    pub fn window(&self, endpoint: &str) -> Option<Arc<RateLimitWindow>> {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }

    /// Delay to respect before sending to `endpoint`, based on its last window.
    pub fn preemptive_backoff(&self, endpoint: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.window(endpoint)?.blocked_for(now)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Bump the failure streak and return the new count.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(remaining: &str, reset: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-limit", HeaderValue::from_static("300"));
        headers.insert("x-rate-limit-remaining", HeaderValue::from_str(remaining).unwrap());
        headers.insert(
            "x-rate-limit-reset",
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        headers
    }

    #[test]
    fn test_parse_headers() {
        let window = RateLimitWindow::from_headers(&headers("12", 1_700_000_000)).unwrap();
        assert_eq!(window.limit, Some(300));
        assert_eq!(window.remaining, Some(12));
        assert_eq!(window.reset_at.map(|r| r.timestamp()), Some(1_700_000_000));
        assert!(!window.is_exhausted());
    }

    #[test]
    fn test_no_headers() {
        assert!(RateLimitWindow::from_headers(&HeaderMap::new()).is_none());
    }

    const ME: &str = "/2/users/me";

    #[test]
    fn test_preemptive_backoff_when_exhausted() {
        let state = BackendState::new();
        let now = Utc::now();
        assert!(state.preemptive_backoff(ME, now).is_none());

        state.observe_headers(ME, &headers("0", now.timestamp() + 10));
        let wait = state.preemptive_backoff(ME, now).unwrap();
        assert!(wait <= Duration::from_secs(10) && wait > Duration::from_secs(8));

        // Once the reset time has passed nothing blocks.
        assert!(state
            .preemptive_backoff(ME, now + chrono::Duration::seconds(11))
            .is_none());
    }

    #[test]
    fn test_latest_window_visible() {
        let state = BackendState::new();
        let now = Utc::now();
        state.observe_headers(ME, &headers("0", now.timestamp() + 60));
        state.observe_headers(ME, &headers("5", now.timestamp() + 60));
        assert!(state.preemptive_backoff(ME, now).is_none());
        assert_eq!(state.window(ME).and_then(|w| w.remaining), Some(5));
    }

    #[test]
    fn test_exhausted_endpoint_does_not_block_others() {
        let state = BackendState::new();
        let now = Utc::now();
        state.observe_headers(ME, &headers("0", now.timestamp() + 60));

        assert!(state.preemptive_backoff(ME, now).is_some());
        assert!(state.preemptive_backoff("/2/tweets", now).is_none());
    }

    #[test]
    fn test_endpoint_key() {
        assert_eq!(endpoint_key("https://api.x.com/2/users/42/likes"), "/2/users/:id/likes");
        assert_eq!(
            endpoint_key("http://127.0.0.1:8080/2/users/7/likes?x=1"),
            "/2/users/:id/likes"
        );
        assert_eq!(
            endpoint_key("/2/users/by/username/jack"),
            "/2/users/by/username/:username"
        );
        assert_eq!(
            endpoint_key("/i/api/graphql/abc123/CreateTweet"),
            "/i/api/graphql/abc123/CreateTweet"
        );
        assert_eq!(endpoint_key("/2/tweets/1234?expansions=a"), "/2/tweets/:id");
    }

    #[test]
    fn test_failure_streak() {
        let state = BackendState::new();
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        state.record_success();
        assert_eq!(state.consecutive_failures(), 0);
    }
}
