//! Browser session refresh.
//!
//! Concurrent callers that find the session stale share one exchange: the
//! first caller starts it, everyone else awaits the same future.

use super::client::{is_challenge, web_headers};
use crate::backend::{retry_after_from_headers, transport_error, BackendKind};
use crate::credentials::{CredentialKind, CredentialStore, Credentials, ScraperCredentials};
use crate::error::{ClassifiedError, ConnectorResult};
use crate::session_store::SessionStore;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::SET_COOKIE;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

type RefreshFuture = Shared<BoxFuture<'static, ConnectorResult<Arc<ScraperCredentials>>>>;

/// Keeps the scraper session fresh, one exchange at a time.
pub struct SessionRefresher {
    client: Client,
    settings_url: String,
    bearer_token: String,
    ttl: ChronoDuration,
    margin: ChronoDuration,
    credentials: Arc<CredentialStore>,
    store: Option<SessionStore>,
    in_flight: Mutex<Option<RefreshFuture>>,
    exchanges: AtomicU64,
}

impl SessionRefresher {
    pub fn new(
        client: Client,
        base_url: &str,
        bearer_token: &str,
        ttl: std::time::Duration,
        margin: std::time::Duration,
        credentials: Arc<CredentialStore>,
        store: Option<SessionStore>,
    ) -> Self {
        Self {
            client,
            settings_url: format!(
                "{}/i/api/1.1/account/settings.json",
                base_url.trim_end_matches('/')
            ),
            bearer_token: bearer_token.to_string(),
            ttl: to_chrono(ttl),
            margin: to_chrono(margin),
            credentials,
            store,
            in_flight: Mutex::new(None),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Number of refresh exchanges actually sent.
    pub fn refresh_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Session credentials that are safe to use now, refreshing first if needed.
    pub async fn current(self: &Arc<Self>) -> ConnectorResult<Arc<ScraperCredentials>> {
        let credentials = self.stored()?;
        if !credentials.needs_refresh(Utc::now(), self.margin) {
            return Ok(credentials);
        }

        let shared = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(running) if running.peek().is_none() => {
                    debug!("Joining in-flight session refresh");
                    running.clone()
                }
                _ => {
                    // Another caller may have finished a refresh since the first check.
                    let credentials = self.stored()?;
                    if !credentials.needs_refresh(Utc::now(), self.margin) {
                        *slot = None;
                        return Ok(credentials);
                    }

                    let this = Arc::clone(self);
                    let exchange = async move { this.exchange().await }.boxed().shared();
                    *slot = Some(exchange.clone());
                    exchange
                }
            }
        };

        let result = shared.clone().await;

        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|running| Shared::ptr_eq(running, &shared))
        {
            *slot = None;
        }

        result
    }

    /// Mark a session the server rejected so the next call refreshes it.
    ///
    /// Only the exact session that was sent is invalidated; one swapped in by
    /// a concurrent refresh is left alone.
    pub fn invalidate(&self, rejected: &Arc<ScraperCredentials>) -> ConnectorResult<()> {
        let stored = self.stored()?;
        if !Arc::ptr_eq(&stored, rejected) || stored.expiry.is_none() {
            return Ok(());
        }

        warn!("Scraper session rejected by the server, forcing a refresh");
        let mut next = (*stored).clone();
        next.expiry = None;
        self.credentials
            .refresh(CredentialKind::Scraper, Credentials::Scraper(Arc::new(next)))
            .map_err(|e| e.with_backend(BackendKind::Scraper))
    }

    fn stored(&self) -> ConnectorResult<Arc<ScraperCredentials>> {
        self.credentials
            .scraper()
            .map_err(|e| e.with_backend(BackendKind::Scraper))
    }

    async fn exchange(&self) -> ConnectorResult<Arc<ScraperCredentials>> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        let current = self.stored()?;

        info!("Refreshing scraper session");

        let response = self
            .client
            .get(&self.settings_url)
            .headers(web_headers(&self.bearer_token, &current))
            .send()
            .await
            .map_err(|e| transport_error(BackendKind::Scraper, &e, false))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(BackendKind::Scraper, &e, false))?;

        if is_challenge(status, &headers, &body) {
            warn!(status = %status, "Session refresh hit an account challenge");
            return Err(ClassifiedError::auth(
                "session refresh rejected: account challenge required",
            )
            .with_backend(BackendKind::Scraper));
        }

        let error = match status {
            s if s.is_success() => None,
            StatusCode::TOO_MANY_REQUESTS => Some(ClassifiedError::rate_limited(
                retry_after_from_headers(&headers),
                "session refresh rate limited",
            )),
            s if s.is_server_error() => Some(ClassifiedError::transient(format!(
                "session refresh failed with {}",
                s
            ))),
            s => Some(ClassifiedError::auth(format!(
                "session refresh rejected with {}",
                s
            ))),
        };
        if let Some(error) = error {
            warn!(status = %status, "Session refresh failed");
            return Err(error.with_backend(BackendKind::Scraper));
        }

        let mut next = (*current).clone();
        for cookie in headers.get_all(SET_COOKIE) {
            let Some((name, value)) = cookie.to_str().ok().and_then(parse_set_cookie) else {
                continue;
            };
            match name.as_str() {
                "ct0" => next.csrf_token = Some(value),
                "auth_token" => next.auth_token = value,
                _ => {
                    next.session_cookies.insert(name, value);
                }
            }
        }

        if next.csrf_token.is_none() {
            return Err(
                ClassifiedError::auth("session refresh did not yield a csrf token")
                    .with_backend(BackendKind::Scraper),
            );
        }
        next.expiry = Some(Utc::now() + self.ttl);

        let next = Arc::new(next);
        self.credentials
            .refresh(CredentialKind::Scraper, Credentials::Scraper(Arc::clone(&next)))
            .map_err(|e| e.with_backend(BackendKind::Scraper))?;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&next) {
                warn!(error = %e, "Failed to persist refreshed session");
            }
        }

        info!(expiry = ?next.expiry, "Scraper session refreshed");
        Ok(next)
    }
}

/// `name=value` from a `Set-Cookie` header. Deletions (empty values) are skipped.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let (name, value) = (name.trim(), value.trim().trim_matches('"'));
    if name.is_empty() || value.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(3650))
}
