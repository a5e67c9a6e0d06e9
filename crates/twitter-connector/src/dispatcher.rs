//! Public entry point: validate, select, invoke, normalize, retry.

use crate::action::ActionRequest;
use crate::backend::{ApiAdapter, BackendAdapter, BackendKind, ScraperAdapter};
use crate::credentials::{CredentialKind, CredentialStore};
use crate::error::{ClassifiedError, ConnectorResult, ErrorKind};
use crate::ledger::{Claim, IdempotencyLedger, LedgerGuard};
use crate::model::ActionResult;
use crate::normalize::normalize;
use crate::retry::RetryPolicy;
use crate::selector::BackendSelector;
use crate::session_store::SessionStore;
use anyhow::Result;
use shared::config::ConnectorConfig;
use shared::BackendMode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Completed idempotency keys remembered when no capacity is configured.
const DEFAULT_LEDGER_CAPACITY: usize = 1024;

/// Dispatches host actions to a backend and owns the retry policy.
///
/// Cheap to share: wrap in an `Arc` and call [`Dispatcher::dispatch`] from as
/// many tasks as needed. Dropping a dispatch future stops it; an action the
/// backend already committed is not undone.
pub struct Dispatcher {
    selector: BackendSelector,
    mode: BackendMode,
    retry: RetryPolicy,
    ledger: IdempotencyLedger,
}

impl Dispatcher {
    pub fn new(selector: BackendSelector, mode: BackendMode, retry: RetryPolicy) -> Self {
        Self {
            selector,
            mode,
            retry,
            ledger: IdempotencyLedger::new(DEFAULT_LEDGER_CAPACITY),
        }
    }

    /// Remember at most `capacity` completed idempotency keys.
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger = IdempotencyLedger::new(capacity);
        self
    }

    /// Build both adapters from configuration around one credential store.
    ///
    /// An adapter is only created for credential kinds that were supplied.
    pub fn from_config(
        config: &ConnectorConfig,
        credentials: Arc<CredentialStore>,
        session_store: Option<SessionStore>,
    ) -> Result<Self> {
        let api: Option<Arc<dyn BackendAdapter>> = if credentials.has(CredentialKind::Api) {
            Some(Arc::new(ApiAdapter::new(&config.api, Arc::clone(&credentials))?))
        } else {
            None
        };

        let scraper: Option<Arc<dyn BackendAdapter>> =
            if credentials.has(CredentialKind::Scraper) {
                Some(Arc::new(ScraperAdapter::new(
                    &config.scraper,
                    Arc::clone(&credentials),
                    session_store,
                )?))
            } else {
                None
            };

        info!(
            mode = %config.mode,
            api = api.is_some(),
            scraper = scraper.is_some(),
            "Dispatcher initialized"
        );

        Ok(Self::new(
            BackendSelector::new(api, scraper),
            config.mode,
            RetryPolicy::from(&config.retry),
        )
        .with_ledger_capacity(config.idempotency_capacity))
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Perform one host action.
    #[instrument(skip(self, request), fields(kind = %request.kind, mode = %self.mode))]
    pub async fn dispatch(&self, request: &ActionRequest) -> ConnectorResult<ActionResult> {
        request.validate()?;

        let key = request
            .idempotency_key
            .as_ref()
            .filter(|_| request.kind.is_mutating())
            .map(|key| (request.kind, key.clone()));

        let Some(key) = key else {
            return self.run(request).await;
        };

        let guard = loop {
            match self.ledger.claim(&key) {
                Claim::Owner(guard) => break guard,
                Claim::Recorded(result) => {
                    info!(idempotency_key = %key.1, "Replaying recorded result");
                    return Ok(result);
                }
                Claim::Wait(mut receiver) => {
                    debug!(idempotency_key = %key.1, "Waiting for in-flight request with the same key");
                    // An error means the owner was dropped and the key is free again.
                    let _ = receiver.changed().await;
                    let published = receiver.borrow().clone();
                    if let Some(outcome) = published {
                        return outcome;
                    }
                }
            }
        };

        self.run_owned(request, guard).await
    }

    /// Like [`Dispatcher::dispatch`], giving up after `limit`.
    ///
    /// A mutation cut off by the limit may already have been committed, so
    /// its error carries `outcome_unknown`.
    pub async fn dispatch_within(
        &self,
        request: &ActionRequest,
        limit: Option<Duration>,
    ) -> ConnectorResult<ActionResult> {
        let Some(limit) = limit else {
            return self.dispatch(request).await;
        };

        match tokio::time::timeout(limit, self.dispatch(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = ClassifiedError::transient(format!(
                    "{} did not finish within {}s",
                    request.kind,
                    limit.as_secs_f64()
                ));
                warn!(kind = %request.kind, limit_ms = limit.as_millis(), "Action timed out");
                if request.kind.is_mutating() {
                    Err(error.with_unknown_outcome())
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn run_owned(
        &self,
        request: &ActionRequest,
        guard: LedgerGuard<'_>,
    ) -> ConnectorResult<ActionResult> {
        let outcome = self.run(request).await;
        guard.finish(&outcome);
        outcome
    }

    /// Select an adapter and run the attempt loop.
    async fn run(&self, request: &ActionRequest) -> ConnectorResult<ActionResult> {
        let adapter = self.selector.select(request.kind, self.mode)?;
        let backend = adapter.kind();
        debug!(backend = %backend, "Backend selected");

        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = match adapter.execute(request).await {
                Ok(raw) => normalize(&raw).map(|r| r.truncated(request.payload.max_results)),
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(result) => {
                    adapter.state().record_success();
                    info!(backend = %backend, attempts = attempt, "Action completed");
                    return Ok(result);
                }
                Err(error) => finish_error(error, backend, attempt),
            };

            if !matches!(error.kind, ErrorKind::NotFound | ErrorKind::Validation) {
                let failures = adapter.state().record_failure();
                debug!(backend = %backend, consecutive_failures = failures, "Backend failure recorded");
            }

            if error.outcome_unknown && !adapter.deduplicates(request.kind) {
                warn!(
                    backend = %backend,
                    attempts = attempt,
                    error = %error,
                    "Outcome unknown, not retrying a mutation the backend cannot deduplicate"
                );
                return Err(error);
            }

            if !error.is_retryable() || attempt >= self.retry.max_attempts() {
                warn!(backend = %backend, attempts = attempt, error = %error, "Action failed");
                return Err(error);
            }

            let delay = self.retry.delay_for(attempt, error.kind.retry_after());
            warn!(
                backend = %backend,
                attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "Retrying action"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn finish_error(error: ClassifiedError, backend: BackendKind, attempt: u32) -> ClassifiedError {
    let error = if error.backend.is_none() {
        error.with_backend(backend)
    } else {
        error
    };
    error.with_attempts(attempt)
}
