//! Backend selection per action.

use crate::action::ActionKind;
use crate::backend::{BackendAdapter, BackendKind};
use crate::error::{ClassifiedError, ConnectorResult};
use shared::BackendMode;
use std::sync::Arc;

/// Picks the adapter for an action from the mode and each adapter's readiness
/// and capabilities. Holds no state beyond the adapters themselves.
#[derive(Clone, Default)]
pub struct BackendSelector {
    api: Option<Arc<dyn BackendAdapter>>,
    scraper: Option<Arc<dyn BackendAdapter>>,
}

impl BackendSelector {
    pub fn new(
        api: Option<Arc<dyn BackendAdapter>>,
        scraper: Option<Arc<dyn BackendAdapter>>,
    ) -> Self {
        Self { api, scraper }
    }

    pub fn adapter(&self, kind: BackendKind) -> Option<&Arc<dyn BackendAdapter>> {
        match kind {
            BackendKind::Api => self.api.as_ref(),
            BackendKind::Scraper => self.scraper.as_ref(),
        }
    }

    /// Adapter that will serve `action` under `mode`.
    pub fn select(
        &self,
        action: ActionKind,
        mode: BackendMode,
    ) -> ConnectorResult<Arc<dyn BackendAdapter>> {
        match mode {
            BackendMode::ApiOnly => self.pinned(BackendKind::Api, action),
            BackendMode::ScraperOnly => self.pinned(BackendKind::Scraper, action),
            BackendMode::PreferApi => self.preferred(BackendKind::Api, BackendKind::Scraper, action),
            BackendMode::PreferScraper => {
                self.preferred(BackendKind::Scraper, BackendKind::Api, action)
            }
        }
    }

    fn usable(&self, kind: BackendKind, action: ActionKind) -> Option<&Arc<dyn BackendAdapter>> {
        self.adapter(kind)
            .filter(|adapter| adapter.is_ready() && adapter.supports(action))
    }

    fn pinned(
        &self,
        kind: BackendKind,
        action: ActionKind,
    ) -> ConnectorResult<Arc<dyn BackendAdapter>> {
        match self.adapter(kind) {
            Some(adapter) if !adapter.is_ready() => Err(ClassifiedError::not_configured(format!(
                "{} backend has no credentials",
                kind
            ))
            .with_backend(kind)),
            Some(adapter) if !adapter.supports(action) => {
                Err(ClassifiedError::not_configured(format!(
                    "{} backend does not support {}",
                    kind, action
                ))
                .with_backend(kind))
            }
            Some(adapter) => Ok(Arc::clone(adapter)),
            None => Err(ClassifiedError::not_configured(format!(
                "{} backend is not configured",
                kind
            ))
            .with_backend(kind)),
        }
    }

    fn preferred(
        &self,
        first: BackendKind,
        second: BackendKind,
        action: ActionKind,
    ) -> ConnectorResult<Arc<dyn BackendAdapter>> {
        self.usable(first, action)
            .or_else(|| self.usable(second, action))
            .map(Arc::clone)
            .ok_or_else(|| {
                ClassifiedError::not_configured(format!(
                    "no configured backend supports {}",
                    action
                ))
            })
    }
}
