//! Scripted backend adapter for unit tests.

use crate::action::{ActionKind, ActionRequest};
use crate::backend::{BackendAdapter, BackendKind, BackendState, RawResponse};
use crate::error::{ClassifiedError, ConnectorResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) const API_KINDS: &[ActionKind] = &[
    ActionKind::PostTweet,
    ActionKind::ReplyTweet,
    ActionKind::DeleteTweet,
    ActionKind::GetTweet,
    ActionKind::GetTimeline,
    ActionKind::GetUserTweets,
    ActionKind::SearchRecent,
    ActionKind::SearchAll,
    ActionKind::GetMe,
    ActionKind::GetUser,
    ActionKind::Follow,
    ActionKind::Unfollow,
    ActionKind::GetFollowers,
    ActionKind::GetFollowing,
    ActionKind::Like,
    ActionKind::Unlike,
    ActionKind::Retweet,
    ActionKind::Unretweet,
];

pub(crate) const SCRAPER_KINDS: &[ActionKind] = &[
    ActionKind::PostTweet,
    ActionKind::GetTimeline,
    ActionKind::GetTweet,
    ActionKind::GetBookmarks,
];

/// Adapter that replays a script of outcomes and records every call.
pub(crate) struct FakeAdapter {
    kind: BackendKind,
    capabilities: &'static [ActionKind],
    ready: bool,
    delay: Option<Duration>,
    script: Mutex<VecDeque<ConnectorResult<Value>>>,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
    state: BackendState,
}

impl FakeAdapter {
    pub(crate) fn new(kind: BackendKind, capabilities: &'static [ActionKind]) -> Self {
        Self {
            kind,
            capabilities,
            ready: true,
            delay: None,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
            state: BackendState::new(),
        }
    }

    pub(crate) fn api() -> Self {
        Self::new(BackendKind::Api, API_KINDS)
    }

    pub(crate) fn scraper() -> Self {
        Self::new(BackendKind::Scraper, SCRAPER_KINDS)
    }

    pub(crate) fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue the outcome of the next call.
    pub(crate) fn push(&self, outcome: ConnectorResult<Value>) -> &Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendAdapter for FakeAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> &'static [ActionKind] {
        self.capabilities
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    async fn execute(&self, request: &ActionRequest) -> ConnectorResult<RawResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClassifiedError::permanent("script exhausted")));

        outcome.map(|body| RawResponse {
            backend: self.kind,
            kind: request.kind,
            target_id: request.payload.tweet_id.clone(),
            body,
        })
    }
}
