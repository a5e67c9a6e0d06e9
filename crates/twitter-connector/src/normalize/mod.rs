//! Backend payload normalization.
//!
//! Every action kind has exactly one result shape, whichever backend served
//! it. Each backend has one parser per shape. Normalization is pure: a 2xx
//! payload that does not fit its shape becomes a permanent error, never a
//! partially filled result.

mod api;
mod scraper;

use crate::action::ActionKind;
use crate::backend::{BackendKind, RawResponse};
use crate::error::{ClassifiedError, ConnectorResult};
use crate::model::ActionResult;
use thiserror::Error;

/// Result shape an action kind produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Tweet,
    TweetPage,
    User,
    UserPage,
    Acknowledgement,
}

impl ResultShape {
    pub fn of(kind: ActionKind) -> Self {
        match kind {
            ActionKind::PostTweet | ActionKind::ReplyTweet | ActionKind::GetTweet => {
                ResultShape::Tweet
            }
            ActionKind::GetTimeline
            | ActionKind::GetUserTweets
            | ActionKind::SearchRecent
            | ActionKind::SearchAll
            | ActionKind::GetBookmarks => ResultShape::TweetPage,
            ActionKind::GetMe | ActionKind::GetUser => ResultShape::User,
            ActionKind::GetFollowers | ActionKind::GetFollowing => ResultShape::UserPage,
            ActionKind::DeleteTweet
            | ActionKind::Follow
            | ActionKind::Unfollow
            | ActionKind::Like
            | ActionKind::Unlike
            | ActionKind::Retweet
            | ActionKind::Unretweet => ResultShape::Acknowledgement,
        }
    }
}

/// Why a payload could not be normalized.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ShapeError {
    /// The payload is well formed but the entity is gone
    #[error("{0}")]
    Missing(String),
    #[error("{0}")]
    Malformed(String),
}

impl ShapeError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ShapeError::Malformed(message.into())
    }

    pub(crate) fn missing(message: impl Into<String>) -> Self {
        ShapeError::Missing(message.into())
    }
}

pub(crate) type ShapeResult<T> = Result<T, ShapeError>;

/// Convert a raw backend payload into the canonical result for its kind.
pub fn normalize(raw: &RawResponse) -> ConnectorResult<ActionResult> {
    let shape = ResultShape::of(raw.kind);
    let parsed = match raw.backend {
        BackendKind::Api => api::parse(shape, raw),
        BackendKind::Scraper => scraper::parse(shape, raw),
    };

    parsed.map_err(|e| {
        let error = match e {
            ShapeError::Missing(message) => ClassifiedError::not_found(message),
            ShapeError::Malformed(message) => ClassifiedError::permanent(format!(
                "unexpected {} response for {}: {}",
                raw.backend, raw.kind, message
            )),
        };
        error.with_backend(raw.backend)
    })
}
