//! Action requests accepted from the host.
//!
//! A request is a kind plus a loosely-typed payload bag; [`ActionRequest::validate`]
//! decides which payload fields each kind requires before any backend is touched.

use crate::error::{ClassifiedError, ConnectorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of media attachments per tweet.
pub const MAX_MEDIA_PER_TWEET: usize = 4;

/// Largest page size a request may ask for.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Everything the connector can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PostTweet,
    ReplyTweet,
    DeleteTweet,
    GetTweet,
    GetTimeline,
    GetUserTweets,
    SearchRecent,
    SearchAll,
    GetMe,
    GetUser,
    Follow,
    Unfollow,
    GetFollowers,
    GetFollowing,
    Like,
    Unlike,
    Retweet,
    Unretweet,
    GetBookmarks,
}

impl ActionKind {
    pub const ALL: [ActionKind; 19] = [
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
        ActionKind::GetBookmarks,
    ];

    /// Whether the action changes state upstream.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            ActionKind::PostTweet
                | ActionKind::ReplyTweet
                | ActionKind::DeleteTweet
                | ActionKind::Follow
                | ActionKind::Unfollow
                | ActionKind::Like
                | ActionKind::Unlike
                | ActionKind::Retweet
                | ActionKind::Unretweet
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::PostTweet => "post_tweet",
            ActionKind::ReplyTweet => "reply_tweet",
            ActionKind::DeleteTweet => "delete_tweet",
            ActionKind::GetTweet => "get_tweet",
            ActionKind::GetTimeline => "get_timeline",
            ActionKind::GetUserTweets => "get_user_tweets",
            ActionKind::SearchRecent => "search_recent",
            ActionKind::SearchAll => "search_all",
            ActionKind::GetMe => "get_me",
            ActionKind::GetUser => "get_user",
            ActionKind::Follow => "follow",
            ActionKind::Unfollow => "unfollow",
            ActionKind::GetFollowers => "get_followers",
            ActionKind::GetFollowing => "get_following",
            ActionKind::Like => "like",
            ActionKind::Unlike => "unlike",
            ActionKind::Retweet => "retweet",
            ActionKind::Unretweet => "unretweet",
            ActionKind::GetBookmarks => "get_bookmarks",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user addressed either by numeric id or by handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRef {
    Id(String),
    Handle(String),
}

impl UserRef {
    /// Build a handle reference, dropping a leading `@`.
    pub fn handle(handle: impl AsRef<str>) -> Self {
        UserRef::Handle(handle.as_ref().trim().trim_start_matches('@').to_string())
    }

    pub fn id(id: impl Into<String>) -> Self {
        UserRef::Id(id.into())
    }

    fn validate(&self) -> ConnectorResult<()> {
        match self {
            UserRef::Id(id) if !is_numeric_id(id) => Err(ClassifiedError::validation(format!(
                "user id must be numeric, got {:?}",
                id
            ))),
            UserRef::Handle(handle) => {
                let handle = handle.trim_start_matches('@');
                let valid = !handle.is_empty()
                    && handle.len() <= 15
                    && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if valid {
                    Ok(())
                } else {
                    Err(ClassifiedError::validation(format!(
                        "invalid handle {:?}",
                        handle
                    )))
                }
            }
            UserRef::Id(_) => Ok(()),
        }
    }
}

/// Media to attach to a tweet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaRef {
    /// Download from this URL and upload before posting
    Url(String),
    /// Already uploaded; attach as-is
    MediaId(String),
}

/// Action arguments. Which fields are required depends on the kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionPayload {
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    pub tweet_id: Option<String>,
    pub user: Option<UserRef>,
    pub query: Option<String>,
    pub max_results: Option<u32>,
    pub cursor: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// One host tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    #[serde(default)]
    pub payload: ActionPayload,
    /// Client-supplied id used to avoid duplicate mutations on retry
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ActionRequest {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            payload: ActionPayload::default(),
            idempotency_key: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.payload.text = Some(text.into());
        self
    }

    pub fn with_tweet_id(mut self, tweet_id: impl Into<String>) -> Self {
        self.payload.tweet_id = Some(tweet_id.into());
        self
    }

    pub fn with_user(mut self, user: UserRef) -> Self {
        self.payload.user = Some(user);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.payload.query = Some(query.into());
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.payload.max_results = Some(max_results);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.payload.cursor = Some(cursor.into());
        self
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.payload.media.push(media);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Check that the payload carries what the kind needs.
    ///
    /// Runs before backend selection, so a failure here never reaches an adapter.
    pub fn validate(&self) -> ConnectorResult<()> {
        let payload = &self.payload;

        match self.kind {
            ActionKind::PostTweet => {
                self.require_text()?;
            }
            ActionKind::ReplyTweet => {
                self.require_text()?;
                self.require_tweet_id()?;
            }
            ActionKind::DeleteTweet
            | ActionKind::GetTweet
            | ActionKind::Like
            | ActionKind::Unlike
            | ActionKind::Retweet
            | ActionKind::Unretweet => {
                self.require_tweet_id()?;
            }
            ActionKind::GetUser
            | ActionKind::GetUserTweets
            | ActionKind::Follow
            | ActionKind::Unfollow
            | ActionKind::GetFollowers
            | ActionKind::GetFollowing => {
                self.require_user()?;
            }
            ActionKind::SearchRecent | ActionKind::SearchAll => {
                let has_query = payload
                    .query
                    .as_deref()
                    .is_some_and(|q| !q.trim().is_empty());
                if !has_query {
                    return Err(self.missing("query"));
                }
            }
            ActionKind::GetTimeline | ActionKind::GetMe | ActionKind::GetBookmarks => {}
        }

        if !payload.media.is_empty()
            && !matches!(self.kind, ActionKind::PostTweet | ActionKind::ReplyTweet)
        {
            return Err(ClassifiedError::validation(format!(
                "{} does not accept media",
                self.kind
            )));
        }
        if payload.media.len() > MAX_MEDIA_PER_TWEET {
            return Err(ClassifiedError::validation(format!(
                "at most {} media attachments are allowed, got {}",
                MAX_MEDIA_PER_TWEET,
                payload.media.len()
            )));
        }
        if let Some(max) = payload.max_results {
            if max == 0 || max > MAX_PAGE_SIZE {
                return Err(ClassifiedError::validation(format!(
                    "max_results must be between 1 and {}, got {}",
                    MAX_PAGE_SIZE, max
                )));
            }
        }
        if let (Some(start), Some(end)) = (payload.start_time, payload.end_time) {
            if start >= end {
                return Err(ClassifiedError::validation(
                    "start_time must be before end_time",
                ));
            }
        }

        Ok(())
    }

    /// Requested page size, or `default` when the host left it open.
    pub fn page_size(&self, default: u32) -> u32 {
        self.payload.max_results.unwrap_or(default)
    }

    fn require_text(&self) -> ConnectorResult<()> {
        match self.payload.text.as_deref() {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err(self.missing("text")),
        }
    }

    fn require_tweet_id(&self) -> ConnectorResult<()> {
        match self.payload.tweet_id.as_deref() {
            Some(id) if is_numeric_id(id) => Ok(()),
            Some(id) => Err(ClassifiedError::validation(format!(
                "tweet_id must be numeric, got {:?}",
                id
            ))),
            None => Err(self.missing("tweet_id")),
        }
    }

    fn require_user(&self) -> ConnectorResult<()> {
        match &self.payload.user {
            Some(user) => user.validate(),
            None => Err(self.missing("user")),
        }
    }

    fn missing(&self, field: &str) -> ClassifiedError {
        ClassifiedError::validation(format!("{} requires `{}`", self.kind, field))
    }
}

fn is_numeric_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}
