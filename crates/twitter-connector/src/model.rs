//! Canonical results handed back to the host.
//!
//! These shapes are the same no matter which backend produced them.

use crate::action::ActionKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Successful outcome of a dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionResult {
    Tweet(Tweet),
    TweetPage(TweetPage),
    User(User),
    UserPage(UserPage),
    Acknowledgement(Acknowledgement),
}

impl ActionResult {
    pub fn as_tweet(&self) -> Option<&Tweet> {
        match self {
            ActionResult::Tweet(tweet) => Some(tweet),
            _ => None,
        }
    }

    pub fn as_tweet_page(&self) -> Option<&TweetPage> {
        match self {
            ActionResult::TweetPage(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            ActionResult::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_user_page(&self) -> Option<&UserPage> {
        match self {
            ActionResult::UserPage(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_acknowledgement(&self) -> Option<&Acknowledgement> {
        match self {
            ActionResult::Acknowledgement(ack) => Some(ack),
            _ => None,
        }
    }

    /// Drop page items beyond `limit`; other results are returned unchanged.
    ///
    /// Endpoints with a minimum page size can return more than was asked for.
    pub fn truncated(self, limit: Option<u32>) -> Self {
        let Some(limit) = limit.map(|l| l as usize) else {
            return self;
        };
        match self {
            ActionResult::TweetPage(mut page) => {
                page.tweets.truncate(limit);
                ActionResult::TweetPage(page)
            }
            ActionResult::UserPage(mut page) => {
                page.users.truncate(limit);
                ActionResult::UserPage(page)
            }
            other => other,
        }
    }
}

/// A single tweet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TweetMetrics>,
}

impl Tweet {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            author: None,
            created_at: None,
            conversation_id: None,
            in_reply_to_id: None,
            metrics: None,
        }
    }
}

/// Who wrote a tweet. Either backend may only know part of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: Option<String>,
    pub username: Option<String>,
    pub name: Option<String>,
}

/// Engagement counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetMetrics {
    pub likes: u64,
    pub retweets: u64,
    pub replies: u64,
    pub quotes: u64,
    pub impressions: Option<u64>,
}

/// A user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<UserMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetrics {
    pub followers: u64,
    pub following: u64,
    pub tweets: u64,
    pub listed: u64,
}

/// One page of tweets plus the cursor for the next page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TweetPage {
    pub tweets: Vec<Tweet>,
    pub next_cursor: Option<String>,
}

/// One page of users plus the cursor for the next page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPage {
    pub users: Vec<User>,
    pub next_cursor: Option<String>,
}

/// Outcome of a state-changing action that returns no entity.
///
/// `active` is the state after the action: liked, retweeted, following, or
/// deleted, depending on `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub action: ActionKind,
    pub target_id: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_is_tagged() {
        let result = ActionResult::Tweet(Tweet::new("123", "hello"));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "tweet");
        assert_eq!(value["id"], "123");
        assert!(value.get("author").is_none());

        let ack = ActionResult::Acknowledgement(Acknowledgement {
            action: ActionKind::Follow,
            target_id: "42".into(),
            active: true,
        });
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["type"], "acknowledgement");
        assert_eq!(value["action"], "follow");
    }

    #[test]
    fn test_truncated_pages() {
        let page = ActionResult::TweetPage(TweetPage {
            tweets: (0..5).map(|i| Tweet::new(&i.to_string(), "t")).collect(),
            next_cursor: Some("c".into()),
        });

        let short = page.clone().truncated(Some(2));
        let tweets = &short.as_tweet_page().unwrap().tweets;
        assert_eq!(tweets.len(), 2);
        assert_eq!(tweets[1].id, "1");
        assert_eq!(short.as_tweet_page().unwrap().next_cursor.as_deref(), Some("c"));

        assert_eq!(page.clone().truncated(None), page);
        assert_eq!(page.clone().truncated(Some(50)), page);

        let tweet = ActionResult::Tweet(Tweet::new("1", "t"));
        assert_eq!(tweet.clone().truncated(Some(0)), tweet);
    }
}
