//! Parsers for official API v2 payloads.

use super::{ResultShape, ShapeError, ShapeResult};
use crate::action::ActionKind;
use crate::backend::RawResponse;
use crate::model::{
    Acknowledgement, ActionResult, Author, Tweet, TweetMetrics, TweetPage, User, UserMetrics,
    UserPage,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

pub(super) fn parse(shape: ResultShape, raw: &RawResponse) -> ShapeResult<ActionResult> {
    let body = &raw.body;
    if !body.is_object() {
        return Err(ShapeError::malformed("payload is not an object"));
    }

    match shape {
        ResultShape::Tweet => {
            let data = body
                .get("data")
                .ok_or_else(|| ShapeError::malformed("missing `data`"))?;
            Ok(ActionResult::Tweet(tweet(data, included_users(body))?))
        }
        ResultShape::TweetPage => {
            let users = included_users(body);
            let tweets = data_array(body)?
                .iter()
                .map(|t| tweet(t, users))
                .collect::<ShapeResult<Vec<_>>>()?;
            Ok(ActionResult::TweetPage(TweetPage {
                tweets,
                next_cursor: next_token(body),
            }))
        }
        ResultShape::User => {
            let data = body
                .get("data")
                .ok_or_else(|| ShapeError::malformed("missing `data`"))?;
            Ok(ActionResult::User(user(data)?))
        }
        ResultShape::UserPage => {
            let users = data_array(body)?
                .iter()
                .map(user)
                .collect::<ShapeResult<Vec<_>>>()?;
            Ok(ActionResult::UserPage(UserPage {
                users,
                next_cursor: next_token(body),
            }))
        }
        ResultShape::Acknowledgement => acknowledgement(raw).map(ActionResult::Acknowledgement),
    }
}

fn acknowledgement(raw: &RawResponse) -> ShapeResult<Acknowledgement> {
    let field = match raw.kind {
        ActionKind::DeleteTweet => "deleted",
        ActionKind::Follow | ActionKind::Unfollow => "following",
        ActionKind::Like | ActionKind::Unlike => "liked",
        ActionKind::Retweet | ActionKind::Unretweet => "retweeted",
        other => {
            return Err(ShapeError::malformed(format!(
                "{} has no acknowledgement",
                other
            )))
        }
    };

    let data = raw.body.get("data");
    let mut active = data
        .and_then(|d| d.get(field))
        .and_then(Value::as_bool)
        .ok_or_else(|| ShapeError::malformed(format!("missing `data.{}`", field)))?;

    // Following a protected account leaves a pending request.
    if raw.kind == ActionKind::Follow {
        active |= data
            .and_then(|d| d.get("pending_follow"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
    }

    let target_id = raw
        .target_id
        .clone()
        .ok_or_else(|| ShapeError::malformed("unknown target id"))?;

    Ok(Acknowledgement {
        action: raw.kind,
        target_id,
        active,
    })
}

fn data_array(body: &Value) -> ShapeResult<&[Value]> {
    match body.get("data") {
        None | Some(Value::Null) => Ok(Default::default()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(ShapeError::malformed("`data` is not a list")),
    }
}

fn included_users(body: &Value) -> &[Value] {
    body.pointer("/includes/users")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn next_token(body: &Value) -> Option<String> {
    body.pointer("/meta/next_token")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn required_str(value: &Value, key: &str, entity: &str) -> ShapeResult<String> {
    str_field(value, key).ok_or_else(|| ShapeError::malformed(format!("{} without `{}`", entity, key)))
}

fn timestamp(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn count(metrics: &Value, key: &str) -> u64 {
    metrics.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn tweet(data: &Value, users: &[Value]) -> ShapeResult<Tweet> {
    let mut tweet = Tweet::new(
        required_str(data, "id", "tweet")?,
        required_str(data, "text", "tweet")?,
    );

    tweet.created_at = timestamp(data, "created_at");
    tweet.conversation_id = str_field(data, "conversation_id");
    tweet.in_reply_to_id = data
        .get("referenced_tweets")
        .and_then(Value::as_array)
        .and_then(|refs| {
            refs.iter()
                .find(|r| r.get("type").and_then(Value::as_str) == Some("replied_to"))
        })
        .and_then(|r| str_field(r, "id"));

    if let Some(author_id) = str_field(data, "author_id") {
        let expanded = users
            .iter()
            .find(|u| u.get("id").and_then(Value::as_str) == Some(author_id.as_str()));
        tweet.author = Some(Author {
            username: expanded.and_then(|u| str_field(u, "username")),
            name: expanded.and_then(|u| str_field(u, "name")),
            id: Some(author_id),
        });
    }

    tweet.metrics = data.get("public_metrics").map(|m| TweetMetrics {
        likes: count(m, "like_count"),
        retweets: count(m, "retweet_count"),
        replies: count(m, "reply_count"),
        quotes: count(m, "quote_count"),
        impressions: m.get("impression_count").and_then(Value::as_u64),
    });

    Ok(tweet)
}

fn user(data: &Value) -> ShapeResult<User> {
    Ok(User {
        id: required_str(data, "id", "user")?,
        username: required_str(data, "username", "user")?,
        name: required_str(data, "name", "user")?,
        description: str_field(data, "description").filter(|d| !d.is_empty()),
        created_at: timestamp(data, "created_at"),
        verified: data.get("verified").and_then(Value::as_bool).unwrap_or(false),
        protected: data.get("protected").and_then(Value::as_bool).unwrap_or(false),
        metrics: data.get("public_metrics").map(|m| UserMetrics {
            followers: count(m, "followers_count"),
            following: count(m, "following_count"),
            tweets: count(m, "tweet_count"),
            listed: count(m, "listed_count"),
        }),
    })
}
