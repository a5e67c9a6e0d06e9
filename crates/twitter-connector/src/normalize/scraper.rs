//! Parsers for web client GraphQL and v1.1 payloads.

use super::{ResultShape, ShapeError, ShapeResult};
use crate::action::ActionKind;
use crate::backend::RawResponse;
use crate::model::{
    Acknowledgement, ActionResult, Author, Tweet, TweetMetrics, TweetPage, User, UserMetrics,
    UserPage,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Timestamp format of `legacy.created_at`, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const LEGACY_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

pub(super) fn parse(shape: ResultShape, raw: &RawResponse) -> ShapeResult<ActionResult> {
    let body = &raw.body;
    if !body.is_object() {
        return Err(ShapeError::malformed("payload is not an object"));
    }

    match shape {
        ResultShape::Tweet => {
            let path = match raw.kind {
                ActionKind::GetTweet => "/data/tweetResult",
                _ => "/data/create_tweet/tweet_results",
            };
            let container = body
                .pointer(path)
                .ok_or_else(|| ShapeError::malformed(format!("missing `{}`", path)))?;
            let result = container
                .get("result")
                .ok_or_else(|| ShapeError::missing("tweet not found"))?;
            tweet_result(result)?
                .map(ActionResult::Tweet)
                .ok_or_else(|| ShapeError::missing("tweet is unavailable"))
        }
        ResultShape::TweetPage => {
            let (items, next_cursor) = timeline(instructions(raw)?)?;
            let mut tweets = Vec::with_capacity(items.len());
            for item in items {
                if let Some(result) = item.pointer("/tweet_results/result") {
                    if let Some(tweet) = tweet_result(result)? {
                        tweets.push(tweet);
                    }
                }
            }
            Ok(ActionResult::TweetPage(TweetPage {
                tweets,
                next_cursor,
            }))
        }
        ResultShape::User => {
            let container = body
                .pointer("/data/user")
                .ok_or_else(|| ShapeError::malformed("missing `/data/user`"))?;
            let result = container
                .get("result")
                .ok_or_else(|| ShapeError::missing("user not found"))?;
            user_result(result)?
                .map(ActionResult::User)
                .ok_or_else(|| ShapeError::missing("user is unavailable"))
        }
        ResultShape::UserPage => {
            let (items, next_cursor) = timeline(instructions(raw)?)?;
            let mut users = Vec::with_capacity(items.len());
            for item in items {
                if let Some(result) = item.pointer("/user_results/result") {
                    if let Some(user) = user_result(result)? {
                        users.push(user);
                    }
                }
            }
            Ok(ActionResult::UserPage(UserPage { users, next_cursor }))
        }
        ResultShape::Acknowledgement => acknowledgement(raw).map(ActionResult::Acknowledgement),
    }
}

fn acknowledgement(raw: &RawResponse) -> ShapeResult<Acknowledgement> {
    let body = &raw.body;

    let (confirmed, active, target_id) = match raw.kind {
        ActionKind::Like => (
            body.pointer("/data/favorite_tweet").and_then(Value::as_str) == Some("Done"),
            true,
            raw.target_id.clone(),
        ),
        ActionKind::Unlike => (
            body.pointer("/data/unfavorite_tweet").and_then(Value::as_str) == Some("Done"),
            false,
            raw.target_id.clone(),
        ),
        ActionKind::Retweet => (
            body.pointer("/data/create_retweet/retweet_results/result/rest_id")
                .is_some_and(Value::is_string),
            true,
            raw.target_id.clone(),
        ),
        ActionKind::Follow | ActionKind::Unfollow => {
            // friendships/create and destroy answer with the target user object.
            let id = legacy_id(body);
            (
                id.is_some(),
                raw.kind == ActionKind::Follow,
                raw.target_id.clone().or(id),
            )
        }
        other => {
            return Err(ShapeError::malformed(format!(
                "{} is not served by the web session",
                other
            )))
        }
    };

    if !confirmed {
        return Err(ShapeError::malformed(format!(
            "{} was not confirmed",
            raw.kind
        )));
    }

    let target_id = target_id.ok_or_else(|| ShapeError::malformed("unknown target id"))?;
    Ok(Acknowledgement {
        action: raw.kind,
        target_id,
        active,
    })
}

fn legacy_id(body: &Value) -> Option<String> {
    body.get("id_str")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| body.get("id").and_then(Value::as_u64).map(|id| id.to_string()))
}

/// Instruction list of the timeline a page-shaped kind reads.
fn instructions(raw: &RawResponse) -> ShapeResult<&[Value]> {
    let candidates: &[&str] = match raw.kind {
        ActionKind::GetTimeline => &["/data/home/home_timeline_urt/instructions"],
        ActionKind::GetUserTweets => &[
            "/data/user/result/timeline_v2/timeline/instructions",
            "/data/user/result/timeline/timeline/instructions",
        ],
        ActionKind::SearchRecent | ActionKind::SearchAll => {
            &["/data/search_by_raw_query/search_timeline/timeline/instructions"]
        }
        ActionKind::GetBookmarks => &["/data/bookmark_timeline_v2/timeline/instructions"],
        ActionKind::GetFollowers | ActionKind::GetFollowing => {
            &["/data/user/result/timeline/timeline/instructions"]
        }
        other => {
            return Err(ShapeError::malformed(format!(
                "{} has no timeline",
                other
            )))
        }
    };

    candidates
        .iter()
        .find_map(|path| raw.body.pointer(path).and_then(Value::as_array))
        .map(Vec::as_slice)
        .ok_or_else(|| ShapeError::malformed("missing timeline instructions"))
}

/// Item contents of a timeline in order, plus the cursor for the next page.
fn timeline(instructions: &[Value]) -> ShapeResult<(Vec<&Value>, Option<String>)> {
    let mut items = Vec::new();
    let mut next_cursor = None;

    for instruction in instructions {
        let entries: Vec<&Value> = match instruction.get("type").and_then(Value::as_str) {
            Some("TimelineAddEntries") => instruction
                .get("entries")
                .and_then(Value::as_array)
                .ok_or_else(|| ShapeError::malformed("TimelineAddEntries without entries"))?
                .iter()
                .collect(),
            Some("TimelineReplaceEntry") => instruction.get("entry").into_iter().collect(),
            _ => continue,
        };

        for entry in entries {
            let Some(content) = entry.get("content") else {
                continue;
            };
            let entry_type = content
                .get("entryType")
                .or_else(|| content.get("__typename"))
                .and_then(Value::as_str);

            match entry_type {
                Some("TimelineTimelineItem") => {
                    if let Some(item) = content.get("itemContent") {
                        items.push(item);
                    }
                }
                Some("TimelineTimelineModule") => {
                    if let Some(module_items) = content.get("items").and_then(Value::as_array) {
                        items.extend(module_items.iter().filter_map(|i| i.pointer("/item/itemContent")));
                    }
                }
                Some("TimelineTimelineCursor") => {
                    if content.get("cursorType").and_then(Value::as_str) == Some("Bottom") {
                        next_cursor = content
                            .get("value")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                }
                _ => {}
            }
        }
    }

    Ok((items, next_cursor))
}

/// A tweet from a `tweet_results.result` node. `None` for tombstones.
fn tweet_result(result: &Value) -> ShapeResult<Option<Tweet>> {
    let result = match typename(result) {
        Some("TweetWithVisibilityResults") => result
            .get("tweet")
            .ok_or_else(|| ShapeError::malformed("visibility wrapper without tweet"))?,
        Some("TweetTombstone") | Some("TweetUnavailable") => return Ok(None),
        _ => result,
    };

    let Some(id) = result.get("rest_id").and_then(Value::as_str) else {
        // An empty result object is what a deleted tweet looks like.
        if result.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(None);
        }
        return Err(ShapeError::malformed("tweet without `rest_id`"));
    };
    let legacy = result
        .get("legacy")
        .ok_or_else(|| ShapeError::malformed("tweet without `legacy`"))?;

    let text = result
        .pointer("/note_tweet/note_tweet_results/result/text")
        .or_else(|| legacy.get("full_text"))
        .and_then(Value::as_str)
        .ok_or_else(|| ShapeError::malformed("tweet without text"))?;

    let mut tweet = Tweet::new(id, text);
    tweet.created_at = legacy_time(legacy);
    tweet.conversation_id = str_field(legacy, "conversation_id_str");
    tweet.in_reply_to_id = str_field(legacy, "in_reply_to_status_id_str");

    if let Some(author) = result.pointer("/core/user_results/result") {
        let author_legacy = author.get("legacy");
        tweet.author = Some(Author {
            id: str_field(author, "rest_id"),
            username: author
                .pointer("/core/screen_name")
                .or_else(|| author_legacy.and_then(|l| l.get("screen_name")))
                .and_then(Value::as_str)
                .map(str::to_string),
            name: author
                .pointer("/core/name")
                .or_else(|| author_legacy.and_then(|l| l.get("name")))
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }

    if legacy.get("favorite_count").is_some() {
        tweet.metrics = Some(TweetMetrics {
            likes: count(legacy, "favorite_count"),
            retweets: count(legacy, "retweet_count"),
            replies: count(legacy, "reply_count"),
            quotes: count(legacy, "quote_count"),
            impressions: result
                .pointer("/views/count")
                .and_then(Value::as_str)
                .and_then(|c| c.parse().ok()),
        });
    }

    Ok(Some(tweet))
}

/// A user from a `user_results.result` node. `None` for unavailable accounts.
fn user_result(result: &Value) -> ShapeResult<Option<User>> {
    if typename(result) == Some("UserUnavailable") {
        return Ok(None);
    }

    let Some(id) = result.get("rest_id").and_then(Value::as_str) else {
        if result.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(None);
        }
        return Err(ShapeError::malformed("user without `rest_id`"));
    };
    let legacy = result
        .get("legacy")
        .ok_or_else(|| ShapeError::malformed("user without `legacy`"))?;

    // Newer payloads moved names and creation time under `core`.
    let pick = |key: &str| -> Option<&Value> {
        result
            .get("core")
            .and_then(|c| c.get(key))
            .or_else(|| legacy.get(key))
    };
    let username = pick("screen_name")
        .and_then(Value::as_str)
        .ok_or_else(|| ShapeError::malformed("user without screen name"))?;
    let name = pick("name").and_then(Value::as_str).unwrap_or(username);

    let verified = legacy
        .get("verified")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || result
            .get("is_blue_verified")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    let protected = result
        .pointer("/privacy/protected")
        .or_else(|| legacy.get("protected"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(Some(User {
        id: id.to_string(),
        username: username.to_string(),
        name: name.to_string(),
        description: str_field(legacy, "description").filter(|d| !d.is_empty()),
        created_at: pick("created_at")
            .and_then(Value::as_str)
            .and_then(parse_legacy_time),
        verified,
        protected,
        metrics: legacy.get("followers_count").map(|_| UserMetrics {
            followers: count(legacy, "followers_count"),
            following: count(legacy, "friends_count"),
            tweets: count(legacy, "statuses_count"),
            listed: count(legacy, "listed_count"),
        }),
    }))
}

fn typename(value: &Value) -> Option<&str> {
    value.get("__typename").and_then(Value::as_str)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn count(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn legacy_time(legacy: &Value) -> Option<DateTime<Utc>> {
    legacy
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(parse_legacy_time)
}

fn parse_legacy_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, LEGACY_TIME_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
