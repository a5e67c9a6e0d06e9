//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use shared::config::{ConnectorConfig, RetryConfig};
use shared::{BackendMode, Config};
use twitter_connector::credentials::{ApiCredentials, ScraperCredentials};

/// Connector config pointing both backends at `base`, with fast retries and no pacing.
pub fn connector_config(base: &str, mode: BackendMode) -> ConnectorConfig {
    let mut config = Config::default().connector;
    config.mode = mode;
    config.api.base_url = base.to_string();
    config.api.upload_url = base.to_string();
    config.api.timeout_secs = 5;
    config.scraper.base_url = base.to_string();
    config.scraper.timeout_secs = 5;
    config.scraper.rate_limit.requests_per_second = 1000.0;
    config.scraper.rate_limit.requests_per_minute = 1000;
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        jitter: 0.0,
    };
    config
}

pub fn api_credentials() -> ApiCredentials {
    ApiCredentials {
        consumer_key: "consumer-key".to_string(),
        consumer_secret: "consumer-secret".to_string(),
        access_token: "1-access-token".to_string(),
        access_token_secret: "access-token-secret".to_string(),
    }
}

/// A session whose csrf token has already expired.
pub fn expired_session() -> ScraperCredentials {
    let mut session = ScraperCredentials::new("auth-token");
    session.csrf_token = Some("stale".to_string());
    session.expiry = Some(Utc::now() - ChronoDuration::minutes(5));
    session
}

/// A session good for the next hour.
pub fn fresh_session() -> ScraperCredentials {
    let mut session = ScraperCredentials::new("auth-token");
    session.csrf_token = Some("current".to_string());
    session.expiry = Some(Utc::now() + ChronoDuration::hours(1));
    session
}

/// Minimal web timeline payload with one tweet per id.
pub fn timeline_body(root: &str, ids: &[&str]) -> Value {
    let entries: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "entryId": format!("tweet-{}", id),
                "content": {
                    "entryType": "TimelineTimelineItem",
                    "itemContent": { "tweet_results": { "result": {
                        "__typename": "Tweet",
                        "rest_id": id,
                        "legacy": { "full_text": format!("tweet {}", id) }
                    } } }
                }
            })
        })
        .collect();

    let instructions = json!({ "instructions": [
        { "type": "TimelineAddEntries", "entries": entries }
    ] });

    match root {
        "bookmarks" => json!({ "data": { "bookmark_timeline_v2": { "timeline": instructions } } }),
        _ => json!({ "data": { "home": { "home_timeline_urt": instructions } } }),
    }
}
