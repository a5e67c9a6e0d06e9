//! Official REST API adapter.

use super::oauth::OAuthSigner;
use crate::action::{ActionKind, ActionRequest, UserRef};
use crate::backend::{
    clamp_page_size, endpoint_key, retry_after_from_headers, transport_error, BackendAdapter,
    BackendKind, BackendState, RawResponse,
};
use crate::credentials::{CredentialKind, CredentialStore};
use crate::error::{ClassifiedError, ConnectorResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use shared::config::ApiConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

/// Actions reachable through OAuth 1.0a user context.
const API_CAPABILITIES: &[ActionKind] = &[
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

const TWEET_FIELDS: &str =
    "id,text,author_id,created_at,conversation_id,in_reply_to_user_id,referenced_tweets,public_metrics";
const USER_FIELDS: &str =
    "id,name,username,description,created_at,verified,protected,public_metrics";

/// Request body variants the API adapter sends.
pub(super) enum Body {
    Empty,
    Json(Value),
    /// Form parameters are part of the OAuth signature
    Form(Vec<(String, String)>),
    Multipart(reqwest::multipart::Form),
}

/// Adapter for the official Twitter API v2.
pub struct ApiAdapter {
    pub(super) client: Client,
    base_url: String,
    pub(super) upload_url: String,
    pub(super) media_chunk_bytes: usize,
    credentials: Arc<CredentialStore>,
    state: BackendState,
    /// Authenticated user's id, looked up once
    me: OnceCell<String>,
}

impl ApiAdapter {
    /// Create a new API adapter
    pub fn new(config: &ApiConfig, credentials: Arc<CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("twitter-connector/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            upload_url: config.upload_url.trim_end_matches('/').to_string(),
            media_chunk_bytes: config.media_chunk_bytes.max(1),
            credentials,
            state: BackendState::new(),
            me: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send one signed request and classify the response.
    ///
    /// Refuses to send while the endpoint's last rate-limit window is exhausted.
    pub(super) async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Body,
        mutating: bool,
    ) -> ConnectorResult<Value> {
        let endpoint = endpoint_key(url);
        if let Some(wait) = self.state.preemptive_backoff(&endpoint, Utc::now()) {
            debug!(
                url = %url,
                endpoint = %endpoint,
                wait_ms = wait.as_millis(),
                "Rate limit window exhausted, not sending"
            );
            return Err(ClassifiedError::rate_limited(
                wait,
                "rate limit window exhausted; request not sent",
            )
            .with_backend(BackendKind::Api));
        }

        let credentials = self
            .credentials
            .api()
            .map_err(|e| e.with_backend(BackendKind::Api))?;

        let mut signed_params = query.to_vec();
        if let Body::Form(form) = &body {
            signed_params.extend(form.iter().cloned());
        }
        let authorization = OAuthSigner::new(&credentials)
            .sign(method.as_str(), url, &signed_params)
            .map_err(|e| e.with_backend(BackendKind::Api))?;

        debug!(method = %method, url = %url, "Making API request");

        let mut request = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, authorization);
        if !query.is_empty() {
            request = request.query(query);
        }
        request = match body {
            Body::Empty => request,
            Body::Json(value) => request.json(&value),
            Body::Form(form) => request.form(&form),
            Body::Multipart(form) => request.multipart(form),
        };

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(BackendKind::Api, &e, mutating))?;

        let status = response.status();
        let headers = response.headers().clone();
        self.state.observe_headers(&endpoint, &headers);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(BackendKind::Api, &e, mutating))?;

        classify_response(status, &headers, &bytes).map_err(|e| {
            warn!(url = %url, status = %status, error = %e, "API request failed");
            e.with_backend(BackendKind::Api)
        })
    }

    async fn get(&self, path: &str, query: &[(String, String)]) -> ConnectorResult<Value> {
        self.send(Method::GET, &self.url(path), query, Body::Empty, false)
            .await
    }

    async fn post_json(&self, path: &str, body: Value) -> ConnectorResult<Value> {
        self.send(Method::POST, &self.url(path), &[], Body::Json(body), true)
            .await
    }

    async fn delete(&self, path: &str) -> ConnectorResult<Value> {
        self.send(Method::DELETE, &self.url(path), &[], Body::Empty, true)
            .await
    }

    /// Id of the user the access token belongs to.
    async fn me(&self) -> ConnectorResult<String> {
        let id = self
            .me
            .get_or_try_init(|| async {
                let body = self.get("/2/users/me", &[]).await?;
                body.pointer("/data/id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ClassifiedError::permanent("users/me response has no data.id")
                            .with_backend(BackendKind::Api)
                    })
            })
            .await?;
        Ok(id.clone())
    }

    /// Resolve a handle to a user id; ids pass through.
    async fn resolve_user(&self, user: &UserRef) -> ConnectorResult<String> {
        match user {
            UserRef::Id(id) => Ok(id.clone()),
            UserRef::Handle(handle) => {
                let body = self
                    .get(&format!("/2/users/by/username/{}", handle), &[])
                    .await?;
                body.pointer("/data/id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ClassifiedError::not_found(format!("no user with handle @{}", handle))
                            .with_backend(BackendKind::Api)
                    })
            }
        }
    }

    async fn tweet_list(
        &self,
        path: &str,
        request: &ActionRequest,
        min: u32,
        cursor_param: &str,
    ) -> ConnectorResult<Value> {
        let payload = &request.payload;
        let mut query = tweet_query();
        query.push((
            "max_results".to_string(),
            clamp_page_size(request, 10, min).to_string(),
        ));
        if let Some(q) = &payload.query {
            query.push(("query".to_string(), q.clone()));
        }
        if let Some(cursor) = &payload.cursor {
            query.push((cursor_param.to_string(), cursor.clone()));
        }
        if let Some(start) = payload.start_time {
            query.push((
                "start_time".to_string(),
                start.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        if let Some(end) = payload.end_time {
            query.push((
                "end_time".to_string(),
                end.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        self.get(path, &query).await
    }

    async fn user_list(&self, path: &str, request: &ActionRequest) -> ConnectorResult<Value> {
        let mut query = vec![
            ("user.fields".to_string(), USER_FIELDS.to_string()),
            (
                "max_results".to_string(),
                clamp_page_size(request, 10, 1).to_string(),
            ),
        ];
        if let Some(cursor) = &request.payload.cursor {
            query.push(("pagination_token".to_string(), cursor.clone()));
        }
        self.get(path, &query).await
    }
}

#[async_trait]
impl BackendAdapter for ApiAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    fn capabilities(&self) -> &'static [ActionKind] {
        API_CAPABILITIES
    }

    fn is_ready(&self) -> bool {
        self.credentials.has(CredentialKind::Api)
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    #[instrument(skip(self, request), fields(backend = "api", kind = %request.kind))]
    async fn execute(&self, request: &ActionRequest) -> ConnectorResult<RawResponse> {
        let kind = request.kind;
        let payload = &request.payload;
        let mut target_id = None;

        let body = match kind {
            ActionKind::PostTweet | ActionKind::ReplyTweet => {
                let text = required(payload.text.as_deref(), kind, "text")?;
                let media_ids = self.upload_media(&payload.media).await?;

                let mut body = json!({ "text": text });
                if !media_ids.is_empty() {
                    body["media"] = json!({ "media_ids": media_ids });
                }
                if kind == ActionKind::ReplyTweet {
                    let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                    body["reply"] = json!({ "in_reply_to_tweet_id": tweet_id });
                }
                self.post_json("/2/tweets", body).await?
            }
            ActionKind::DeleteTweet => {
                let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                target_id = Some(tweet_id.to_string());
                self.delete(&format!("/2/tweets/{}", tweet_id)).await?
            }
            ActionKind::GetTweet => {
                let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                self.get(&format!("/2/tweets/{}", tweet_id), &tweet_query())
                    .await?
            }
            ActionKind::GetTimeline => {
                let me = self.me().await?;
                self.tweet_list(
                    &format!("/2/users/{}/timelines/reverse_chronological", me),
                    request,
                    1,
                    "pagination_token",
                )
                .await?
            }
            ActionKind::GetUserTweets => {
                let user_id = self.resolve_user(required_user(request)?).await?;
                self.tweet_list(
                    &format!("/2/users/{}/tweets", user_id),
                    request,
                    5,
                    "pagination_token",
                )
                .await?
            }
            ActionKind::SearchRecent => {
                self.tweet_list("/2/tweets/search/recent", request, 10, "next_token")
                    .await?
            }
            ActionKind::SearchAll => {
                self.tweet_list("/2/tweets/search/all", request, 10, "next_token")
                    .await?
            }
            ActionKind::GetMe => self.get("/2/users/me", &user_query()).await?,
            ActionKind::GetUser => match required_user(request)? {
                UserRef::Id(id) => self.get(&format!("/2/users/{}", id), &user_query()).await?,
                UserRef::Handle(handle) => {
                    self.get(&format!("/2/users/by/username/{}", handle), &user_query())
                        .await?
                }
            },
            ActionKind::Follow => {
                let me = self.me().await?;
                let user_id = self.resolve_user(required_user(request)?).await?;
                target_id = Some(user_id.clone());
                self.post_json(
                    &format!("/2/users/{}/following", me),
                    json!({ "target_user_id": user_id }),
                )
                .await?
            }
            ActionKind::Unfollow => {
                let me = self.me().await?;
                let user_id = self.resolve_user(required_user(request)?).await?;
                target_id = Some(user_id.clone());
                self.delete(&format!("/2/users/{}/following/{}", me, user_id))
                    .await?
            }
            ActionKind::GetFollowers | ActionKind::GetFollowing => {
                let user_id = self.resolve_user(required_user(request)?).await?;
                let edge = if kind == ActionKind::GetFollowers {
                    "followers"
                } else {
                    "following"
                };
                self.user_list(&format!("/2/users/{}/{}", user_id, edge), request)
                    .await?
            }
            ActionKind::Like | ActionKind::Retweet => {
                let me = self.me().await?;
                let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                target_id = Some(tweet_id.to_string());
                let edge = if kind == ActionKind::Like { "likes" } else { "retweets" };
                self.post_json(
                    &format!("/2/users/{}/{}", me, edge),
                    json!({ "tweet_id": tweet_id }),
                )
                .await?
            }
            ActionKind::Unlike | ActionKind::Unretweet => {
                let me = self.me().await?;
                let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                target_id = Some(tweet_id.to_string());
                let edge = if kind == ActionKind::Unlike { "likes" } else { "retweets" };
                self.delete(&format!("/2/users/{}/{}/{}", me, edge, tweet_id))
                    .await?
            }
            ActionKind::GetBookmarks => {
                return Err(ClassifiedError::not_configured(
                    "bookmarks are not available with OAuth 1.0a credentials",
                )
                .with_backend(BackendKind::Api))
            }
        };

        Ok(RawResponse {
            backend: BackendKind::Api,
            kind,
            target_id,
            body,
        })
    }
}

fn tweet_query() -> Vec<(String, String)> {
    vec![
        ("tweet.fields".to_string(), TWEET_FIELDS.to_string()),
        ("expansions".to_string(), "author_id".to_string()),
        ("user.fields".to_string(), "id,name,username".to_string()),
    ]
}

fn user_query() -> Vec<(String, String)> {
    vec![("user.fields".to_string(), USER_FIELDS.to_string())]
}

fn required<'r>(value: Option<&'r str>, kind: ActionKind, field: &str) -> ConnectorResult<&'r str> {
    value.ok_or_else(|| ClassifiedError::validation(format!("{} requires `{}`", kind, field)))
}

fn required_user(request: &ActionRequest) -> ConnectorResult<&UserRef> {
    request.payload.user.as_ref().ok_or_else(|| {
        ClassifiedError::validation(format!("{} requires `user`", request.kind))
    })
}

/// Map an official API response to a payload or a classified error.
pub(crate) fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    bytes: &[u8],
) -> ConnectorResult<Value> {
    let parsed: Option<Value> = serde_json::from_slice(bytes).ok();

    if status.is_success() {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        let value = parsed.ok_or_else(|| {
            ClassifiedError::permanent(format!("unparseable {} response body", status))
        })?;

        // Lookups of deleted or missing entities come back as 200 with only `errors`.
        if value.get("data").is_none() {
            if let Some(problem) = value
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
            {
                let message = problem_message(Some(problem), bytes);
                return Err(if is_not_found_problem(problem) {
                    ClassifiedError::not_found(message)
                } else {
                    ClassifiedError::permanent(message)
                });
            }
        }
        return Ok(value);
    }

    let message = problem_message(parsed.as_ref(), bytes);
    let lower = message.to_lowercase();

    let error = match status {
        StatusCode::UNAUTHORIZED => ClassifiedError::auth(message),
        StatusCode::FORBIDDEN if lower.contains("suspended") => ClassifiedError::permanent(message),
        StatusCode::FORBIDDEN if lower.contains("duplicate") => ClassifiedError::validation(message),
        StatusCode::FORBIDDEN => ClassifiedError::auth(message),
        StatusCode::NOT_FOUND => ClassifiedError::not_found(message),
        StatusCode::TOO_MANY_REQUESTS => {
            ClassifiedError::rate_limited(retry_after_from_headers(headers), message)
        }
        s if s.is_client_error() => {
            if parsed.as_ref().is_some_and(is_not_found_problem) {
                ClassifiedError::not_found(message)
            } else {
                ClassifiedError::validation(message)
            }
        }
        _ => ClassifiedError::transient(message),
    };
    Err(error)
}

fn is_not_found_problem(problem: &Value) -> bool {
    problem
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.ends_with("resource-not-found"))
        || problem
            .get("errors")
            .and_then(Value::as_array)
            .is_some_and(|errors| errors.iter().any(is_not_found_problem))
}

/// Best human-readable message from a v2 problem or a v1.1 error list.
fn problem_message(problem: Option<&Value>, bytes: &[u8]) -> String {
    let from_json = problem.and_then(|p| {
        p.get("detail")
            .or_else(|| p.get("title"))
            .or_else(|| p.pointer("/errors/0/detail"))
            .or_else(|| p.pointer("/errors/0/message"))
            .or_else(|| p.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    from_json.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim();
        if text.is_empty() {
            "no response body".to_string()
        } else {
            text.chars().take(200).collect()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn classify(status: u16, body: Value) -> ConnectorResult<Value> {
        classify_response(
            StatusCode::from_u16(status).unwrap(),
            &HeaderMap::new(),
            body.to_string().as_bytes(),
        )
    }

    #[test]
    fn test_success_passes_through() {
        let value = classify(201, json!({ "data": { "id": "1", "text": "hi" } })).unwrap();
        assert_eq!(value["data"]["id"], "1");

        let empty_page = classify(200, json!({ "meta": { "result_count": 0 } })).unwrap();
        assert_eq!(empty_page["meta"]["result_count"], 0);

        assert_eq!(
            classify_response(StatusCode::NO_CONTENT, &HeaderMap::new(), b"").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (401, json!({ "title": "Unauthorized" }), ErrorKind::Auth),
            (403, json!({ "detail": "You are not permitted" }), ErrorKind::Auth),
            (
                403,
                json!({ "detail": "Your account is suspended" }),
                ErrorKind::Permanent,
            ),
            (
                403,
                json!({ "detail": "You are not allowed to create a Tweet with duplicate content." }),
                ErrorKind::Validation,
            ),
            (404, json!({ "title": "Not Found Error" }), ErrorKind::NotFound),
            (400, json!({ "title": "Invalid Request" }), ErrorKind::Validation),
            (
                400,
                json!({ "errors": [{ "type": "https://api.twitter.com/2/problems/resource-not-found" }], "title": "x" }),
                ErrorKind::NotFound,
            ),
            (503, json!({ "title": "Service Unavailable" }), ErrorKind::Transient),
        ];

        for (status, body, expected) in cases {
            let err = classify(status, body).unwrap_err();
            assert_eq!(err.kind, expected, "status {}", status);
        }
    }

    #[test]
    fn test_rate_limited_uses_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "2".parse().unwrap());
        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, &headers, b"{}").unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::RateLimited {
                retry_after: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn test_ok_with_only_errors_is_not_found() {
        let err = classify(
            200,
            json!({ "errors": [{
                "detail": "Could not find tweet with id: [1].",
                "type": "https://api.twitter.com/2/problems/resource-not-found"
            }] }),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("Could not find tweet"));
    }

    #[test]
    fn test_problem_message_fallbacks() {
        assert_eq!(
            problem_message(Some(&json!({ "errors": [{ "message": "Bad" }] })), b""),
            "Bad"
        );
        assert_eq!(problem_message(None, b"  gateway timeout "), "gateway timeout");
        assert_eq!(problem_message(None, b""), "no response body");
    }
}
