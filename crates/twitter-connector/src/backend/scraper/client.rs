//! Scraper adapter: GraphQL and v1.1 endpoints used by the web client.

use super::pacer::Pacer;
use super::session::SessionRefresher;
use crate::action::{ActionKind, ActionRequest, UserRef};
use crate::backend::{
    clamp_page_size, endpoint_key, retry_after_from_headers, transport_error, BackendAdapter,
    BackendKind, BackendState, RawResponse,
};
use crate::credentials::{CredentialKind, CredentialStore, ScraperCredentials};
use crate::error::{ClassifiedError, ConnectorResult, ErrorKind};
use crate::session_store::SessionStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE, LOCATION,
};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use shared::config::{QueryIds, ScraperConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const SCRAPER_CAPABILITIES: &[ActionKind] = &[
    ActionKind::PostTweet,
    ActionKind::ReplyTweet,
    ActionKind::GetTweet,
    ActionKind::GetTimeline,
    ActionKind::GetUserTweets,
    ActionKind::SearchRecent,
    ActionKind::GetUser,
    ActionKind::Follow,
    ActionKind::Unfollow,
    ActionKind::GetFollowers,
    ActionKind::GetFollowing,
    ActionKind::Like,
    ActionKind::Unlike,
    ActionKind::Retweet,
    ActionKind::GetBookmarks,
];

/// Error code the web endpoints use when the account must pass a challenge.
const CHALLENGE_CODE: i64 = 326;

const CHALLENGE_PATH: &str = "/account/access";

const CSRF_MISMATCH_CODE: i64 = 353;

/// Feature flags the GraphQL endpoints insist on.
fn features() -> Value {
    json!({
        "responsive_web_graphql_exclude_directive_enabled": true,
        "verified_phone_label_enabled": false,
        "creator_subscriptions_tweet_preview_api_enabled": true,
        "responsive_web_graphql_timeline_navigation_enabled": true,
        "responsive_web_graphql_skip_user_profile_image_extensions_enabled": false,
        "tweetypie_unmention_optimization_enabled": true,
        "responsive_web_edit_tweet_api_enabled": true,
        "graphql_is_translatable_rweb_tweet_is_translatable_enabled": true,
        "view_counts_everywhere_api_enabled": true,
        "longform_notetweets_consumption_enabled": true,
        "tweet_awards_web_tipping_enabled": false,
        "freedom_of_speech_not_reach_fetch_enabled": true,
        "standardized_nudges_misinfo": true,
        "longform_notetweets_rich_text_read_enabled": true,
        "longform_notetweets_inline_media_enabled": true,
        "responsive_web_enhance_cards_enabled": false
    })
}

/// Request body variants the web endpoints take.
enum Body {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Adapter driving the web client's endpoints with a logged-in session.
pub struct ScraperAdapter {
    client: Client,
    base_url: String,
    bearer_token: String,
    query_ids: QueryIds,
    pacer: Pacer,
    session: Arc<SessionRefresher>,
    credentials: Arc<CredentialStore>,
    state: BackendState,
}

impl ScraperAdapter {
    /// Create a new scraper adapter. Refreshed sessions go to `store` when given.
    pub fn new(
        config: &ScraperConfig,
        credentials: Arc<CredentialStore>,
        store: Option<SessionStore>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
            )
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        let session = Arc::new(SessionRefresher::new(
            client.clone(),
            &base_url,
            &config.web_bearer_token,
            Duration::from_secs(config.session_ttl_secs),
            Duration::from_secs(config.refresh_margin_secs),
            Arc::clone(&credentials),
            store,
        ));

        Ok(Self {
            client,
            base_url,
            bearer_token: config.web_bearer_token.clone(),
            query_ids: config.query_ids.clone(),
            pacer: Pacer::new(
                config.rate_limit.requests_per_second,
                config.rate_limit.requests_per_minute,
            ),
            session,
            credentials,
            state: BackendState::new(),
        })
    }

    /// Number of session refresh exchanges sent so far.
    pub fn refresh_count(&self) -> u64 {
        self.session.refresh_count()
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Body,
        mutating: bool,
    ) -> ConnectorResult<Value> {
        let endpoint = endpoint_key(path);
        if let Some(wait) = self.state.preemptive_backoff(&endpoint, Utc::now()) {
            debug!(
                path = %path,
                endpoint = %endpoint,
                wait_ms = wait.as_millis(),
                "Rate limit window exhausted, not sending"
            );
            return Err(ClassifiedError::rate_limited(
                wait,
                "rate limit window exhausted; request not sent",
            )
            .with_backend(BackendKind::Scraper));
        }

        let credentials = self.session.current().await?;
        self.pacer.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Making web request");

        let mut request = self
            .client
            .request(method, &url)
            .headers(web_headers(&self.bearer_token, &credentials));
        if !query.is_empty() {
            request = request.query(query);
        }
        request = match body {
            Body::Empty => request,
            Body::Json(value) => request.json(&value),
            Body::Form(form) => request.form(&form),
        };

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(BackendKind::Scraper, &e, mutating))?;

        let status = response.status();
        let headers = response.headers().clone();
        self.state.observe_headers(&endpoint, &headers);

        let text = response
            .text()
            .await
            .map_err(|e| transport_error(BackendKind::Scraper, &e, mutating))?;

        classify_web_response(status, &headers, &text).map_err(|e| {
            warn!(url = %url, status = %status, error = %e, "Web request failed");
            if e.kind == ErrorKind::Auth && !is_challenge(status, &headers, &text) {
                // A challenge needs a browser; anything else may be cured by a refresh.
                if let Err(invalidate_err) = self.session.invalidate(&credentials) {
                    warn!(error = %invalidate_err, "Failed to invalidate rejected session");
                }
            }
            e.with_backend(BackendKind::Scraper)
        })
    }

    async fn graphql_query(
        &self,
        query_id: &str,
        operation: &str,
        variables: Value,
    ) -> ConnectorResult<Value> {
        let query = vec![
            ("variables".to_string(), variables.to_string()),
            ("features".to_string(), features().to_string()),
        ];
        self.send(
            Method::GET,
            &format!("/i/api/graphql/{}/{}", query_id, operation),
            &query,
            Body::Empty,
            false,
        )
        .await
    }

    async fn graphql_mutation(
        &self,
        query_id: &str,
        operation: &str,
        variables: Value,
    ) -> ConnectorResult<Value> {
        let body = json!({
            "variables": variables,
            "features": features(),
            "queryId": query_id,
        });
        self.send(
            Method::POST,
            &format!("/i/api/graphql/{}/{}", query_id, operation),
            &[],
            Body::Json(body),
            true,
        )
        .await
    }

    /// Numeric id for a user reference, looking handles up first.
    async fn resolve_user(&self, user: &UserRef) -> ConnectorResult<String> {
        match user {
            UserRef::Id(id) => Ok(id.clone()),
            UserRef::Handle(handle) => {
                let body = self.user_by_handle(handle).await?;
                body.pointer("/data/user/result/rest_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ClassifiedError::not_found(format!("no user with handle @{}", handle))
                            .with_backend(BackendKind::Scraper)
                    })
            }
        }
    }

    async fn user_by_handle(&self, handle: &str) -> ConnectorResult<Value> {
        self.graphql_query(
            &self.query_ids.user_by_screen_name,
            "UserByScreenName",
            json!({ "screen_name": handle, "withSafetyModeUserFields": true }),
        )
        .await
    }

    async fn friendship(&self, user: &UserRef, endpoint: &str) -> ConnectorResult<Value> {
        let param = match user {
            UserRef::Id(id) => ("user_id".to_string(), id.clone()),
            UserRef::Handle(handle) => ("screen_name".to_string(), handle.clone()),
        };
        self.send(
            Method::POST,
            &format!("/i/api/1.1/friendships/{}.json", endpoint),
            &[],
            Body::Form(vec![param]),
            true,
        )
        .await
    }
}

#[async_trait]
impl BackendAdapter for ScraperAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Scraper
    }

    fn capabilities(&self) -> &'static [ActionKind] {
        SCRAPER_CAPABILITIES
    }

    fn is_ready(&self) -> bool {
        self.credentials.has(CredentialKind::Scraper)
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    #[instrument(skip(self, request), fields(backend = "scraper", kind = %request.kind))]
    async fn execute(&self, request: &ActionRequest) -> ConnectorResult<RawResponse> {
        let kind = request.kind;
        let payload = &request.payload;
        let ids = &self.query_ids;
        let mut target_id = None;

        if !payload.media.is_empty() {
            return Err(ClassifiedError::validation(
                "media attachments are only supported by the api backend",
            )
            .with_backend(BackendKind::Scraper));
        }

        let body = match kind {
            ActionKind::PostTweet | ActionKind::ReplyTweet => {
                let text = required(payload.text.as_deref(), kind, "text")?;
                let mut variables = json!({
                    "tweet_text": text,
                    "dark_request": false,
                    "media": { "media_entities": [], "possibly_sensitive": false },
                    "semantic_annotation_ids": [],
                });
                if kind == ActionKind::ReplyTweet {
                    let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                    variables["reply"] = json!({
                        "in_reply_to_tweet_id": tweet_id,
                        "exclude_reply_user_ids": [],
                    });
                }
                self.graphql_mutation(&ids.create_tweet, "CreateTweet", variables)
                    .await?
            }
            ActionKind::GetTweet => {
                let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                self.graphql_query(
                    &ids.tweet_by_id,
                    "TweetResultByRestId",
                    json!({
                        "tweetId": tweet_id,
                        "withCommunity": false,
                        "includePromotedContent": false,
                        "withVoice": false,
                    }),
                )
                .await?
            }
            ActionKind::GetTimeline => {
                let mut variables = json!({
                    "count": clamp_page_size(request, 20, 1),
                    "includePromotedContent": false,
                    "latestControlAvailable": true,
                });
                add_cursor(&mut variables, request);
                self.graphql_query(&ids.home_timeline, "HomeLatestTimeline", variables)
                    .await?
            }
            ActionKind::GetUserTweets => {
                let user_id = self.resolve_user(required_user(request)?).await?;
                let mut variables = json!({
                    "userId": user_id,
                    "count": clamp_page_size(request, 20, 1),
                    "includePromotedContent": false,
                    "withVoice": true,
                    "withV2Timeline": true,
                });
                add_cursor(&mut variables, request);
                self.graphql_query(&ids.user_tweets, "UserTweets", variables)
                    .await?
            }
            ActionKind::SearchRecent => {
                let query = required(payload.query.as_deref(), kind, "query")?;
                let mut variables = json!({
                    "rawQuery": query,
                    "count": clamp_page_size(request, 20, 1),
                    "querySource": "typed_query",
                    "product": "Latest",
                });
                add_cursor(&mut variables, request);
                self.graphql_query(&ids.search_timeline, "SearchTimeline", variables)
                    .await?
            }
            ActionKind::GetUser => match required_user(request)? {
                UserRef::Handle(handle) => self.user_by_handle(handle).await?,
                UserRef::Id(id) => {
                    self.graphql_query(
                        &ids.user_by_id,
                        "UserByRestId",
                        json!({ "userId": id, "withSafetyModeUserFields": true }),
                    )
                    .await?
                }
            },
            ActionKind::Follow | ActionKind::Unfollow => {
                let user = required_user(request)?;
                if let UserRef::Id(id) = user {
                    target_id = Some(id.clone());
                }
                let endpoint = if kind == ActionKind::Follow {
                    "create"
                } else {
                    "destroy"
                };
                self.friendship(user, endpoint).await?
            }
            ActionKind::GetFollowers | ActionKind::GetFollowing => {
                let user_id = self.resolve_user(required_user(request)?).await?;
                let (query_id, operation) = if kind == ActionKind::GetFollowers {
                    (&ids.followers, "Followers")
                } else {
                    (&ids.following, "Following")
                };
                let mut variables = json!({
                    "userId": user_id,
                    "count": clamp_page_size(request, 20, 1),
                    "includePromotedContent": false,
                });
                add_cursor(&mut variables, request);
                self.graphql_query(query_id, operation, variables).await?
            }
            ActionKind::Like | ActionKind::Unlike | ActionKind::Retweet => {
                let tweet_id = required(payload.tweet_id.as_deref(), kind, "tweet_id")?;
                target_id = Some(tweet_id.to_string());
                let (query_id, operation, variables) = match kind {
                    ActionKind::Like => (
                        &ids.favorite_tweet,
                        "FavoriteTweet",
                        json!({ "tweet_id": tweet_id }),
                    ),
                    ActionKind::Unlike => (
                        &ids.unfavorite_tweet,
                        "UnfavoriteTweet",
                        json!({ "tweet_id": tweet_id }),
                    ),
                    _ => (
                        &ids.create_retweet,
                        "CreateRetweet",
                        json!({ "tweet_id": tweet_id, "dark_request": false }),
                    ),
                };
                self.graphql_mutation(query_id, operation, variables).await?
            }
            ActionKind::GetBookmarks => {
                let mut variables = json!({
                    "count": clamp_page_size(request, 20, 1),
                    "includePromotedContent": false,
                });
                add_cursor(&mut variables, request);
                self.graphql_query(&ids.bookmarks, "Bookmarks", variables)
                    .await?
            }
            ActionKind::DeleteTweet
            | ActionKind::Unretweet
            | ActionKind::SearchAll
            | ActionKind::GetMe => {
                return Err(ClassifiedError::not_configured(format!(
                    "{} is not available through the web session",
                    kind
                ))
                .with_backend(BackendKind::Scraper))
            }
        };

        Ok(RawResponse {
            backend: BackendKind::Scraper,
            kind,
            target_id,
            body,
        })
    }
}

/// Headers the web client sends with every authenticated request.
pub(super) fn web_headers(bearer_token: &str, credentials: &ScraperCredentials) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut insert = |name: HeaderName, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };

    insert(AUTHORIZATION, format!("Bearer {}", bearer_token));
    insert(COOKIE, credentials.cookie_header());
    if let Some(ct0) = &credentials.csrf_token {
        insert(HeaderName::from_static("x-csrf-token"), ct0.clone());
    }
    insert(
        HeaderName::from_static("x-twitter-auth-type"),
        "OAuth2Session".to_string(),
    );
    insert(
        HeaderName::from_static("x-twitter-active-user"),
        "yes".to_string(),
    );
    insert(
        HeaderName::from_static("x-twitter-client-language"),
        "en".to_string(),
    );
    headers
}

/// Whether a response is an interactive account challenge instead of data.
pub(super) fn is_challenge(status: StatusCode, headers: &HeaderMap, body: &str) -> bool {
    let header_contains = |name: HeaderName, needle: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(needle))
    };

    if header_contains(LOCATION, CHALLENGE_PATH) || header_contains(CONTENT_TYPE, "text/html") {
        return true;
    }
    if status.is_redirection() {
        return true;
    }
    (!status.is_success() && body.contains(CHALLENGE_PATH))
        || error_codes(body).contains(&CHALLENGE_CODE)
}

fn error_codes(body: &str) -> Vec<i64> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("errors").cloned())
        .and_then(|errors| match errors {
            Value::Array(errors) => Some(
                errors
                    .iter()
                    .filter_map(|e| e.get("code").and_then(Value::as_i64))
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

/// Map a web endpoint response to a payload or a classified error.
///
/// GraphQL endpoints answer 200 with an `errors` list; the first known code
/// decides. Partial data alongside errors is accepted.
pub(crate) fn classify_web_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ConnectorResult<Value> {
    if is_challenge(status, headers, body) {
        return Err(ClassifiedError::auth(
            "session challenged: the account must be unlocked in a browser",
        ));
    }

    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let errors = parsed
        .as_ref()
        .and_then(|v| v.get("errors"))
        .and_then(Value::as_array)
        .filter(|errors| !errors.is_empty());
    let has_data = parsed.as_ref().is_some_and(|v| {
        v.get("data").is_some_and(|d| match d {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        }) || (v.get("errors").is_none() && !v.is_null())
    });

    if let Some(errors) = errors {
        if !(status.is_success() && has_data) {
            for error in errors {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("web endpoint error")
                    .to_string();
                if let Some(classified) = error
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|code| classify_code(code, message, headers))
                {
                    return Err(classified);
                }
            }
        }
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ClassifiedError::rate_limited(
            retry_after_from_headers(headers),
            "web endpoint rate limited",
        ));
    }

    let first_message = errors
        .and_then(|e| e[0].get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if status.is_success() {
        if errors.is_some() && !has_data {
            return Err(ClassifiedError::permanent(
                first_message.unwrap_or_else(|| "web endpoint returned only errors".to_string()),
            ));
        }
        return parsed.ok_or_else(|| {
            ClassifiedError::permanent(format!("unparseable {} response body", status))
        });
    }

    let message = first_message.unwrap_or_else(|| format!("web endpoint returned {}", status));

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClassifiedError::auth(message),
        StatusCode::NOT_FOUND => ClassifiedError::not_found(message),
        s if s.is_client_error() => ClassifiedError::validation(message),
        _ => ClassifiedError::transient(message),
    })
}

/// Classification of a web error code, if the code is a known one.
fn classify_code(code: i64, message: String, headers: &HeaderMap) -> Option<ClassifiedError> {
    let error = match code {
        32 | 89 | 239 => ClassifiedError::auth(message),
        // csrf token no longer matches the session
        CSRF_MISMATCH_CODE => ClassifiedError::auth(message),
        CHALLENGE_CODE => ClassifiedError::auth(message),
        88 | 344 => ClassifiedError::rate_limited(retry_after_from_headers(headers), message),
        // Follow limit and daily posting limit
        161 | 185 => ClassifiedError::rate_limited(retry_after_from_headers(headers), message),
        34 | 50 | 63 | 144 => ClassifiedError::not_found(message),
        64 => ClassifiedError::permanent(message),
        187 => ClassifiedError::validation(message),
        _ => return None,
    };
    Some(error)
}

fn add_cursor(variables: &mut Value, request: &ActionRequest) {
    if let Some(cursor) = &request.payload.cursor {
        variables["cursor"] = json!(cursor);
    }
}

fn required<'r>(value: Option<&'r str>, kind: ActionKind, field: &str) -> ConnectorResult<&'r str> {
    value.ok_or_else(|| ClassifiedError::validation(format!("{} requires `{}`", kind, field)))
}

fn required_user(request: &ActionRequest) -> ConnectorResult<&UserRef> {
    request.payload.user.as_ref().ok_or_else(|| {
        ClassifiedError::validation(format!("{} requires `user`", request.kind))
    })
}
