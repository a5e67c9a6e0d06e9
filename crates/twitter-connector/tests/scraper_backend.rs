mod common;

use common::{api_credentials, connector_config, expired_session, fresh_session, timeline_body};
use serde_json::json;
use shared::BackendMode;
use std::sync::Arc;
use std::time::Duration;
use twitter_connector::backend::ScraperAdapter;
use twitter_connector::credentials::ScraperCredentials;
use twitter_connector::retry::RetryPolicy;
use twitter_connector::{
    ActionKind, ActionRequest, BackendAdapter, BackendKind, BackendSelector, CredentialStore,
    Dispatcher, ErrorKind, SessionStore,
};
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SETTINGS_PATH: &str = "/i/api/1.1/account/settings.json";

fn scraper_dispatcher(
    server: &MockServer,
    session: ScraperCredentials,
    store: Option<SessionStore>,
) -> (Dispatcher, Arc<ScraperAdapter>) {
    let config = connector_config(&server.uri(), BackendMode::ScraperOnly);
    let credentials = Arc::new(CredentialStore::new(None, Some(session)).unwrap());
    let adapter = Arc::new(ScraperAdapter::new(&config.scraper, credentials, store).unwrap());

    let dyn_adapter: Arc<dyn BackendAdapter> = adapter.clone();
    let dispatcher = Dispatcher::new(
        BackendSelector::new(None, Some(dyn_adapter)),
        BackendMode::ScraperOnly,
        RetryPolicy::from(&config.retry),
    );
    (dispatcher, adapter)
}

async fn mount_refresh(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(SETTINGS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "ct0=fresh; Path=/; Domain=.x.com; Secure")
                .set_body_json(json!({ "screen_name": "me" }))
                .set_delay(delay),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_concurrent_calls_share_one_refresh() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::from_millis(200)).await;

    Mock::given(method("GET"))
        .and(path_regex(r"/HomeLatestTimeline$"))
        .and(header("x-csrf-token", "fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(timeline_body("home", &["1", "2"])))
        .expect(2)
        .mount(&server)
        .await;

    let (dispatcher, adapter) = scraper_dispatcher(&server, expired_session(), None);
    let request = ActionRequest::new(ActionKind::GetTimeline);

    let (first, second) = tokio::join!(dispatcher.dispatch(&request), dispatcher.dispatch(&request));

    for result in [first, second] {
        let page = result.unwrap();
        let ids: Vec<_> = page
            .as_tweet_page()
            .unwrap()
            .tweets
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
    assert_eq!(adapter.refresh_count(), 1);
}

#[tokio::test]
async fn test_rejected_refresh_is_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(SETTINGS_PATH))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({ "errors": [{ "code": 32, "message": "Could not authenticate you." }] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"/HomeLatestTimeline$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(timeline_body("home", &["1"])))
        .expect(0)
        .mount(&server)
        .await;

    let (dispatcher, _) = scraper_dispatcher(&server, expired_session(), None);
    let err = dispatcher
        .dispatch(&ActionRequest::new(ActionKind::GetTimeline))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Auth);
    assert_eq!(err.backend, Some(BackendKind::Scraper));
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn test_html_challenge_is_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path_regex(r"/TweetResultByRestId$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><body>Verify your identity</body></html>", "text/html"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (dispatcher, _) = scraper_dispatcher(&server, fresh_session(), None);
    let err = dispatcher
        .dispatch(&ActionRequest::new(ActionKind::GetTweet).with_tweet_id("10"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Auth);
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn test_duplicate_post_is_validation_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path_regex(r"/CreateTweet$"))
        .and(header("x-csrf-token", "current"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{ "code": 187, "message": "Status is a duplicate. (187)" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (dispatcher, _) = scraper_dispatcher(&server, fresh_session(), None);
    let err = dispatcher
        .dispatch(&ActionRequest::new(ActionKind::PostTweet).with_text("again"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(!err.outcome_unknown);
}

#[tokio::test]
async fn test_post_tweet_through_web_session() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path_regex(r"/CreateTweet$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "create_tweet": { "tweet_results": { "result": {
                "__typename": "Tweet",
                "rest_id": "900",
                "legacy": { "full_text": "from the web" }
            } } } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (dispatcher, _) = scraper_dispatcher(&server, fresh_session(), None);
    let result = dispatcher
        .dispatch(&ActionRequest::new(ActionKind::PostTweet).with_text("from the web"))
        .await
        .unwrap();

    let tweet = result.as_tweet().unwrap();
    assert_eq!(tweet.id, "900");
    assert_eq!(tweet.text, "from the web");
}

#[tokio::test]
async fn test_refreshed_session_is_persisted() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::ZERO).await;

    Mock::given(method("GET"))
        .and(path_regex(r"/HomeLatestTimeline$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(timeline_body("home", &["7"])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("session.json"));
    let (dispatcher, _) = scraper_dispatcher(&server, expired_session(), Some(store.clone()));

    dispatcher
        .dispatch(&ActionRequest::new(ActionKind::GetTimeline))
        .await
        .unwrap();

    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.csrf_token.as_deref(), Some("fresh"));
    assert_eq!(saved.auth_token, "auth-token");
    assert!(saved.expiry.is_some_and(|expiry| expiry > chrono::Utc::now()));
}

#[tokio::test]
async fn test_prefer_api_falls_back_for_bookmarks() {
    let server = MockServer::start().await;

    Mock::given(path_regex(r"^/2/"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"/Bookmarks$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(timeline_body("bookmarks", &["3", "4"])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let credentials =
        Arc::new(CredentialStore::new(Some(api_credentials()), Some(fresh_session())).unwrap());
    let dispatcher = Dispatcher::from_config(
        &connector_config(&server.uri(), BackendMode::PreferApi),
        credentials,
        None,
    )
    .unwrap();

    let result = dispatcher
        .dispatch(&ActionRequest::new(ActionKind::GetBookmarks))
        .await
        .unwrap();
    assert_eq!(result.as_tweet_page().unwrap().tweets.len(), 2);
}

#[tokio::test]
async fn test_csrf_mismatch_forces_refresh_on_next_call() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::ZERO).await;

    Mock::given(method("GET"))
        .and(path_regex(r"/HomeLatestTimeline$"))
        .and(header("x-csrf-token", "current"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errors": [{ "code": 353, "message": "This request requires a matching csrf cookie and header." }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"/HomeLatestTimeline$"))
        .and(header("x-csrf-token", "fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(timeline_body("home", &["8"])))
        .expect(1)
        .mount(&server)
        .await;

    let (dispatcher, adapter) = scraper_dispatcher(&server, fresh_session(), None);
    let request = ActionRequest::new(ActionKind::GetTimeline);

    let err = dispatcher.dispatch(&request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Auth);
    assert_eq!(adapter.refresh_count(), 0);

    let page = dispatcher.dispatch(&request).await.unwrap();
    assert_eq!(page.as_tweet_page().unwrap().tweets[0].id, "8");
    assert_eq!(adapter.refresh_count(), 1);
}

#[tokio::test]
async fn test_challenge_does_not_force_refresh() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(SETTINGS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"/HomeLatestTimeline$"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errors": [{ "code": 326, "message": "To protect our users from spam..." }]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let (dispatcher, adapter) = scraper_dispatcher(&server, fresh_session(), None);
    let request = ActionRequest::new(ActionKind::GetTimeline);

    for _ in 0..2 {
        let err = dispatcher.dispatch(&request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
    }
    assert_eq!(adapter.refresh_count(), 0);
}
