//! Credential store shared by both backends.
//!
//! Each credential set sits behind its own lock as an `Arc` that is swapped
//! whole on refresh, so a reader holds either the old set or the new one and
//! never a mix of both.

use crate::error::{ClassifiedError, ConnectorResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Environment variables holding the official API credentials.
pub const CONSUMER_KEY_VAR: &str = "CONSUMER_KEY";
pub const CONSUMER_SECRET_VAR: &str = "CONSUMER_SECRET";
pub const ACCESS_TOKEN_VAR: &str = "ACCESS_TOKEN";
pub const ACCESS_TOKEN_SECRET_VAR: &str = "ACCESS_TOKEN_SECRET";

/// Environment variables holding a browser session.
pub const AUTH_TOKEN_VAR: &str = "TWITTER_AUTH_TOKEN";
pub const CT0_VAR: &str = "TWITTER_CT0";
pub const COOKIES_VAR: &str = "TWITTER_COOKIES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Api,
    Scraper,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Api => write!(f, "api"),
            CredentialKind::Scraper => write!(f, "scraper"),
        }
    }
}

/// OAuth 1.0a application + user tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("access_token_secret", &"<redacted>")
            .finish()
    }
}

/// A logged-in browser session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScraperCredentials {
    /// Extra cookies sent with every request (name -> value)
    #[serde(default)]
    pub session_cookies: BTreeMap<String, String>,
    /// `ct0` cookie, echoed back as the `x-csrf-token` header
    #[serde(default)]
    pub csrf_token: Option<String>,
    /// `auth_token` cookie identifying the logged-in session
    pub auth_token: String,
    /// When the current csrf token stops being trusted; `None` means unknown
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for ScraperCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScraperCredentials")
            .field("session_cookies", &self.session_cookies.keys().collect::<Vec<_>>())
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "<redacted>"))
            .field("auth_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl ScraperCredentials {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            session_cookies: BTreeMap::new(),
            csrf_token: None,
            auth_token: auth_token.into(),
            expiry: None,
        }
    }

    /// Whether the session must be refreshed before use.
    ///
    /// A session with no csrf token or no known expiry always needs one.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        match (&self.csrf_token, self.expiry) {
            (Some(_), Some(expiry)) => now + margin >= expiry,
            _ => true,
        }
    }

    /// `Cookie` header value carrying the session.
    pub fn cookie_header(&self) -> String {
        let mut cookies: Vec<String> = self
            .session_cookies
            .iter()
            .filter(|(name, _)| name.as_str() != "auth_token" && name.as_str() != "ct0")
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        cookies.push(format!("auth_token={}", self.auth_token));
        if let Some(ct0) = &self.csrf_token {
            cookies.push(format!("ct0={}", ct0));
        }
        cookies.join("; ")
    }
}

/// Parse a `name=value; name2=value2` cookie string.
pub fn parse_cookie_string(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Either credential set, as handed out by the store.
#[derive(Debug, Clone)]
pub enum Credentials {
    Api(Arc<ApiCredentials>),
    Scraper(Arc<ScraperCredentials>),
}

impl Credentials {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credentials::Api(_) => CredentialKind::Api,
            Credentials::Scraper(_) => CredentialKind::Scraper,
        }
    }
}

/// Process-scoped holder of both credential sets.
#[derive(Debug)]
pub struct CredentialStore {
    api: RwLock<Option<Arc<ApiCredentials>>>,
    scraper: RwLock<Option<Arc<ScraperCredentials>>>,
}

impl CredentialStore {
    /// Create a store. At least one credential set must be present.
    pub fn new(
        api: Option<ApiCredentials>,
        scraper: Option<ScraperCredentials>,
    ) -> ConnectorResult<Self> {
        if api.is_none() && scraper.is_none() {
            return Err(ClassifiedError::not_configured(
                "no API credentials and no scraper session supplied",
            ));
        }

        info!(
            api = api.is_some(),
            scraper = scraper.is_some(),
            "Credential store initialized"
        );

        Ok(Self {
            api: RwLock::new(api.map(Arc::new)),
            scraper: RwLock::new(scraper.map(Arc::new)),
        })
    }

    /// Look up credentials of the given kind.
    pub fn get(&self, kind: CredentialKind) -> ConnectorResult<Credentials> {
        match kind {
            CredentialKind::Api => self.api().map(Credentials::Api),
            CredentialKind::Scraper => self.scraper().map(Credentials::Scraper),
        }
    }

    pub fn api(&self) -> ConnectorResult<Arc<ApiCredentials>> {
        self.api
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ClassifiedError::not_configured("API credentials were not supplied"))
    }

    pub fn scraper(&self) -> ConnectorResult<Arc<ScraperCredentials>> {
        self.scraper
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ClassifiedError::not_configured("scraper session was not supplied"))
    }

    pub fn has(&self, kind: CredentialKind) -> bool {
        match kind {
            CredentialKind::Api => self.api.read().unwrap_or_else(PoisonError::into_inner).is_some(),
            CredentialKind::Scraper => self
                .scraper
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
        }
    }

    /// Replace a credential set in place.
    ///
    /// Only kinds supplied at startup can be refreshed.
    pub fn refresh(&self, kind: CredentialKind, new_state: Credentials) -> ConnectorResult<()> {
        if new_state.kind() != kind {
            return Err(ClassifiedError::validation(format!(
                "cannot refresh {} credentials with {} credentials",
                kind,
                new_state.kind()
            )));
        }

        match new_state {
            Credentials::Api(api) => {
                let mut slot = self.api.write().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    return Err(ClassifiedError::not_configured(
                        "API credentials were not supplied",
                    ));
                }
                *slot = Some(api);
            }
            Credentials::Scraper(session) => {
                let mut slot = self.scraper.write().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    return Err(ClassifiedError::not_configured(
                        "scraper session was not supplied",
                    ));
                }
                debug!(expiry = ?session.expiry, "Scraper session replaced");
                *slot = Some(session);
            }
        }

        Ok(())
    }
}

/// Credentials read from the process environment.
#[derive(Debug, Default)]
pub struct ConnectorEnv {
    pub api: Option<ApiCredentials>,
    pub scraper: Option<ScraperCredentials>,
}

impl ConnectorEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read credentials through `lookup`; blank values count as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_values = [
            get(CONSUMER_KEY_VAR),
            get(CONSUMER_SECRET_VAR),
            get(ACCESS_TOKEN_VAR),
            get(ACCESS_TOKEN_SECRET_VAR),
        ];
        let present = api_values.iter().filter(|v| v.is_some()).count();
        let api = match api_values {
            [Some(consumer_key), Some(consumer_secret), Some(access_token), Some(access_token_secret)] => {
                Some(ApiCredentials {
                    consumer_key,
                    consumer_secret,
                    access_token,
                    access_token_secret,
                })
            }
            _ => {
                if present > 0 {
                    warn!(
                        present = present,
                        "Incomplete API credentials in environment, ignoring them"
                    );
                }
                None
            }
        };

        let scraper = get(AUTH_TOKEN_VAR).map(|auth_token| {
            let mut session = ScraperCredentials::new(auth_token);
            if let Some(cookies) = get(COOKIES_VAR) {
                session.session_cookies = parse_cookie_string(&cookies);
            }
            session.csrf_token = get(CT0_VAR).or_else(|| session.session_cookies.get("ct0").cloned());
            session
        });

        Self { api, scraper }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn api_credentials() -> ApiCredentials {
        ApiCredentials {
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            access_token: "at".into(),
            access_token_secret: "ats".into(),
        }
    }

    #[test]
    fn test_requires_one_credential_set() {
        let err = CredentialStore::new(None, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConfigured);
    }

    #[test]
    fn test_get_missing_kind() {
        let store = CredentialStore::new(Some(api_credentials()), None).unwrap();
        assert!(store.has(CredentialKind::Api));
        assert!(!store.has(CredentialKind::Scraper));
        assert!(matches!(
            store.get(CredentialKind::Api),
            Ok(Credentials::Api(_))
        ));

        let err = store.get(CredentialKind::Scraper).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConfigured);
    }

    #[test]
    fn test_refresh_replaces_whole_value() {
        let store =
            CredentialStore::new(None, Some(ScraperCredentials::new("token"))).unwrap();
        let before = store.scraper().unwrap();

        let mut next = ScraperCredentials::new("token");
        next.csrf_token = Some("fresh".into());
        next.expiry = Some(Utc::now() + ChronoDuration::hours(1));
        store
            .refresh(CredentialKind::Scraper, Credentials::Scraper(Arc::new(next.clone())))
            .unwrap();

        // Readers holding the old Arc keep a consistent old value.
        assert_eq!(before.csrf_token, None);
        assert_eq!(*store.scraper().unwrap(), next);
    }

    #[test]
    fn test_refresh_unconfigured_kind() {
        let store = CredentialStore::new(Some(api_credentials()), None).unwrap();
        let err = store
            .refresh(
                CredentialKind::Scraper,
                Credentials::Scraper(Arc::new(ScraperCredentials::new("t"))),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConfigured);

        let err = store
            .refresh(
                CredentialKind::Api,
                Credentials::Scraper(Arc::new(ScraperCredentials::new("t"))),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_needs_refresh() {
        let now = Utc::now();
        let margin = ChronoDuration::seconds(60);

        let mut session = ScraperCredentials::new("t");
        assert!(session.needs_refresh(now, margin));

        session.csrf_token = Some("ct0".into());
        session.expiry = Some(now + ChronoDuration::seconds(30));
        assert!(session.needs_refresh(now, margin));

        session.expiry = Some(now + ChronoDuration::hours(1));
        assert!(!session.needs_refresh(now, margin));
    }

    #[test]
    fn test_cookie_header() {
        let mut session = ScraperCredentials::new("secret");
        session.session_cookies = parse_cookie_string("guest_id=v1%3A1; ct0=stale; lang=en");
        session.csrf_token = Some("fresh".into());

        assert_eq!(
            session.cookie_header(),
            "guest_id=v1%3A1; lang=en; auth_token=secret; ct0=fresh"
        );
    }

    #[test]
    fn test_env_loading() {
        let vars: HashMap<&str, &str> = [
            (CONSUMER_KEY_VAR, "ck"),
            (CONSUMER_SECRET_VAR, "cs"),
            (ACCESS_TOKEN_VAR, "at"),
            (ACCESS_TOKEN_SECRET_VAR, "ats"),
            (AUTH_TOKEN_VAR, "auth"),
            (COOKIES_VAR, "ct0=abc; twid=u%3D1"),
        ]
        .into_iter()
        .collect();

        let env = ConnectorEnv::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(env.api, Some(api_credentials()));

        let scraper = env.scraper.unwrap();
        assert_eq!(scraper.auth_token, "auth");
        assert_eq!(scraper.csrf_token.as_deref(), Some("abc"));
        assert_eq!(scraper.session_cookies.get("twid").map(String::as_str), Some("u%3D1"));
    }

    #[test]
    fn test_env_ignores_partial_api_credentials() {
        let env = ConnectorEnv::from_lookup(|name| {
            (name == CONSUMER_KEY_VAR).then(|| "ck".to_string())
        });
        assert!(env.api.is_none());
        assert!(env.scraper.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let output = format!("{:?}", api_credentials());
        assert!(!output.contains("\"ats\""));
        assert!(!output.contains("\"cs\""));
        assert!(output.contains("<redacted>"));
    }
}
