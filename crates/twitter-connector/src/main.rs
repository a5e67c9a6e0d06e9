//! Twitter connector CLI.
//!
//! Reads one JSON action request per stdin line, dispatches them concurrently
//! and writes one JSON outcome per line to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{BackendMode, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{info, warn};
use twitter_connector::credentials::ScraperCredentials;
use twitter_connector::{
    ActionRequest, ActionResult, ClassifiedError, ConnectorEnv, CredentialStore, Dispatcher,
    SessionStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Backend mode (prefer-api, prefer-scraper, api-only, scraper-only)
    #[arg(short, long)]
    mode: Option<BackendMode>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Give up on a single action after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Load and save the refreshed scraper session in the session file
    #[arg(long)]
    persist_session: bool,
}

/// One stdin line: an action request plus an optional correlation id.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: ActionRequest,
}

/// One stdout line.
#[derive(Debug, Serialize)]
struct Outcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<ActionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ClassifiedError>,
}

impl Outcome {
    fn new(id: Option<Value>, result: Result<ActionResult, ClassifiedError>) -> Self {
        match result {
            Ok(ok) => Self {
                id,
                ok: Some(ok),
                error: None,
            },
            Err(error) => Self {
                id,
                ok: None,
                error: Some(error),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(mode) = args.mode {
        config.connector.mode = mode;
    }

    // Initialize logging
    let mut log_config = shared::LogConfig::from_config(&config, "twitter-connector");
    if args.verbose {
        log_config.default_level = tracing::Level::DEBUG;
    }
    shared::logging::init(log_config)?;

    info!(config_file = %args.config.display(), mode = %config.connector.mode, "Twitter connector starting");

    let session_store = args
        .persist_session
        .then(|| SessionStore::new(config.session_file()));

    let env = ConnectorEnv::from_env();
    let stored = match &session_store {
        Some(store) => store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unreadable session file");
            None
        }),
        None => None,
    };
    let scraper = pick_session(env.scraper, stored);

    let credentials = Arc::new(
        CredentialStore::new(env.api, scraper)
            .context("No credentials configured; set the API variables or TWITTER_AUTH_TOKEN")?,
    );
    let dispatcher = Arc::new(
        Dispatcher::from_config(&config.connector, credentials, session_store)
            .context("Failed to create dispatcher")?,
    );
    let deadline = args.timeout_secs.map(Duration::from_secs);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let dispatcher = Arc::clone(&dispatcher);
        tasks.spawn(async move {
            let outcome = match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    let result = dispatcher.dispatch_within(&envelope.request, deadline).await;
                    Outcome::new(envelope.id, result)
                }
                Err(e) => Outcome::new(
                    None,
                    Err(ClassifiedError::validation(format!("invalid request: {}", e))),
                ),
            };
            emit(&outcome);
            outcome.ok.is_some()
        });
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => succeeded += 1,
            Ok(false) => failed += 1,
            Err(e) => {
                warn!(error = %e, "Dispatch task panicked");
                failed += 1;
            }
        }
    }

    info!(succeeded, failed, "Twitter connector finished");
    Ok(())
}

/// Stored session wins when it belongs to the same login as the environment.
fn pick_session(
    from_env: Option<ScraperCredentials>,
    stored: Option<ScraperCredentials>,
) -> Option<ScraperCredentials> {
    match (from_env, stored) {
        (Some(env), Some(stored)) if env.auth_token == stored.auth_token => Some(stored),
        (Some(env), _) => Some(env),
        (None, stored) => stored,
    }
}

fn emit(outcome: &Outcome) {
    match serde_json::to_string(outcome) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize outcome"),
    }
}
