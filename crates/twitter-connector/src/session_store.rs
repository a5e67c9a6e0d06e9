//! Persistence for refreshed scraper sessions.
//!
//! Only used when the host opts in; otherwise refreshed sessions live in memory.

use crate::credentials::ScraperCredentials;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// JSON file holding the last refreshed session
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored session, if one was saved.
    pub fn load(&self) -> Result<Option<ScraperCredentials>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No stored session");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session file: {}", self.path.display()))?;

        let session: ScraperCredentials = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file: {}", self.path.display()))?;

        debug!(path = %self.path.display(), expiry = ?session.expiry, "Loaded stored session");
        Ok(Some(session))
    }

    /// Write the session, readable by the owner only.
    pub fn save(&self, session: &ScraperCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create session directory: {}", parent.display())
            })?;
        }

        let content =
            serde_json::to_string_pretty(session).context("Failed to serialize session")?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = open_private(&tmp)
                .with_context(|| format!("Failed to create session file: {}", tmp.display()))?;
            file.write_all(content.as_bytes())
                .with_context(|| format!("Failed to write session file: {}", tmp.display()))?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace session file: {}", self.path.display()))?;

        info!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    /// Remove the stored session, if any.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).with_context(|| {
                format!("Failed to remove session file: {}", self.path.display())
            })?;
            info!(path = %self.path.display(), "Session cleared");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::File::create(path)
}
