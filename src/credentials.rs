//! Upstream credential cache
//!
//! Credentials are read lazily from a JSON session file and cached for the
//! life of the gateway. They are never mutated in place: an override or an
//! invalidation replaces the cached value wholesale.

use crate::error::{AppError, AppResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Default session file, relative to the home directory
pub const DEFAULT_CREDENTIALS_FILE: &str = ".acp-gateway/session.json";

/// Access token and tenant endpoint for the upstream agent
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "endpointURL", alias = "tenantURL")]
    endpoint_url: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            endpoint_url: endpoint_url.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    fn ensure_complete(self) -> AppResult<Self> {
        if self.access_token.trim().is_empty() {
            return Err(AppError::Credentials("accessToken is empty".to_string()));
        }
        if self.endpoint_url.trim().is_empty() {
            return Err(AppError::Credentials("endpointURL is empty".to_string()));
        }
        Ok(self)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

/// Default credential file location (`~/.acp-gateway/session.json`)
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_CREDENTIALS_FILE))
}

/// Process-wide credential cache, owned by the gateway context
#[derive(Debug)]
pub struct CredentialStore {
    path: Option<PathBuf>,
    cached: RwLock<Option<Arc<Credentials>>>,
}

impl CredentialStore {
    /// Store backed by a session file, loaded on first use
    pub fn from_path(path: Option<PathBuf>) -> Self {
        Self {
            path,
            cached: RwLock::new(None),
        }
    }

    /// Store preloaded with fixed credentials and no backing file
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            path: None,
            cached: RwLock::new(Some(Arc::new(credentials))),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Cached credentials, loading them from disk on first use
    pub async fn get(&self) -> AppResult<Arc<Credentials>> {
        if let Some(credentials) = self.current() {
            return Ok(credentials);
        }

        let path = self.path.as_deref().ok_or_else(|| {
            AppError::Credentials("no credentials file configured".to_string())
        })?;
        let credentials = Arc::new(load_credentials(path).await?);
        tracing::info!(path = %path.display(), "Loaded upstream credentials");

        let mut cached = self.write_slot();
        // A concurrent override wins over what we just read from disk.
        Ok(cached.get_or_insert(credentials).clone())
    }

    /// Replace the cached credentials wholesale
    pub fn override_with(&self, credentials: Credentials) -> AppResult<()> {
        let credentials = credentials.ensure_complete()?;
        *self.write_slot() = Some(Arc::new(credentials));
        tracing::info!("Upstream credentials overridden");
        Ok(())
    }

    /// Drop the cached credentials; the next `get()` reloads from disk
    pub fn invalidate(&self) {
        *self.write_slot() = None;
        tracing::debug!("Upstream credentials invalidated");
    }

    fn current(&self) -> Option<Arc<Credentials>> {
        match self.cached.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Credentials>>> {
        match self.cached.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn load_credentials(path: &Path) -> AppResult<Credentials> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::Credentials(format!(
            "failed to read credentials file '{}': {}",
            path.display(),
            e
        ))
    })?;
    let credentials: Credentials = serde_json::from_str(&content).map_err(|e| {
        AppError::Credentials(format!(
            "malformed credentials file '{}': {}",
            path.display(),
            e
        ))
    })?;
    credentials.ensure_complete()
}
