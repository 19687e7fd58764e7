//! Client configuration from defaults, environment variables and identity overrides.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use inbox_shared::{base_url_for_host, http_to_ws, join_url, Identity, REALTIME_PATH};

use crate::transport::ReconnectConfig;

pub const DEFAULT_API_URL: &str = "https://api.inbox.local";

/// Runtime configuration of an [`InboxClient`](crate::InboxClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the HTTP API.
    pub api_url: String,
    /// Realtime endpoint. `None` derives it from `api_url`.
    pub realtime_url: Option<String>,
    /// Messages requested per page.
    pub page_size: u32,
    /// Bound on every page-load and mutation call.
    pub request_timeout: Duration,
    /// How long `sign_in` waits for the first channel connection.
    pub connect_timeout: Duration,
    /// Extra attempts for a page load that failed with a retryable error.
    pub page_load_retries: u32,
    pub reconnect: ReconnectConfig,
    /// Load the first page of the current feed once a sign-in completes.
    pub load_on_sign_in: bool,
    /// Persist the signed-in identity between runs.
    pub persist_session: bool,
    /// Override for the session storage directory.
    pub storage_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            realtime_url: None,
            page_size: 25,
            request_timeout: Duration::from_millis(10_000),
            connect_timeout: Duration::from_millis(5_000),
            page_load_retries: 2,
            reconnect: ReconnectConfig::default(),
            load_on_sign_in: true,
            persist_session: false,
            storage_dir: None,
        }
    }
}

impl ClientConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `INBOX_API_URL`: API base URL or host (default: `https://api.inbox.local`)
    /// - `INBOX_REALTIME_URL`: realtime endpoint (default: derived from the API URL)
    /// - `INBOX_PAGE_SIZE`: messages per page (default: 25)
    /// - `INBOX_REQUEST_TIMEOUT_MS`: request timeout (default: 10000)
    /// - `INBOX_CONNECT_TIMEOUT_MS`: first-connect wait (default: 5000)
    /// - `INBOX_PAGE_LOAD_RETRIES`: retries for failed page loads (default: 2)
    /// - `INBOX_PERSIST_SESSION`: "1" or "true" to persist the identity
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("INBOX_API_URL") {
            config.api_url = base_url_for_host(&url);
        }
        if let Ok(url) = std::env::var("INBOX_REALTIME_URL") {
            config.realtime_url = Some(url);
        }
        if let Some(size) = env_number("INBOX_PAGE_SIZE")? {
            config.page_size = u32::try_from(size).context("INBOX_PAGE_SIZE out of range")?;
        }
        if let Some(ms) = env_number("INBOX_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("INBOX_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = env_number("INBOX_PAGE_LOAD_RETRIES")? {
            config.page_load_retries =
                u32::try_from(retries).context("INBOX_PAGE_LOAD_RETRIES out of range")?;
        }
        if let Ok(flag) = std::env::var("INBOX_PERSIST_SESSION") {
            config.persist_session = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = base_url_for_host(&url.into());
        self
    }

    pub fn with_realtime_url(mut self, url: impl Into<String>) -> Self {
        self.realtime_url = Some(url.into());
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_page_load_retries(mut self, retries: u32) -> Self {
        self.page_load_retries = retries;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_load_on_sign_in(mut self, enabled: bool) -> Self {
        self.load_on_sign_in = enabled;
        self
    }

    pub fn with_session_storage(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_session = true;
        self.storage_dir = Some(dir.into());
        self
    }

    /// API base URL for a session, honoring identity overrides.
    pub fn api_url_for(&self, identity: &Identity) -> String {
        match &identity.endpoints.api_url {
            Some(url) => base_url_for_host(url),
            None => self.api_url.clone(),
        }
    }

    /// Realtime endpoint for a session, honoring identity overrides.
    pub fn realtime_url_for(&self, identity: &Identity) -> String {
        if let Some(url) = &identity.endpoints.realtime_url {
            return http_to_ws(&base_url_for_host(url));
        }
        match &self.realtime_url {
            Some(url) => http_to_ws(&base_url_for_host(url)),
            None => http_to_ws(&join_url(&self.api_url_for(identity), REALTIME_PATH)),
        }
    }
}

fn env_number(key: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("invalid {key}: {raw:?}")),
        Err(_) => Ok(None),
    }
}
