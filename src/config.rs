//! Client configuration
//!
//! Settings are stored as JSON and may be overridden from the environment,
//! which is how the backend URL and credentials usually reach a deployment.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`Settings::api_base_url`]
pub const ENV_API_URL: &str = "WACRM_API_URL";
/// Environment variable overriding [`Settings::socket_url`]
pub const ENV_SOCKET_URL: &str = "WACRM_SOCKET_URL";
/// Environment variable overriding [`Settings::access_token`]
pub const ENV_TOKEN: &str = "WACRM_TOKEN";
/// Environment variable overriding [`Settings::tenant_id`]
pub const ENV_TENANT: &str = "WACRM_TENANT";

/// Client settings
///
/// # Example
/// ```rust,no_run
/// use wacrm::config::Settings;
///
/// let mut settings = Settings::load("wacrm.json").expect("Failed to load");
/// settings.apply_env();
/// println!("Backend: {}", settings.api_base_url);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the REST API (e.g. "https://api.example.com")
    pub api_base_url: String,
    /// Base URL of the real-time channel; the Socket.IO path is appended
    pub socket_url: String,
    /// Bearer token attached to every REST call
    pub access_token: String,
    /// Tenant (company) id used to join the real-time room
    pub tenant_id: String,
    /// Quiet period before a live event triggers a ticket list refresh
    pub refresh_debounce_ms: u64,
    /// Per-request timeout for REST calls
    pub request_timeout_secs: u64,
    /// First reconnect delay after the socket drops
    pub reconnect_initial_ms: u64,
    /// Upper bound for the reconnect backoff
    pub reconnect_max_ms: u64,
}

impl Settings {
    /// Load settings from a JSON file
    ///
    /// Returns defaults if the file doesn't exist or is empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read settings: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a JSON file, creating parent directories as needed
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create settings directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Override fields from `WACRM_*` environment variables when set
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from an arbitrary lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(url) = non_empty(ENV_SOCKET_URL) {
            self.socket_url = url;
        }
        if let Some(token) = non_empty(ENV_TOKEN) {
            self.access_token = token;
        }
        if let Some(tenant) = non_empty(ENV_TENANT) {
            self.tenant_id = tenant;
        }
    }

    /// Check that the settings describe a usable backend
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [("api_base_url", &self.api_base_url), ("socket_url", &self.socket_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")
                || url.starts_with("ws://") || url.starts_with("wss://"))
            {
                return Err(Error::Config(format!("{} must be an http(s) or ws(s) URL, got '{}'", name, url)));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be greater than zero".to_string()));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(Error::Config(format!(
                "reconnect_initial_ms ({}) must be non-zero and not exceed reconnect_max_ms ({})",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }
        Ok(())
    }

    /// Debounce window as a `Duration`
    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    /// REST request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            socket_url: "ws://localhost:3000".to_string(),
            access_token: String::new(),
            tenant_id: String::new(),
            refresh_debounce_ms: 500,
            request_timeout_secs: 30,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_returns_defaults() {
        let dir = tempdir().expect("Failed to create temp dir");
        let settings = Settings::load(dir.path().join("absent.json")).expect("Failed to load");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.refresh_debounce_ms, 500);
    }

    #[test]
    fn test_empty_file_returns_defaults() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("empty.json");
        std::fs::write(&path, "  \n").expect("Failed to write");
        assert_eq!(Settings::load(&path).expect("Failed to load"), Settings::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("wacrm.json");

        let mut settings = Settings::default();
        settings.tenant_id = "company-7".to_string();
        settings.refresh_debounce_ms = 250;
        settings.save(&path).expect("Failed to save");

        let loaded = Settings::load(&path).expect("Failed to load");
        assert_eq!(loaded.tenant_id, "company-7");
        assert_eq!(loaded.refresh_debounce(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"tenant_id": "42"}"#).expect("Failed to write");

        let loaded = Settings::load(&path).expect("Failed to load");
        assert_eq!(loaded.tenant_id, "42");
        assert_eq!(loaded.request_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"api_base_url": "localhost"}"#).expect("Failed to write");

        let err = Settings::load(&path).expect_err("Should reject bare host");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let settings = Settings {
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 1_000,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_overrides_skip_blank_values() {
        let env: HashMap<&str, &str> = [
            (ENV_API_URL, "https://crm.example.com"),
            (ENV_TOKEN, "secret"),
            (ENV_TENANT, "   "),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings {
            tenant_id: "keep-me".to_string(),
            ..Settings::default()
        };
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.api_base_url, "https://crm.example.com");
        assert_eq!(settings.access_token, "secret");
        assert_eq!(settings.tenant_id, "keep-me");
        assert_eq!(settings.socket_url, Settings::default().socket_url);
    }
}
