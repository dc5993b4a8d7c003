//! User configuration
//!
//! Optional defaults live in ~/.iaptun/config.json. Command line flags and
//! environment variables take precedence over the file.

use anyhow::{Context, Result};
use iaptun_transport_websocket::RelayConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Probe timeout when neither the flag nor the file sets one
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IaptunConfig {
    /// Relay base URL (ws:// or wss://)
    pub relay_url: Option<String>,

    /// Probe timeout in seconds
    pub probe_timeout_secs: Option<u64>,

    /// Bearer token for the relay
    pub access_token: Option<String>,
}

impl IaptunConfig {
    /// Relay settings, with `url_override` winning over the file
    pub fn relay_config(&self, url_override: Option<&str>) -> RelayConfig {
        match url_override.or(self.relay_url.as_deref()) {
            Some(url) => RelayConfig::default().with_url(url),
            None => RelayConfig::default(),
        }
    }

    pub fn probe_timeout(&self, secs_override: Option<u64>) -> Duration {
        secs_override
            .or(self.probe_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn access_token(&self, token_override: Option<String>) -> Result<String> {
        token_override
            .or_else(|| self.access_token.clone())
            .filter(|token| !token.is_empty())
            .context("No access token: pass --token, set IAPTUN_TOKEN, or add accessToken to ~/.iaptun/config.json")
    }
}

/// Configuration file access
pub struct ConfigManager;

impl ConfigManager {
    fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".iaptun").join("config.json"))
    }

    /// Load ~/.iaptun/config.json, or defaults if it does not exist
    pub fn load() -> Result<IaptunConfig> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<IaptunConfig> {
        if !path.exists() {
            return Ok(IaptunConfig::default());
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
