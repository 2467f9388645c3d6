use std::{fs, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base: String,
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientSettings {
    pub fn with_api_base(api_base: &str) -> Result<Self, SettingsError> {
        Self::default().override_api_base(api_base)
    }

    /// Replace the api base, keeping everything else.
    pub fn override_api_base(mut self, api_base: &str) -> Result<Self, SettingsError> {
        self.api_base = normalize_api_base(api_base)?;
        Ok(self)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid client.toml: {0}")]
    File(#[from] toml::de::Error),
    #[error("invalid api base '{value}': {reason}")]
    ApiBase { value: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base: Option<String>,
    request_timeout_ms: Option<u64>,
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    resolve_settings(file.as_deref(), |key| std::env::var(key).ok())
}

pub fn resolve_settings(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, SettingsError> {
    let mut settings = ClientSettings::default();

    if let Some(raw) = file {
        let file_cfg: FileSettings = toml::from_str(raw)?;
        if let Some(v) = file_cfg.api_base {
            settings.api_base = v;
        }
        if let Some(ms) = file_cfg.request_timeout_ms {
            settings.request_timeout = Duration::from_millis(ms);
        }
    }

    if let Some(v) = env("API_BASE") {
        settings.api_base = v;
    }
    if let Some(v) = env("APP__API_BASE") {
        settings.api_base = v;
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_MS") {
        if let Ok(parsed) = v.trim().parse::<u64>() {
            settings.request_timeout = Duration::from_millis(parsed);
        }
    }

    settings.api_base = normalize_api_base(&settings.api_base)?;
    debug!(
        "settings: api_base={} request_timeout_ms={}",
        settings.api_base,
        settings.request_timeout.as_millis()
    );
    Ok(settings)
}

fn normalize_api_base(raw: &str) -> Result<String, SettingsError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(DEFAULT_API_BASE.to_string());
    }

    let invalid = |reason: String| SettingsError::ApiBase {
        value: raw.to_string(),
        reason,
    };
    let url = Url::parse(trimmed).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("not a base url".to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
