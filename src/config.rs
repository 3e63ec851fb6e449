use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BACKEND_URL_ENV: &str = "OTLIST_BACKEND_URL";
pub const TOKEN_ENV: &str = "OTLIST_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub collections: Collections,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    /// Session token sent as the `Authorization` header.
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: "http://127.0.0.1:8090".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Backend collection names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Collections {
    pub procedures: String,
    pub patients: String,
    pub ot_days: String,
    pub ot_lists: String,
    pub operating_rooms: String,
    pub comments: String,
}

impl Default for Collections {
    fn default() -> Self {
        Collections {
            procedures: "procedures".to_string(),
            patients: "patients".to_string(),
            ot_days: "ot_days".to_string(),
            ot_lists: "ot_lists".to_string(),
            operating_rooms: "operating_rooms".to_string(),
            comments: "comments".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { filter: "otlist=info".to_string() }
    }
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Override file values from the environment (or any lookup).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(BACKEND_URL_ENV) {
            self.backend.url = url;
        }
        if let Some(token) = lookup(TOKEN_ENV) {
            self.backend.token = Some(token).filter(|token| !token.is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.backend.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!("backend.url must be an http(s) URL, got `{}`", url)));
        }
        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::Invalid("backend.timeout_secs must be positive".to_string()));
        }
        let names = [
            &self.collections.procedures,
            &self.collections.patients,
            &self.collections.ot_days,
            &self.collections.ot_lists,
            &self.collections.operating_rooms,
            &self.collections.comments,
        ];
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid("collection names must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Load configuration from a YAML file. A missing file yields defaults;
/// environment overrides are applied afterwards.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => Config::from_yaml(&content)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Config::default()
        }
        Err(source) => {
            return Err(ConfigError::Io { path: path.to_path_buf(), source });
        }
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_yaml("backend:\n  url: https://ot.example.org\n").unwrap();
        assert_eq!(config.backend.url, "https://ot.example.org");
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.collections, Collections::default());
        assert_eq!(config.log.filter, "otlist=info");
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(matches!(Config::from_yaml("backend: [1, 2"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn overrides_win_over_file() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            BACKEND_URL_ENV => Some("https://override".to_string()),
            TOKEN_ENV => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(config.backend.url, "https://override");
        assert_eq!(config.backend.token.as_deref(), Some("secret"));
    }

    #[test]
    fn validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.backend.url = "ftp://nope".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.backend.url = "http://ok".into();
        config.collections.comments = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/otlist.yaml")).unwrap();
        assert_eq!(config.collections.procedures, "procedures");
    }
}
