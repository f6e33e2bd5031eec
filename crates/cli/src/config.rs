//! CLI configuration at `~/.config/wisp/config.toml`.
//!
//! Session settings live under `[client]`; command-line flags override them.
//!
//! ```toml
//! user = "alice"
//!
//! [client]
//! connect_timeout = 10
//! strict_host_key_checking = "ask"
//! relay_url = "wss://relay.example.com/ssh"
//!
//! [client.reconnect]
//! enabled = true
//! max_retries = 5
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use wisp_session::ClientConfig;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Login name used when the destination has none.
    pub user: Option<String>,
    /// Session settings.
    pub client: ClientConfig,
}

/// Returns `~/.config/wisp/config.toml`, if there is a config directory.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wisp").join("config.toml"))
}

impl CliConfig {
    /// Loads `path`, returning defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found; using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .client
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Loads `explicit` if given, else the default location.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => match default_path() {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wisp_session::StrictHostKeyChecking;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
user = "alice"

[client]
connect_timeout = 10
strict_host_key_checking = "ask"
keepalive_interval = 15
relay_url = "wss://relay.example.com/ssh"

[client.reconnect]
enabled = true
max_retries = 5
"#,
        )
        .unwrap();

        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.user.as_deref(), Some("alice"));
        assert_eq!(config.client.connect_timeout, Duration::from_secs(10));
        assert_eq!(
            config.client.strict_host_key_checking,
            StrictHostKeyChecking::Ask
        );
        assert_eq!(config.client.keepalive_interval, Some(Duration::from_secs(15)));
        assert!(config.client.reconnect.enabled);
        assert_eq!(config.client.reconnect.max_retries, 5);
        assert_eq!(
            config.client.password_attempts,
            ClientConfig::default().password_attempts
        );
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client]\nrelay_url = \"http://relay\"\n").unwrap();
        assert!(CliConfig::load(&path).is_err());

        std::fs::write(&path, "[client\n").unwrap();
        assert!(CliConfig::load(&path).is_err());
    }
}
