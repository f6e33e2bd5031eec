//! Client configuration.

use crate::reconnect::{duration_secs, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use wisp_platform::{WispError, WispResult};
use wisp_proto::ssh::client::{SshClientConfig, DEFAULT_PASSWORD_ATTEMPTS};
use wisp_proto::ssh::transport::{DEFAULT_REKEY_BYTES, DEFAULT_REKEY_INTERVAL};
use wisp_proto::ssh::{Identity, StrictHostKeyChecking};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default descriptor write budget per pacing window.
pub const DEFAULT_WRITE_PACING_BYTES: usize = 1024 * 1024;

/// Settings shared by every session an engine runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Time allowed for dialing, in seconds.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// OpenSSH known_hosts database.
    pub known_hosts_file: Option<PathBuf>,
    /// Host key policy: `strict`, `ask`, `accept-new` or `no`.
    #[serde(with = "strict_checking")]
    pub strict_host_key_checking: StrictHostKeyChecking,
    /// Unencrypted OpenSSH Ed25519 keys offered for `publickey`.
    pub identity_files: Vec<PathBuf>,
    /// Keep-alive interval in seconds. Off when absent.
    #[serde(with = "optional_secs")]
    pub keepalive_interval: Option<Duration>,
    /// Bytes after which the connection rekeys.
    pub rekey_bytes_limit: u64,
    /// Time after which the connection rekeys, in seconds.
    #[serde(with = "duration_secs")]
    pub rekey_time_limit: Duration,
    /// Password prompts before giving up.
    pub password_attempts: u32,
    /// Bytes each descriptor may forward per 100 ms pacing window.
    pub write_pacing_bytes: usize,
    /// WebSocket relay used instead of dialing TCP directly.
    pub relay_url: Option<String>,
    /// Automatic reconnection.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir().map(|home| home.join(".ssh"));
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            known_hosts_file: ssh_dir.as_ref().map(|dir| dir.join("known_hosts")),
            strict_host_key_checking: StrictHostKeyChecking::default(),
            identity_files: ssh_dir
                .map(|dir| vec![dir.join("id_ed25519")])
                .unwrap_or_default(),
            keepalive_interval: None,
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            rekey_time_limit: DEFAULT_REKEY_INTERVAL,
            password_attempts: DEFAULT_PASSWORD_ATTEMPTS,
            write_pacing_bytes: DEFAULT_WRITE_PACING_BYTES,
            relay_url: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Checks values that would make sessions misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::Config`] naming the first bad field.
    pub fn validate(&self) -> WispResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(WispError::Config("connect_timeout must be positive".into()));
        }
        if self.write_pacing_bytes == 0 {
            return Err(WispError::Config("write_pacing_bytes must be positive".into()));
        }
        if self.password_attempts == 0 {
            return Err(WispError::Config("password_attempts must be positive".into()));
        }
        if let Some(url) = &self.relay_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(WispError::Config(format!(
                    "relay_url '{}' is not a ws:// or wss:// URL",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Builds the protocol engine configuration.
    pub fn ssh_config(&self) -> SshClientConfig {
        SshClientConfig {
            strict_host_key_checking: self.strict_host_key_checking,
            known_hosts_file: self.known_hosts_file.clone(),
            keepalive_interval: self.keepalive_interval,
            rekey_bytes_limit: self.rekey_bytes_limit,
            rekey_time_limit: self.rekey_time_limit,
            password_attempts: self.password_attempts,
            ..SshClientConfig::default()
        }
    }

    /// Loads the configured identities. Missing files are skipped; files
    /// that exist but cannot be used are logged and skipped.
    pub fn load_identities(&self) -> Vec<Identity> {
        let mut identities = Vec::new();
        for path in &self.identity_files {
            if !path.exists() {
                debug!(path = %path.display(), "No identity file");
                continue;
            }
            match Identity::from_file(path) {
                Ok(identity) => {
                    debug!(path = %path.display(), "Loaded identity");
                    identities.push(identity);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping identity"),
            }
        }
        identities
    }
}

mod strict_checking {
    use serde::{Deserialize, Deserializer, Serializer};
    use wisp_proto::ssh::StrictHostKeyChecking;

    pub fn serialize<S: Serializer>(
        value: &StrictHostKeyChecking,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<StrictHostKeyChecking, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.filter(|s| *s > 0).map(Duration::from_secs))
    }
}
