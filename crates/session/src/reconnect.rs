//! Connection retry with exponential backoff.
//!
//! Only the dial is retried. Handshake failures, authentication failures and
//! host key rejections are returned at once.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use wisp_platform::{WispError, WispResult};

/// Reconnection configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether automatic reconnection is enabled.
    pub enabled: bool,
    /// Maximum number of connection attempts.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    /// Upper bound for any delay.
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables reconnection.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the upper bound for any delay.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }
}

/// Exponential backoff calculator: initial, 2x, 4x ... capped at the maximum.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: ReconnectConfig,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Creates a calculator.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            current_attempt: 0,
        }
    }

    /// Returns the next delay and counts an attempt.
    pub fn next_backoff(&mut self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.current_attempt);
        self.current_attempt += 1;
        self.config
            .initial_backoff
            .saturating_mul(multiplier)
            .min(self.config.max_backoff)
    }

    /// Returns how many delays were handed out.
    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Starts over.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Returns true for failures worth another attempt.
pub fn is_retryable(error: &WispError) -> bool {
    matches!(
        error,
        WispError::ConnectionFailed(_)
            | WispError::ConnectionRefused(_)
            | WispError::HostUnreachable(_)
            | WispError::Io(_)
    )
}

/// Runs a connect operation with retries.
#[derive(Debug)]
pub struct ReconnectHandler {
    config: ReconnectConfig,
    backoff: ExponentialBackoff,
}

impl ReconnectHandler {
    /// Creates a handler.
    pub fn new(config: ReconnectConfig) -> Self {
        let backoff = ExponentialBackoff::new(config);
        Self { config, backoff }
    }

    /// Calls `connect` until it succeeds, fails for good, or runs out of
    /// attempts, sleeping with exponential backoff in between.
    ///
    /// # Errors
    ///
    /// - [`WispError::Config`] if reconnection is disabled
    /// - the first non-retryable error `connect` returns
    /// - [`WispError::ConnectionFailed`] after `max_retries` failed attempts
    pub async fn reconnect_with_backoff<F, Fut, T>(&mut self, mut connect: F) -> WispResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WispResult<T>>,
    {
        if !self.config.enabled {
            return Err(WispError::Config("reconnection is disabled".to_string()));
        }

        self.backoff.reset();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            info!(attempt, max = self.config.max_retries, "Connection attempt");

            let error = match connect().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "Reconnected");
                    }
                    return Ok(value);
                }
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.config.max_retries {
                warn!(attempts = attempt, error = %error, "Giving up");
                return Err(WispError::ConnectionFailed(format!(
                    "failed after {} retries: {}",
                    self.config.max_retries, error
                )));
            }

            let delay = self.backoff.next_backoff();
            warn!(attempt, error = %error, "Connection attempt failed");
            debug!(?delay, "Waiting before retry");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Serializes a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn enabled(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig::new()
            .with_enabled(true)
            .with_max_retries(max_retries)
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_reconnect_config_builder() {
        let config = ReconnectConfig::new()
            .with_enabled(true)
            .with_max_retries(5)
            .with_initial_backoff(Duration::from_secs(2))
            .with_max_backoff(Duration::from_secs(60));

        assert!(config.enabled);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_backoff, Duration::from_secs(2));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_config_serde_in_seconds() {
        let config: ReconnectConfig =
            serde_json::from_str(r#"{"enabled":true,"initial_backoff":2}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.initial_backoff, Duration::from_secs(2));
        assert_eq!(config.max_backoff, Duration::from_secs(30));

        let json = serde_json::to_value(ReconnectConfig::default()).unwrap();
        assert_eq!(json["max_backoff"], 30);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(enabled(5));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.attempt(), 1);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(16));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let config = enabled(10).with_max_backoff(Duration::from_secs(10));
        let mut backoff = ExponentialBackoff::new(config);

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(ReconnectConfig::default());
        backoff.next_backoff();
        backoff.next_backoff();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_handler_success() {
        let mut handler = ReconnectHandler::new(enabled(3));
        let counter = Arc::new(AtomicU32::new(0));

        let result = handler
            .reconnect_with_backoff(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let attempts = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if attempts < 2 {
                        Err(WispError::ConnectionRefused("simulated".to_string()))
                    } else {
                        Ok(attempts)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_handler_all_retries_fail() {
        let mut handler = ReconnectHandler::new(enabled(3));
        let counter = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result: WispResult<()> = handler
            .reconnect_with_backoff(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(WispError::HostUnreachable("always".to_string()))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, WispError::ConnectionFailed(_)));
        assert!(err.to_string().contains("failed after 3 retries"));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        // Two waits: 1 s then 2 s.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let mut handler = ReconnectHandler::new(enabled(3));
        let counter = Arc::new(AtomicU32::new(0));

        let result: WispResult<()> = handler
            .reconnect_with_backoff(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(WispError::HostKeyVerificationFailed("changed".to_string()))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(WispError::HostKeyVerificationFailed(_))
        ));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_reconnect_handler_disabled() {
        let mut handler = ReconnectHandler::new(ReconnectConfig::default());
        let result = handler.reconnect_with_backoff(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(WispError::Config(_))));
    }
}
