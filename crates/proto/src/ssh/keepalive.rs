//! Keep-alive heartbeat.
//!
//! Idle connections are kept open by sending SSH_MSG_IGNORE carrying random
//! bytes. [`Keepalive`] is the timer a session loop selects on; when disabled
//! it never fires.

use crate::ssh::transport::ignore;
use rand::RngCore;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Random bytes carried by each keep-alive.
pub const KEEPALIVE_DATA_LEN: usize = 16;

/// Periodic keep-alive timer.
#[derive(Debug)]
pub struct Keepalive {
    interval: Option<Interval>,
}

impl Keepalive {
    /// Creates a timer firing every `period`. `None` or zero disables it.
    pub fn new(period: Option<Duration>) -> Self {
        let interval = period.filter(|p| !p.is_zero()).map(|period| {
            debug!(?period, "Keep-alive enabled");
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval }
    }

    /// Returns true if the timer fires at all.
    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Waits for the next tick. Pends forever when disabled.
    ///
    /// Cancel safe.
    pub async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Pushes the next tick a full period out, e.g. after other traffic.
    pub fn reset(&mut self) {
        if let Some(interval) = &mut self.interval {
            interval.reset();
        }
    }
}

/// Builds an SSH_MSG_IGNORE with `data_len` random bytes.
///
/// ```rust
/// use wisp_proto::ssh::keepalive::keepalive_message;
///
/// let msg = keepalive_message(32);
/// assert_eq!(msg[0], 2);
/// assert_eq!(msg.len(), 1 + 4 + 32);
/// ```
pub fn keepalive_message(data_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);
    ignore(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::message::MessageType;

    #[test]
    fn test_keepalive_message_format() {
        let msg = keepalive_message(0);
        assert_eq!(msg[0], MessageType::Ignore as u8);
        assert_eq!(msg.len(), 1 + 4);
        assert_eq!(u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]), 0);

        let msg = keepalive_message(KEEPALIVE_DATA_LEN);
        assert_eq!(
            u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]) as usize,
            KEEPALIVE_DATA_LEN
        );
    }

    #[test]
    fn test_disabled_variants() {
        assert!(!Keepalive::new(None).is_enabled());
        assert!(!Keepalive::new(Some(Duration::ZERO)).is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ticks_on_period() {
        let mut keepalive = Keepalive::new(Some(Duration::from_secs(30)));
        assert!(keepalive.is_enabled());

        let start = Instant::now();
        keepalive.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        keepalive.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_fires() {
        let mut keepalive = Keepalive::new(None);
        let fired = tokio::time::timeout(Duration::from_secs(3600), keepalive.tick()).await;
        assert!(fired.is_err());
    }
}
