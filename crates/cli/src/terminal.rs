//! Local terminal: raw mode, size and resize notifications.

use anyhow::{Context, Result};
use crossterm::terminal;
use std::io::IsTerminal;
use tracing::debug;

/// Size used when the terminal does not report one.
pub const FALLBACK_SIZE: (u32, u32) = (80, 24);

/// Restores cooked mode on drop.
#[derive(Debug)]
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Enters raw mode if stdin is a terminal.
    pub fn enter() -> Result<Self> {
        if !std::io::stdin().is_terminal() {
            debug!("stdin is not a terminal; staying in cooked mode");
            return Ok(Self { active: false });
        }
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { active: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = terminal::disable_raw_mode() {
                debug!(error = %e, "Could not restore terminal mode");
            }
        }
    }
}

/// Returns the terminal size as (columns, rows).
pub fn size() -> (u32, u32) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (u32::from(cols), u32::from(rows)),
        _ => FALLBACK_SIZE,
    }
}

/// Terminal size changes, from SIGWINCH.
#[derive(Debug)]
pub struct Resizes {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Resizes {
    /// Starts listening for size changes.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal =
                signal(SignalKind::window_change()).context("failed to watch SIGWINCH")?;
            Ok(Self { signal })
        }
        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next size change. Never resolves without SIGWINCH.
    pub async fn next(&mut self) -> Option<(u32, u32)> {
        #[cfg(unix)]
        {
            self.signal.recv().await?;
            Some(size())
        }
        #[cfg(not(unix))]
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_is_never_zero() {
        let (cols, rows) = size();
        assert!(cols > 0);
        assert!(rows > 0);
    }
}
