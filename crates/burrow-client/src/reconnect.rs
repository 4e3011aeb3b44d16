//! Backoff between establisher restarts

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the delay
    pub max_backoff: Duration,
    /// Growth factor applied after every wait
    pub multiplier: f64,
    /// Consecutive failed attempts allowed (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),

    #[error("reconnection cancelled")]
    Cancelled,
}

/// Exponential backoff for one establisher slot
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current backoff, then grow it
    ///
    /// Returns early with `Cancelled` when `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_backoff, self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = sleep(self.current_backoff) => {}
        }

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Forget past failures after a session that carried traffic
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
