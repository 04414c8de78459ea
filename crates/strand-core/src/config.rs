//! Environment-driven configuration for the event subsystem.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of spans coalesced per flushed batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default interval after which a partially-filled batch is flushed.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(1000);

/// Default span retention in days.
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 7;

/// Configuration for the event repository and its flush scheduler.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Maximum number of spans per flushed batch (`EVENTS_BATCH_SIZE`).
    pub batch_size: usize,
    /// Flush interval measured from the oldest un-flushed span
    /// (`EVENTS_BATCH_INTERVAL`, milliseconds).
    pub batch_interval: Duration,
    /// Retention window for persisted spans
    /// (`EVENTS_DEFAULT_LOG_RETENTION`, days).
    pub retention_days: u32,
    /// Broker connection string (`BROKER_URL`), when an external broker is
    /// used instead of the in-process one.
    pub broker_url: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
            broker_url: None,
        }
    }
}

impl EventsConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(batch_size) = env_usize("EVENTS_BATCH_SIZE")? {
            if batch_size == 0 {
                return Err(Error::InvalidInput(
                    "EVENTS_BATCH_SIZE must be greater than zero".to_string(),
                ));
            }
            config.batch_size = batch_size;
        }
        if let Some(interval_ms) = env_u64("EVENTS_BATCH_INTERVAL")? {
            config.batch_interval = Duration::from_millis(interval_ms);
        }
        if let Some(retention) = env_u64("EVENTS_DEFAULT_LOG_RETENTION")? {
            config.retention_days = u32::try_from(retention).map_err(|_| {
                Error::InvalidInput("EVENTS_DEFAULT_LOG_RETENTION is out of range".to_string())
            })?;
        }
        config.broker_url = env_string("BROKER_URL");

        Ok(config)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = EventsConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.batch_interval, DEFAULT_BATCH_INTERVAL);
        assert_eq!(config.retention_days, DEFAULT_LOG_RETENTION_DAYS);
        assert!(config.broker_url.is_none());
    }
}
