//! Reconnect configuration and backoff bookkeeping.
//!
//! This module provides the [`ReconnectConfig`] type and the [`Backoff`]
//! state used by the failover orchestrator's reconnect worker.
//!
//! # Reconnect Strategy
//!
//! - An optional initial delay is applied once, before the very first attempt
//! - After a failed attempt the next delay starts at `reconnect_delay`
//! - With backoff enabled the delay is multiplied after every failed attempt
//!   past the first, capped at `max_reconnect_delay`
//! - The computed delay persists across attempts and is only reset to the
//!   base value once a connection has been recovered
//! - The first connection may use a tighter attempt limit than later cycles

use serde::Deserialize;
use std::time::Duration;

use crate::provider_config::parse_value;
use crate::{ProviderError, Result};

/// Reconnect configuration with exponential backoff.
///
/// Attempt limits are `Option<u32>`: `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the very first attempt (zero disables it).
    pub initial_delay: Duration,

    /// Base delay between attempts.
    pub reconnect_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_reconnect_delay: Duration,

    /// Multiply the delay after each failed attempt.
    pub use_backoff: bool,

    /// Backoff multiplier. Example: 2.0 doubles the delay each time.
    pub backoff_multiplier: f64,

    /// Attempt limit for reconnect cycles after the first connection.
    pub max_reconnect_attempts: Option<u32>,

    /// Attempt limit for the very first connection. `None` falls back to
    /// `max_reconnect_attempts`.
    pub startup_max_reconnect_attempts: Option<u32>,

    /// Warn every N consecutive failed attempts (0 disables).
    pub warn_after_reconnect_attempts: u32,

    /// Shuffle the endpoint order on each pass over the pool.
    pub randomize: bool,
}

impl Default for ReconnectConfig {
    /// - `initial_delay`: 0
    /// - `reconnect_delay`: 10ms
    /// - `max_reconnect_delay`: 30s
    /// - `use_backoff`: true, `backoff_multiplier`: 2.0
    /// - attempt limits: unlimited
    /// - `warn_after_reconnect_attempts`: 10
    fn default() -> Self {
        // ---
        Self {
            initial_delay: Duration::ZERO,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(30),
            use_backoff: true,
            backoff_multiplier: 2.0,
            max_reconnect_attempts: None,
            startup_max_reconnect_attempts: None,
            warn_after_reconnect_attempts: 10,
            randomize: false,
        }
    }
}

impl ReconnectConfig {
    // ---

    /// Attempt limit that applies to the current cycle.
    pub fn attempt_limit(&self, first_connection: bool) -> Option<u32> {
        // ---
        match (first_connection, self.startup_max_reconnect_attempts) {
            (true, Some(startup)) => Some(startup),
            _ => self.max_reconnect_attempts,
        }
    }

    /// Whether a lost connection may be re-established at all.
    pub fn reconnect_allowed(&self, first_connection: bool) -> bool {
        self.attempt_limit(first_connection) != Some(0)
    }

    /// Apply one URI-style option (`failover.maxReconnectAttempts=...`).
    ///
    /// Delays are given in milliseconds; attempt limits accept `-1` for
    /// unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] for unknown keys or unparsable values.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        // ---
        match key {
            "failover.initialReconnectDelay" => self.initial_delay = parse_millis(key, value)?,
            "failover.reconnectDelay" => self.reconnect_delay = parse_millis(key, value)?,
            "failover.maxReconnectDelay" => self.max_reconnect_delay = parse_millis(key, value)?,
            "failover.useReconnectBackOff" => self.use_backoff = parse_value(key, value)?,
            "failover.reconnectBackOffMultiplier" => {
                self.backoff_multiplier = parse_value(key, value)?
            }
            "failover.maxReconnectAttempts" => {
                self.max_reconnect_attempts = parse_limit(key, value)?
            }
            "failover.startupMaxReconnectAttempts" => {
                self.startup_max_reconnect_attempts = parse_limit(key, value)?
            }
            "failover.warnAfterReconnectAttempts" => {
                let warn: i64 = parse_value(key, value)?;
                self.warn_after_reconnect_attempts = u32::try_from(warn.max(0)).unwrap_or(u32::MAX);
            }
            "failover.randomize" => self.randomize = parse_value(key, value)?,
            other => {
                return Err(ProviderError::Config(format!(
                    "unknown failover option: {other}"
                )))
            }
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    // ---
    let millis: u64 = parse_value(key, value)?;
    Ok(Duration::from_millis(millis))
}

fn parse_limit(key: &str, value: &str) -> Result<Option<u32>> {
    // ---
    let limit: i64 = parse_value(key, value)?;
    if limit < 0 {
        return Ok(None);
    }
    u32::try_from(limit)
        .map(Some)
        .map_err(|_| ProviderError::Config(format!("invalid value for {key}: {value}")))
}

/// Attempt counter and lazily computed delay for one reconnect worker.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    attempts: u32,
    next_delay: Option<Duration>,
}

impl Backoff {
    // ---

    /// Attempts made since the last successful recovery.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count a new attempt and return its ordinal.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Whether `limit` forbids another attempt.
    pub fn limit_reached(&self, limit: Option<u32>) -> bool {
        matches!(limit, Some(limit) if self.attempts >= limit)
    }

    /// Whether the periodic warning is due after the current attempt.
    pub fn should_warn(&self, config: &ReconnectConfig) -> bool {
        // ---
        let interval = config.warn_after_reconnect_attempts;
        interval > 0 && self.attempts > 0 && self.attempts % interval == 0
    }

    /// Delay before the next attempt.
    ///
    /// The first call yields the base delay; with backoff enabled every call
    /// after the first failed attempt multiplies the previous delay.
    pub fn next_delay(&mut self, config: &ReconnectConfig) -> Duration {
        // ---
        let mut delay = self.next_delay.unwrap_or(config.reconnect_delay);

        if config.use_backoff && self.attempts > 1 {
            let grown = delay.as_secs_f64() * config.backoff_multiplier;
            delay = Duration::try_from_secs_f64(grown)
                .unwrap_or(config.max_reconnect_delay)
                .min(config.max_reconnect_delay);
        }

        self.next_delay = Some(delay);
        delay
    }

    /// Back to the base delay and zero attempts.
    pub fn reset(&mut self, config: &ReconnectConfig) {
        // ---
        self.attempts = 0;
        self.next_delay = Some(config.reconnect_delay);
    }
}
