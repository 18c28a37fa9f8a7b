//! Timing and threshold configuration for the connection monitor.

use std::{env, time::Duration};

use thiserror::Error;

use crate::retry::RetryPolicy;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_WATCHDOG_THRESHOLD_MS: u64 = 30_000;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_RETRY_CAP_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_AUTO_ATTEMPTS: u32 = 5;
const DEFAULT_COOLDOWN_MS: u64 = 60_000;
const DEFAULT_SESSION_CHECK_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MANUAL_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SESSION_REFRESH_MARGIN_MS: u64 = 120_000;
const DEFAULT_EVENT_BUFFER: usize = 64;

/// Runtime configuration for [`crate::ConnectionMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Cadence of the regular liveness probe.
    pub heartbeat_interval: Duration,
    /// Force a probe when no check completed for this long.
    pub watchdog_threshold: Duration,
    /// First automatic reconnection delay.
    pub retry_base_delay: Duration,
    /// Upper bound for any automatic reconnection delay.
    pub retry_cap_delay: Duration,
    /// Automatic attempts per disconnect before cooling down.
    pub max_auto_attempts: u32,
    /// Pause after automatic attempts are exhausted.
    pub cooldown: Duration,
    /// Cadence of session re-validation.
    pub session_check_interval: Duration,
    /// Consecutive manual failures that raise the persistent-failure signal.
    pub manual_failure_threshold: u32,
    /// Deadline wrapped around every liveness request.
    pub probe_timeout: Duration,
    /// Refresh the session token when it expires within this margin.
    pub session_refresh_margin: Duration,
    /// Capacity of the broadcast event channel.
    pub event_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            watchdog_threshold: Duration::from_millis(DEFAULT_WATCHDOG_THRESHOLD_MS),
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_cap_delay: Duration::from_millis(DEFAULT_RETRY_CAP_DELAY_MS),
            max_auto_attempts: DEFAULT_MAX_AUTO_ATTEMPTS,
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            session_check_interval: Duration::from_millis(DEFAULT_SESSION_CHECK_INTERVAL_MS),
            manual_failure_threshold: DEFAULT_MANUAL_FAILURE_THRESHOLD,
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            session_refresh_margin: Duration::from_millis(DEFAULT_SESSION_REFRESH_MARGIN_MS),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl MonitorConfig {
    /// Parse configuration from `LIVENESS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let config = Self {
            heartbeat_interval: parse_millis(
                "LIVENESS_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
                &mut lookup,
            )?,
            watchdog_threshold: parse_millis(
                "LIVENESS_WATCHDOG_THRESHOLD_MS",
                DEFAULT_WATCHDOG_THRESHOLD_MS,
                &mut lookup,
            )?,
            retry_base_delay: parse_millis(
                "LIVENESS_RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
                &mut lookup,
            )?,
            retry_cap_delay: parse_millis(
                "LIVENESS_RETRY_CAP_DELAY_MS",
                DEFAULT_RETRY_CAP_DELAY_MS,
                &mut lookup,
            )?,
            max_auto_attempts: parse_with_default(
                "LIVENESS_MAX_AUTO_ATTEMPTS",
                DEFAULT_MAX_AUTO_ATTEMPTS,
                &mut lookup,
            )?,
            cooldown: parse_millis("LIVENESS_COOLDOWN_MS", DEFAULT_COOLDOWN_MS, &mut lookup)?,
            session_check_interval: parse_millis(
                "LIVENESS_SESSION_CHECK_INTERVAL_MS",
                DEFAULT_SESSION_CHECK_INTERVAL_MS,
                &mut lookup,
            )?,
            manual_failure_threshold: parse_with_default(
                "LIVENESS_MANUAL_FAILURE_THRESHOLD",
                DEFAULT_MANUAL_FAILURE_THRESHOLD,
                &mut lookup,
            )?,
            probe_timeout: parse_millis(
                "LIVENESS_PROBE_TIMEOUT_MS",
                DEFAULT_PROBE_TIMEOUT_MS,
                &mut lookup,
            )?,
            session_refresh_margin: parse_millis(
                "LIVENESS_SESSION_REFRESH_MARGIN_MS",
                DEFAULT_SESSION_REFRESH_MARGIN_MS,
                &mut lookup,
            )?,
            event_buffer: parse_with_default(
                "LIVENESS_EVENT_BUFFER",
                DEFAULT_EVENT_BUFFER,
                &mut lookup,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the monitor spin or never act.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero_durations = [
            ("LIVENESS_HEARTBEAT_INTERVAL_MS", self.heartbeat_interval),
            ("LIVENESS_WATCHDOG_THRESHOLD_MS", self.watchdog_threshold),
            ("LIVENESS_RETRY_BASE_DELAY_MS", self.retry_base_delay),
            ("LIVENESS_SESSION_CHECK_INTERVAL_MS", self.session_check_interval),
            ("LIVENESS_PROBE_TIMEOUT_MS", self.probe_timeout),
        ];
        for (key, value) in non_zero_durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be greater than 0".to_owned(),
                });
            }
        }

        let non_zero_counts = [
            ("LIVENESS_MAX_AUTO_ATTEMPTS", self.max_auto_attempts as usize),
            (
                "LIVENESS_MANUAL_FAILURE_THRESHOLD",
                self.manual_failure_threshold as usize,
            ),
            ("LIVENESS_EVENT_BUFFER", self.event_buffer),
        ];
        for (key, value) in non_zero_counts {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }

        if self.retry_cap_delay < self.retry_base_delay {
            return Err(ConfigError::InvalidValue {
                key: "LIVENESS_RETRY_CAP_DELAY_MS",
                value: self.retry_cap_delay.as_millis().to_string(),
                reason: format!(
                    "must not be below LIVENESS_RETRY_BASE_DELAY_MS ({})",
                    self.retry_base_delay.as_millis()
                ),
            });
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_base_delay.as_millis() as u64,
            self.retry_cap_delay.as_millis() as u64,
        )
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A configuration value could not be parsed or is out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_millis<F>(key: &'static str, default_ms: u64, lookup: &mut F) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_with_default(key, default_ms, lookup).map(Duration::from_millis)
}
