use std::time::Duration;

use serde::{Deserialize, Serialize};
use session_platform::CredentialStoreError;
use thiserror::Error;

use crate::{config::ConfigError, types::SessionPhase};

/// Structured failure kind reported by a [`crate::BackendClient`].
///
/// Classification happens on this kind, never on the human-readable message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Transport failure (DNS, connect, reset) before a response arrived.
    Network,
    /// The request did not complete within its deadline.
    Timeout,
    /// Credentials were rejected.
    Unauthorized,
    /// The account row for the session user no longer exists.
    AccountNotFound,
    /// Throttled by the backend.
    RateLimited,
    /// Backend answered with a server-side failure.
    Server,
    /// Request was malformed or the client is misconfigured.
    Config,
    /// Response body could not be decoded.
    Serialization,
    /// Unexpected adapter failure.
    Internal,
}

/// Error payload returned by backend-client operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error kind.
    pub kind: BackendErrorKind,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(kind: BackendErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            BackendErrorKind::Timeout,
            "request_timeout",
            format!("request did not complete within {}ms", after.as_millis()),
        )
    }
}

/// Map HTTP status codes to backend error kinds.
pub fn classify_http_status(status: u16) -> BackendErrorKind {
    match status {
        401 | 403 => BackendErrorKind::Unauthorized,
        408 => BackendErrorKind::Timeout,
        429 => BackendErrorKind::RateLimited,
        400..=499 => BackendErrorKind::Config,
        500..=599 => BackendErrorKind::Server,
        _ => BackendErrorKind::Internal,
    }
}

/// Failures produced by the liveness and session-continuity components.
///
/// None of these escape as panics; each is converted into a state transition
/// or a one-shot signal at the component that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LivenessError {
    /// One liveness probe failed. Recovered by the retry schedule.
    #[error("liveness probe failed: {0}")]
    TransientNetwork(BackendError),
    /// Automatic reconnection attempts are exhausted; cooldown follows.
    #[error("automatic reconnection gave up after {attempts} attempts")]
    MaxAttemptsExceeded { attempts: u32 },
    /// Manual retries kept failing; the caller decides what to do next.
    #[error("{consecutive_failures} consecutive manual retries failed")]
    PersistentFailure { consecutive_failures: u32 },
    /// Session account is deactivated or unapproved. Fatal to the session.
    #[error("account {user_id} is no longer entitled (active={active}, validated={validated})")]
    AccountInvalid {
        user_id: String,
        active: bool,
        validated: bool,
    },
    /// Token refresh failed during a validation tick. Retried next tick.
    #[error("session refresh failed: {0}")]
    AuthRefresh(BackendError),
}

impl LivenessError {
    /// Whether a later tick or attempt may clear the condition on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::MaxAttemptsExceeded { .. } | Self::AuthRefresh(_)
        )
    }
}

/// Errors returned to callers of the monitor's command surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot run '{action}' while session is {phase:?}")]
    InvalidSessionTransition { phase: SessionPhase, action: String },
    #[error("session cache failure during {operation}: {source}")]
    SessionCache {
        operation: &'static str,
        #[source]
        source: CredentialStoreError,
    },
    #[error("cached session is unreadable: {0}")]
    CorruptSession(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl MonitorError {
    pub fn invalid_transition(phase: SessionPhase, action: impl Into<String>) -> Self {
        Self::InvalidSessionTransition {
            phase,
            action: action.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_kinds() {
        assert_eq!(classify_http_status(401), BackendErrorKind::Unauthorized);
        assert_eq!(classify_http_status(403), BackendErrorKind::Unauthorized);
        assert_eq!(classify_http_status(408), BackendErrorKind::Timeout);
        assert_eq!(classify_http_status(429), BackendErrorKind::RateLimited);
        assert_eq!(classify_http_status(422), BackendErrorKind::Config);
        assert_eq!(classify_http_status(503), BackendErrorKind::Server);
        assert_eq!(classify_http_status(700), BackendErrorKind::Internal);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = BackendError::new(BackendErrorKind::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn only_session_and_manual_failures_are_unrecoverable() {
        let transient = LivenessError::TransientNetwork(BackendError::timeout(
            Duration::from_secs(10),
        ));
        assert!(transient.is_recoverable());
        assert!(LivenessError::MaxAttemptsExceeded { attempts: 5 }.is_recoverable());
        assert!(
            !LivenessError::PersistentFailure {
                consecutive_failures: 3
            }
            .is_recoverable()
        );
        assert!(
            !LivenessError::AccountInvalid {
                user_id: "u-1".into(),
                active: false,
                validated: true,
            }
            .is_recoverable()
        );
    }

    #[test]
    fn formats_invalid_transition() {
        let err = MonitorError::invalid_transition(SessionPhase::Unauthenticated, "complete_sign_in");
        assert_eq!(
            err.to_string(),
            "cannot run 'complete_sign_in' while session is Unauthenticated"
        );
    }
}
