use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, LivenessError};

/// Snapshot of backend reachability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionState {
    /// Whether the last completed liveness check succeeded.
    pub connected: bool,
    /// Completion time of the last liveness check, in milliseconds since Unix epoch.
    ///
    /// `None` until the first check completes.
    pub last_checked_at_ms: Option<u64>,
}

impl Default for ConnectionState {
    /// The backend is assumed reachable until a check proves otherwise.
    fn default() -> Self {
        Self {
            connected: true,
            last_checked_at_ms: None,
        }
    }
}

/// Authenticated session as handed over by the auth layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Bearer access token.
    pub token: String,
    /// Refresh token, when the backend issued one.
    pub refresh_token: Option<String>,
    /// Account identifier.
    pub user_id: String,
    /// Application role of the account.
    pub role: String,
    /// Account `active` flag as last seen.
    pub active: bool,
    /// Account `validated` (approved) flag as last seen.
    pub validated: bool,
    /// Token expiry in milliseconds since Unix epoch.
    pub expires_at_ms: Option<u64>,
}

impl Session {
    /// Whether the token expires within `margin` of `now_ms`.
    pub fn expires_within(&self, now_ms: u64, margin: Duration) -> bool {
        match self.expires_at_ms {
            Some(expires_at_ms) => expires_at_ms <= now_ms.saturating_add(margin.as_millis() as u64),
            None => false,
        }
    }
}

/// Entitlement flags fetched for the session account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountStatus {
    pub active: bool,
    pub validated: bool,
}

impl AccountStatus {
    pub fn is_entitled(&self) -> bool {
        self.active && self.validated
    }
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session is held.
    Unauthenticated,
    /// A sign-in flow is running.
    Authenticating,
    /// A session is held and considered valid.
    Authenticated,
}

/// Why a session was forcibly terminated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Account `active` flag is false.
    Deactivated,
    /// Account `validated` flag is false.
    Unapproved,
    /// Account row no longer exists.
    AccountMissing,
}

impl InvalidationReason {
    pub fn from_status(status: AccountStatus) -> Option<Self> {
        if !status.active {
            Some(Self::Deactivated)
        } else if !status.validated {
            Some(Self::Unapproved)
        } else {
            None
        }
    }
}

/// One-shot signal raised after repeated manual retry failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentFailureSignal {
    /// Length of the failure streak when the signal fired.
    pub consecutive_failures: u32,
    /// Error from the failure that crossed the threshold.
    pub last_error: BackendError,
}

impl PersistentFailureSignal {
    /// The taxonomy error this signal reports.
    pub fn error(&self) -> LivenessError {
        LivenessError::PersistentFailure {
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// One-shot signal raised when the validator forces a sign-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInvalidated {
    pub user_id: String,
    pub reason: InvalidationReason,
}

/// Events broadcast to async consumers of the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Reachability flipped.
    ConnectionChanged(ConnectionState),
    /// An automatic reconnection attempt was scheduled.
    RetryScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt runs.
        delay: Duration,
    },
    /// Automatic attempts are exhausted and paused for `duration`.
    CooldownStarted { attempts: u32, duration: Duration },
    /// Manual retries failed repeatedly.
    PersistentFailure(PersistentFailureSignal),
    /// Session forcibly terminated after failed re-validation.
    SessionInvalidated(SessionInvalidated),
    /// Session ended by explicit sign-out.
    SessionSignedOut,
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_at_ms: Option<u64>) -> Session {
        Session {
            token: "tok".into(),
            refresh_token: Some("refresh".into()),
            user_id: "u-1".into(),
            role: "admin".into(),
            active: true,
            validated: true,
            expires_at_ms,
        }
    }

    #[test]
    fn connection_starts_optimistic() {
        let state = ConnectionState::default();
        assert!(state.connected);
        assert_eq!(state.last_checked_at_ms, None);
    }

    #[test]
    fn expiry_margin_is_inclusive() {
        let s = session(Some(10_000));
        assert!(s.expires_within(9_000, Duration::from_millis(1_000)));
        assert!(!s.expires_within(8_999, Duration::from_millis(1_000)));
        assert!(!session(None).expires_within(u64::MAX, Duration::from_secs(60)));
    }

    #[test]
    fn persistent_failure_signal_maps_to_unrecoverable_error() {
        let signal = PersistentFailureSignal {
            consecutive_failures: 3,
            last_error: BackendError::timeout(Duration::from_secs(10)),
        };
        let err = signal.error();
        assert_eq!(
            err,
            LivenessError::PersistentFailure {
                consecutive_failures: 3
            }
        );
        assert!(!err.is_recoverable());
    }

    #[test]
    fn invalidation_reason_prefers_deactivation() {
        assert_eq!(
            InvalidationReason::from_status(AccountStatus {
                active: false,
                validated: false
            }),
            Some(InvalidationReason::Deactivated)
        );
        assert_eq!(
            InvalidationReason::from_status(AccountStatus {
                active: true,
                validated: false
            }),
            Some(InvalidationReason::Unapproved)
        );
        assert_eq!(
            InvalidationReason::from_status(AccountStatus {
                active: true,
                validated: true
            }),
            None
        );
    }
}
