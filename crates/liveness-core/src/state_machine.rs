use crate::{error::MonitorError, types::SessionPhase};

/// Session lifecycle transitions.
///
/// `Unauthenticated → Authenticating → Authenticated`, and back to
/// `Unauthenticated` on sign-out or forced invalidation.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
        }
    }
}

impl SessionStateMachine {
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }

    pub fn begin_sign_in(&mut self) -> Result<SessionPhase, MonitorError> {
        self.transition_from_state(
            SessionPhase::Unauthenticated,
            SessionPhase::Authenticating,
            "begin_sign_in",
        )
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<SessionPhase, MonitorError> {
        let next = if success {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        };
        self.transition_from_state(SessionPhase::Authenticating, next, "on_auth_result")
    }

    /// Adopt a previously cached session without a new sign-in flow.
    pub fn restore(&mut self) -> Result<SessionPhase, MonitorError> {
        self.transition_from_state(
            SessionPhase::Unauthenticated,
            SessionPhase::Authenticated,
            "restore_session",
        )
    }

    pub fn sign_out(&mut self) -> Result<SessionPhase, MonitorError> {
        self.transition_from_any_of(
            &[SessionPhase::Authenticating, SessionPhase::Authenticated],
            SessionPhase::Unauthenticated,
            "sign_out",
        )
    }

    /// Forced termination after failed re-validation. Only valid while authenticated.
    pub fn invalidate(&mut self) -> Result<SessionPhase, MonitorError> {
        self.transition_from_state(
            SessionPhase::Authenticated,
            SessionPhase::Unauthenticated,
            "invalidate",
        )
    }

    fn transition_from_state(
        &mut self,
        expected: SessionPhase,
        next: SessionPhase,
        action: &str,
    ) -> Result<SessionPhase, MonitorError> {
        if self.phase != expected {
            return Err(MonitorError::invalid_transition(self.phase, action));
        }
        self.phase = next;
        Ok(next)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SessionPhase],
        next: SessionPhase,
        action: &str,
    ) -> Result<SessionPhase, MonitorError> {
        if !expected.contains(&self.phase) {
            return Err(MonitorError::invalid_transition(self.phase, action));
        }
        self.phase = next;
        Ok(next)
    }
}
