//! Periodic re-validation of the authenticated session's entitlement.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use session_platform::{CredentialStore, CredentialStoreError, ScopedCredentialStore};
use tracing::{debug, info, warn};

use crate::{
    channel::MonitorChannel,
    client::BackendClient,
    error::{BackendError, BackendErrorKind, LivenessError, MonitorError},
    listeners::{ListenerRegistry, SubscriptionHandle},
    state_machine::SessionStateMachine,
    store::ConnectionStateStore,
    types::{
        AccountStatus, InvalidationReason, MonitorEvent, Session, SessionInvalidated,
        SessionPhase, now_ms,
    },
};

const SESSION_CACHE_ACCOUNT: &str = "session";

/// Credential cache scoped to the application's service name.
pub type SessionCache = ScopedCredentialStore<Arc<dyn CredentialStore>>;

/// Why a validation tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No authenticated session is held.
    NoSession,
    /// The backend is unreachable; inability to check is not invalidation.
    Disconnected,
}

/// Result of one [`SessionValidator::validate_once`] tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Skipped(SkipReason),
    /// Account is still active and validated.
    Valid,
    /// Check could not complete; the next tick tries again.
    Deferred(LivenessError),
    /// Account lost its entitlement; the session was terminated.
    Invalidated(SessionInvalidated),
}

#[derive(Default)]
struct ValidatorState {
    machine: SessionStateMachine,
    session: Option<Session>,
}

/// Holds the session lifecycle and re-confirms entitlement on demand.
///
/// Only connection loss is retried; an account found inactive or unapproved
/// ends the session for good.
pub struct SessionValidator {
    client: Arc<dyn BackendClient>,
    store: Arc<ConnectionStateStore>,
    cache: SessionCache,
    refresh_margin: Duration,
    state: Mutex<ValidatorState>,
    invalidated: ListenerRegistry<SessionInvalidated>,
    channel: MonitorChannel,
}

impl SessionValidator {
    pub fn new(
        client: Arc<dyn BackendClient>,
        store: Arc<ConnectionStateStore>,
        cache: SessionCache,
        refresh_margin: Duration,
        channel: MonitorChannel,
    ) -> Self {
        Self {
            client,
            store,
            cache,
            refresh_margin,
            state: Mutex::new(ValidatorState::default()),
            invalidated: ListenerRegistry::new(),
            channel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ValidatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().machine.phase()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn on_session_invalidated<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&SessionInvalidated) + Send + Sync + 'static,
    {
        self.invalidated.subscribe(callback)
    }

    pub fn remove_session_invalidated_listener(&self, handle: SubscriptionHandle) -> bool {
        self.invalidated.unsubscribe(handle)
    }

    pub fn clear_listeners(&self) {
        self.invalidated.clear();
    }

    pub fn begin_sign_in(&self) -> Result<(), MonitorError> {
        self.lock().machine.begin_sign_in()?;
        debug!("sign-in started");
        Ok(())
    }

    /// Settle a sign-in started with [`begin_sign_in`](Self::begin_sign_in).
    pub fn complete_sign_in(&self, result: Result<Session, BackendError>) -> Result<(), MonitorError> {
        match result {
            Ok(session) => {
                {
                    let mut state = self.lock();
                    state.machine.on_auth_result(true)?;
                    state.session = Some(session.clone());
                }
                info!(user_id = %session.user_id, role = %session.role, "session established");
                self.cache_session(&session);
                Ok(())
            }
            Err(err) => {
                self.lock().machine.on_auth_result(false)?;
                warn!(error = %err, "sign-in failed");
                Err(MonitorError::Backend(err))
            }
        }
    }

    /// Adopt the cached session, if any, without a new sign-in.
    pub fn restore_session(&self) -> Result<Option<Session>, MonitorError> {
        let raw = match self.cache.get(SESSION_CACHE_ACCOUNT) {
            Ok(raw) => raw,
            Err(CredentialStoreError::NotFound) => return Ok(None),
            Err(source) => {
                return Err(MonitorError::SessionCache {
                    operation: "restore_session",
                    source,
                });
            }
        };
        let session = serde_json::from_str::<Session>(&raw)
            .map_err(|err| MonitorError::CorruptSession(err.to_string()))?;

        {
            let mut state = self.lock();
            state.machine.restore()?;
            state.session = Some(session.clone());
        }
        info!(user_id = %session.user_id, "cached session restored");
        Ok(Some(session))
    }

    /// Explicit sign-out requested by the application.
    pub async fn sign_out(&self) -> Result<(), MonitorError> {
        let session = {
            let mut state = self.lock();
            state.machine.sign_out()?;
            state.session.take()
        };

        if let Some(session) = &session {
            if let Err(err) = self.client.sign_out(session).await {
                warn!(error = %err, "backend sign-out failed; clearing local session anyway");
            }
        }
        self.clear_cached_session();
        info!("signed out");
        self.channel.emit(MonitorEvent::SessionSignedOut);
        Ok(())
    }

    /// Run one re-validation tick.
    pub async fn validate_once(&self) -> ValidationOutcome {
        let Some(mut session) = self.authenticated_session() else {
            return ValidationOutcome::Skipped(SkipReason::NoSession);
        };

        if !self.store.current().connected {
            debug!("backend unreachable; skipping session validation tick");
            return ValidationOutcome::Skipped(SkipReason::Disconnected);
        }

        if session.expires_within(now_ms(), self.refresh_margin) {
            match self.client.refresh_session(&session).await {
                Ok(refreshed) => {
                    if !self.replace_session(&session, refreshed.clone()) {
                        return ValidationOutcome::Skipped(SkipReason::NoSession);
                    }
                    debug!(user_id = %refreshed.user_id, "session token refreshed");
                    session = refreshed;
                }
                Err(err) => {
                    let err = LivenessError::AuthRefresh(err);
                    warn!(error = %err, "session refresh failed; retrying next tick");
                    return ValidationOutcome::Deferred(err);
                }
            }
        }

        let status = match self.client.fetch_account_status(&session).await {
            Ok(status) => status,
            Err(err) if err.kind == BackendErrorKind::AccountNotFound => {
                return self
                    .force_sign_out(
                        &session,
                        InvalidationReason::AccountMissing,
                        AccountStatus {
                            active: false,
                            validated: false,
                        },
                    )
                    .await;
            }
            Err(err) => {
                debug!(error = %err, "account status check failed; retrying next tick");
                return ValidationOutcome::Deferred(LivenessError::TransientNetwork(err));
            }
        };

        if let Some(reason) = InvalidationReason::from_status(status) {
            return self.force_sign_out(&session, reason, status).await;
        }

        self.record_status(&session, status);
        self.touch_last_seen(session);
        ValidationOutcome::Valid
    }

    fn authenticated_session(&self) -> Option<Session> {
        let state = self.lock();
        if !state.machine.is_authenticated() {
            return None;
        }
        state.session.clone()
    }

    /// Swap in a refreshed session if `previous` is still the live one.
    fn replace_session(&self, previous: &Session, refreshed: Session) -> bool {
        {
            let mut state = self.lock();
            let still_current = state
                .session
                .as_ref()
                .is_some_and(|current| current.token == previous.token);
            if !still_current {
                return false;
            }
            state.session = Some(refreshed.clone());
        }
        self.cache_session(&refreshed);
        true
    }

    /// Mirror freshly fetched entitlement flags onto the held session.
    fn record_status(&self, checked: &Session, status: AccountStatus) {
        let updated = {
            let mut state = self.lock();
            let Some(current) = state
                .session
                .as_mut()
                .filter(|current| current.token == checked.token)
            else {
                return;
            };
            if current.active == status.active && current.validated == status.validated {
                return;
            }
            current.active = status.active;
            current.validated = status.validated;
            current.clone()
        };
        debug!(user_id = %updated.user_id, "session entitlement flags updated");
        self.cache_session(&updated);
    }

    async fn force_sign_out(
        &self,
        session: &Session,
        reason: InvalidationReason,
        status: AccountStatus,
    ) -> ValidationOutcome {
        {
            let mut state = self.lock();
            let still_current = state
                .session
                .as_ref()
                .is_some_and(|current| current.token == session.token);
            if !still_current || state.machine.invalidate().is_err() {
                return ValidationOutcome::Skipped(SkipReason::NoSession);
            }
            state.session = None;
        }

        let err = LivenessError::AccountInvalid {
            user_id: session.user_id.clone(),
            active: status.active,
            validated: status.validated,
        };
        warn!(error = %err, ?reason, "forcing sign-out");

        self.clear_cached_session();
        if let Err(err) = self.client.sign_out(session).await {
            debug!(error = %err, "backend sign-out after invalidation failed");
        }

        let signal = SessionInvalidated {
            user_id: session.user_id.clone(),
            reason,
        };
        self.invalidated.notify(&signal);
        self.channel
            .emit(MonitorEvent::SessionInvalidated(signal.clone()));
        ValidationOutcome::Invalidated(signal)
    }

    fn touch_last_seen(&self, session: Session) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if let Err(err) = client.touch_last_seen(&session).await {
                warn!(user_id = %session.user_id, error = %err, "failed updating last-seen timestamp");
            }
        });
    }

    fn cache_session(&self, session: &Session) {
        let encoded = match serde_json::to_string(session) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed encoding session for cache");
                return;
            }
        };
        if let Err(err) = self.cache.set(SESSION_CACHE_ACCOUNT, &encoded) {
            warn!(error = %err, "failed caching session");
        }
    }

    fn clear_cached_session(&self) {
        match self.cache.delete(SESSION_CACHE_ACCOUNT) {
            Ok(()) | Err(CredentialStoreError::NotFound) => {}
            Err(err) => warn!(error = %err, "failed clearing cached session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use session_platform::InMemoryCredentialStore;

    use super::*;
    use crate::test_support::{ScriptedClient, network_error, sample_session};

    struct Harness {
        client: Arc<ScriptedClient>,
        store: Arc<ConnectionStateStore>,
        credentials: Arc<InMemoryCredentialStore>,
        validator: SessionValidator,
    }

    fn harness() -> Harness {
        let client = Arc::new(ScriptedClient::new());
        let store = Arc::new(ConnectionStateStore::new());
        let credentials = Arc::new(InMemoryCredentialStore::default());
        let shared: Arc<dyn CredentialStore> = credentials.clone();
        let validator = SessionValidator::new(
            client.clone(),
            Arc::clone(&store),
            ScopedCredentialStore::new(shared, "liveness-test"),
            Duration::from_secs(120),
            MonitorChannel::new(16),
        );
        Harness {
            client,
            store,
            credentials,
            validator,
        }
    }

    fn signed_in() -> Harness {
        let h = harness();
        h.validator.begin_sign_in().expect("begin sign-in");
        h.validator
            .complete_sign_in(Ok(sample_session()))
            .expect("complete sign-in");
        h
    }

    fn cached(h: &Harness) -> Option<String> {
        h.credentials
            .get_credential("liveness-test", SESSION_CACHE_ACCOUNT)
            .ok()
    }

    #[tokio::test]
    async fn skips_without_session() {
        let h = harness();
        assert_eq!(
            h.validator.validate_once().await,
            ValidationOutcome::Skipped(SkipReason::NoSession)
        );
        assert_eq!(h.client.status_calls(), 0);
    }

    #[tokio::test]
    async fn skips_while_disconnected_without_checking() {
        let h = signed_in();
        h.client.push_status(Ok(AccountStatus {
            active: false,
            validated: true,
        }));
        h.store.report_failure();

        assert_eq!(
            h.validator.validate_once().await,
            ValidationOutcome::Skipped(SkipReason::Disconnected)
        );
        assert_eq!(h.client.status_calls(), 0);
        assert_eq!(h.validator.phase(), SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn valid_account_keeps_session_and_touches_last_seen() {
        let h = signed_in();

        assert_eq!(h.validator.validate_once().await, ValidationOutcome::Valid);
        tokio::task::yield_now().await;

        assert_eq!(h.validator.phase(), SessionPhase::Authenticated);
        assert_eq!(h.client.touch_calls(), 1);
        assert!(cached(&h).is_some());
    }

    #[tokio::test]
    async fn valid_tick_records_fetched_flags_on_session() {
        let h = harness();
        let mut pending = sample_session();
        pending.validated = false;
        h.validator.begin_sign_in().expect("begin sign-in");
        h.validator
            .complete_sign_in(Ok(pending))
            .expect("complete sign-in");

        assert_eq!(h.validator.validate_once().await, ValidationOutcome::Valid);

        let held = h.validator.current_session().expect("session held");
        assert!(held.active);
        assert!(held.validated);
        let cached_raw = cached(&h).expect("session cached");
        let cached_session: Session =
            serde_json::from_str(&cached_raw).expect("cached session decodes");
        assert!(cached_session.validated);
    }

    #[tokio::test]
    async fn last_seen_failure_is_not_fatal() {
        let h = signed_in();
        h.client.fail_touch(network_error());

        assert_eq!(h.validator.validate_once().await, ValidationOutcome::Valid);
        tokio::task::yield_now().await;
        assert_eq!(h.validator.phase(), SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn deactivated_account_forces_sign_out_once() {
        let h = signed_in();
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let fired_clone = Arc::clone(&fired);
        h.validator.on_session_invalidated(move |signal| {
            fired_clone.lock().expect("fired lock").push(signal.reason);
        });
        h.client.push_status(Ok(AccountStatus {
            active: false,
            validated: true,
        }));

        let outcome = h.validator.validate_once().await;
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalidated(SessionInvalidated {
                reason: InvalidationReason::Deactivated,
                ..
            })
        ));
        assert_eq!(h.validator.phase(), SessionPhase::Unauthenticated);
        assert_eq!(h.validator.current_session(), None);
        assert_eq!(cached(&h), None);
        assert_eq!(h.client.sign_out_calls(), 1);

        assert_eq!(
            h.validator.validate_once().await,
            ValidationOutcome::Skipped(SkipReason::NoSession)
        );
        assert_eq!(
            *fired.lock().expect("fired lock"),
            vec![InvalidationReason::Deactivated]
        );
        assert!(h.store.current().connected);
    }

    #[tokio::test]
    async fn unapproved_account_is_invalid() {
        let h = signed_in();
        h.client.push_status(Ok(AccountStatus {
            active: true,
            validated: false,
        }));

        let outcome = h.validator.validate_once().await;
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalidated(SessionInvalidated {
                reason: InvalidationReason::Unapproved,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn missing_account_is_invalid() {
        let h = signed_in();
        h.client.push_status(Err(BackendError::new(
            BackendErrorKind::AccountNotFound,
            "account_not_found",
            "no row",
        )));

        let outcome = h.validator.validate_once().await;
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalidated(SessionInvalidated {
                reason: InvalidationReason::AccountMissing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn transient_status_error_defers() {
        let h = signed_in();
        h.client.push_status(Err(network_error()));

        let outcome = h.validator.validate_once().await;
        assert!(matches!(
            outcome,
            ValidationOutcome::Deferred(LivenessError::TransientNetwork(_))
        ));
        assert_eq!(h.validator.phase(), SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn refresh_failure_defers_and_retries_next_tick() {
        let h = harness();
        let mut expiring = sample_session();
        expiring.expires_at_ms = Some(now_ms() + 1_000);
        h.validator.begin_sign_in().expect("begin sign-in");
        h.validator
            .complete_sign_in(Ok(expiring.clone()))
            .expect("complete sign-in");

        h.client.push_refresh(Err(network_error()));
        let outcome = h.validator.validate_once().await;
        assert!(matches!(
            outcome,
            ValidationOutcome::Deferred(LivenessError::AuthRefresh(_))
        ));
        assert_eq!(h.validator.phase(), SessionPhase::Authenticated);
        assert_eq!(h.client.status_calls(), 0);

        let mut refreshed = expiring.clone();
        refreshed.token = "tok-2".into();
        refreshed.expires_at_ms = Some(now_ms() + 3_600_000);
        h.client.push_refresh(Ok(refreshed));

        assert_eq!(h.validator.validate_once().await, ValidationOutcome::Valid);
        assert_eq!(
            h.validator.current_session().map(|s| s.token),
            Some("tok-2".to_owned())
        );
        let cached_raw = cached(&h).expect("refreshed session cached");
        assert!(cached_raw.contains("tok-2"));
    }

    #[tokio::test]
    async fn explicit_sign_out_does_not_signal_invalidation() {
        let h = signed_in();
        let fired = Arc::new(StdMutex::new(0));
        let fired_clone = Arc::clone(&fired);
        h.validator.on_session_invalidated(move |_| {
            *fired_clone.lock().expect("fired lock") += 1;
        });

        h.validator.sign_out().await.expect("sign-out should work");

        assert_eq!(*fired.lock().expect("fired lock"), 0);
        assert_eq!(h.validator.phase(), SessionPhase::Unauthenticated);
        assert_eq!(cached(&h), None);
        assert!(h.validator.sign_out().await.is_err());
    }

    #[test]
    fn failed_sign_in_returns_backend_error() {
        let h = harness();
        h.validator.begin_sign_in().expect("begin sign-in");
        let err = h
            .validator
            .complete_sign_in(Err(BackendError::new(
                BackendErrorKind::Unauthorized,
                "invalid_grant",
                "bad credentials",
            )))
            .expect_err("failed sign-in must surface");
        assert!(matches!(err, MonitorError::Backend(_)));
        assert_eq!(h.validator.phase(), SessionPhase::Unauthenticated);
    }

    #[test]
    fn restores_cached_session() {
        let first = signed_in();
        let raw = cached(&first).expect("session cached after sign-in");

        let second = harness();
        second
            .credentials
            .set_credential("liveness-test", SESSION_CACHE_ACCOUNT, &raw)
            .expect("seed cache");
        let restored = second
            .validator
            .restore_session()
            .expect("restore should work")
            .expect("session should be present");

        assert_eq!(restored, sample_session());
        assert_eq!(second.validator.phase(), SessionPhase::Authenticated);
    }

    #[test]
    fn restore_without_cache_is_none() {
        let h = harness();
        assert_eq!(h.validator.restore_session().expect("restore"), None);
        assert_eq!(h.validator.phase(), SessionPhase::Unauthenticated);
    }

    #[test]
    fn restore_rejects_corrupt_cache() {
        let h = harness();
        h.credentials
            .set_credential("liveness-test", SESSION_CACHE_ACCOUNT, "{oops")
            .expect("seed cache");
        assert!(matches!(
            h.validator.restore_session(),
            Err(MonitorError::CorruptSession(_))
        ));
    }
}
