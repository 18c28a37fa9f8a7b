//! Scripted backend double shared by unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    client::BackendClient,
    error::{BackendError, BackendErrorKind},
    types::{AccountStatus, Session},
};

pub(crate) fn network_error() -> BackendError {
    BackendError::new(BackendErrorKind::Network, "connect_failed", "connection refused")
}

pub(crate) fn sample_session() -> Session {
    Session {
        token: "tok".into(),
        refresh_token: Some("refresh".into()),
        user_id: "u-1".into(),
        role: "admin".into(),
        active: true,
        validated: true,
        expires_at_ms: Some(4_102_444_800_000),
    }
}

/// Replays queued results; falls back to success once a queue is drained.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    alive: Mutex<VecDeque<Result<(), BackendError>>>,
    alive_always: Mutex<Option<BackendError>>,
    alive_latency: Mutex<Duration>,
    status: Mutex<VecDeque<Result<AccountStatus, BackendError>>>,
    refresh: Mutex<VecDeque<Result<Session, BackendError>>>,
    touch_failure: Mutex<Option<BackendError>>,
    alive_calls: AtomicUsize,
    status_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    touch_calls: AtomicUsize,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_alive(&self, result: Result<(), BackendError>) {
        self.alive.lock().expect("alive lock").push_back(result);
    }

    pub(crate) fn fail_alive_always(&self, err: BackendError) {
        *self.alive_always.lock().expect("alive lock") = Some(err);
    }

    pub(crate) fn set_alive_latency(&self, latency: Duration) {
        *self.alive_latency.lock().expect("latency lock") = latency;
    }

    pub(crate) fn push_status(&self, result: Result<AccountStatus, BackendError>) {
        self.status.lock().expect("status lock").push_back(result);
    }

    pub(crate) fn push_refresh(&self, result: Result<Session, BackendError>) {
        self.refresh.lock().expect("refresh lock").push_back(result);
    }

    pub(crate) fn fail_touch(&self, err: BackendError) {
        *self.touch_failure.lock().expect("touch lock") = Some(err);
    }

    pub(crate) fn alive_calls(&self) -> usize {
        self.alive_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn touch_calls(&self) -> usize {
        self.touch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendClient for ScriptedClient {
    async fn check_alive(&self) -> Result<(), BackendError> {
        self.alive_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.alive_latency.lock().expect("latency lock");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.alive_always.lock().expect("alive lock").clone() {
            return Err(err);
        }
        self.alive
            .lock()
            .expect("alive lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn fetch_account_status(&self, _session: &Session) -> Result<AccountStatus, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status
            .lock()
            .expect("status lock")
            .pop_front()
            .unwrap_or(Ok(AccountStatus {
                active: true,
                validated: true,
            }))
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, BackendError> {
        self.refresh
            .lock()
            .expect("refresh lock")
            .pop_front()
            .unwrap_or_else(|| Ok(session.clone()))
    }

    async fn sign_out(&self, _session: &Session) -> Result<(), BackendError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn touch_last_seen(&self, _session: &Session) -> Result<(), BackendError> {
        self.touch_calls.fetch_add(1, Ordering::SeqCst);
        match self.touch_failure.lock().expect("touch lock").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
