//! Canonical reachability flag with edge-only notification.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use tracing::{debug, info};

use crate::{
    listeners::{ListenerRegistry, SubscriptionHandle},
    types::{ConnectionState, now_ms},
};

#[derive(Default)]
struct StoreState {
    current: ConnectionState,
    pending: VecDeque<ConnectionState>,
    notifying: bool,
}

/// Single source of truth for "is the backend reachable".
///
/// Listeners hear about a change only when `connected` flips. A change raised
/// while a notification pass is running (for example by a listener) is queued
/// and delivered after that pass completes, so passes never nest or interleave.
pub struct ConnectionStateStore {
    state: Mutex<StoreState>,
    listeners: ListenerRegistry<ConnectionState>,
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            listeners: ListenerRegistry::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> ConnectionState {
        self.lock().current
    }

    pub fn report_success(&self) {
        self.report(true);
    }

    pub fn report_failure(&self) {
        self.report(false);
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.listeners.unsubscribe(handle)
    }

    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    fn report(&self, connected: bool) {
        let mut state = self.lock();
        state.current.last_checked_at_ms = Some(now_ms());
        if state.current.connected == connected {
            return;
        }

        state.current.connected = connected;
        info!(connected, "connection state changed");
        let edge = state.current;
        state.pending.push_back(edge);

        if state.notifying {
            debug!(connected, "edge queued behind running notification pass");
            return;
        }
        state.notifying = true;

        loop {
            let Some(edge) = state.pending.pop_front() else {
                state.notifying = false;
                return;
            };
            drop(state);
            self.listeners.notify(&edge);
            state = self.lock();
        }
    }
}
