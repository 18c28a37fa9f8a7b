//! Composition root: wires probe, store, scheduler and validator to timers.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{EventStream, MonitorChannel},
    client::BackendClient,
    config::MonitorConfig,
    error::{BackendError, MonitorError},
    listeners::SubscriptionHandle,
    probe::{HeartbeatProbe, ProbeOutcome},
    scheduler::{RetryScheduler, RetryState},
    session::{SessionCache, SessionValidator},
    store::ConnectionStateStore,
    types::{
        ConnectionState, MonitorEvent, PersistentFailureSignal, Session, SessionInvalidated,
        SessionPhase,
    },
};

#[derive(Debug)]
struct RunningMonitor {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Connection-health and session-continuity service.
///
/// Construct once per application session, call [`start`](Self::start) to
/// arm the heartbeat, watchdog and session timers, and [`stop`](Self::stop)
/// on shutdown.
pub struct ConnectionMonitor {
    config: MonitorConfig,
    store: Arc<ConnectionStateStore>,
    probe: Arc<HeartbeatProbe>,
    scheduler: Arc<RetryScheduler>,
    validator: Arc<SessionValidator>,
    channel: MonitorChannel,
    running: Mutex<Option<RunningMonitor>>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig, client: Arc<dyn BackendClient>, cache: SessionCache) -> Self {
        let channel = MonitorChannel::new(config.event_buffer);
        let store = Arc::new(ConnectionStateStore::new());
        let probe = Arc::new(HeartbeatProbe::new(
            Arc::clone(&client),
            Arc::clone(&store),
            config.probe_timeout,
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&probe),
            &config,
            channel.clone(),
        ));
        let validator = Arc::new(SessionValidator::new(
            client,
            Arc::clone(&store),
            cache,
            config.session_refresh_margin,
            channel.clone(),
        ));

        Self {
            config,
            store,
            probe,
            scheduler,
            validator,
            channel,
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningMonitor>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Arm every timer. Must be called from within a tokio runtime.
    ///
    /// Fails with [`MonitorError::Config`] if the configuration would leave a
    /// timer without a period.
    pub fn start(&self) -> Result<(), MonitorError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        self.config.validate()?;

        self.scheduler.resume();
        let scheduler = Arc::downgrade(&self.scheduler);
        let channel = self.channel.clone();
        self.store.subscribe(move |state: &ConnectionState| {
            channel.emit(MonitorEvent::ConnectionChanged(*state));
            let Some(scheduler) = scheduler.upgrade() else {
                return;
            };
            if state.connected {
                scheduler.on_connected();
            } else {
                scheduler.on_disconnected();
            }
        });

        let stop = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(heartbeat_loop(
                Arc::clone(&self.probe),
                Arc::clone(&self.scheduler),
                self.config.heartbeat_interval,
                stop.child_token(),
            )),
            tokio::spawn(watchdog_loop(
                Arc::clone(&self.probe),
                Arc::clone(&self.scheduler),
                self.config.watchdog_threshold,
                stop.child_token(),
            )),
            tokio::spawn(session_loop(
                Arc::clone(&self.validator),
                self.config.session_check_interval,
                stop.child_token(),
            )),
        ];

        *running = Some(RunningMonitor { stop, tasks });
        info!(
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            session_check_ms = self.config.session_check_interval.as_millis() as u64,
            "connection monitor started"
        );
        Ok(())
    }

    /// Cancel every timer and clear all listeners. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self.lock_running().take();

        self.scheduler.stop();
        self.store.clear_listeners();
        self.validator.clear_listeners();

        let Some(running) = running else {
            trace!("connection monitor already stopped");
            return;
        };

        running.stop.cancel();
        for task in running.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "monitor task ended abnormally");
            }
        }
        info!("connection monitor stopped");
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.store.unsubscribe(handle)
    }

    /// Subscribe to the broadcast event stream.
    pub fn subscribe_events(&self) -> EventStream {
        self.channel.subscribe()
    }

    pub fn current_connection_state(&self) -> ConnectionState {
        self.store.current()
    }

    pub fn retry_state(&self) -> RetryState {
        self.scheduler.retry_state()
    }

    pub async fn trigger_manual_retry(&self) -> ProbeOutcome {
        self.scheduler.trigger_manual_retry().await
    }

    pub fn on_persistent_failure<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PersistentFailureSignal) + Send + Sync + 'static,
    {
        self.scheduler.on_persistent_failure(callback)
    }

    pub fn on_session_invalidated<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&SessionInvalidated) + Send + Sync + 'static,
    {
        self.validator.on_session_invalidated(callback)
    }

    pub fn begin_sign_in(&self) -> Result<(), MonitorError> {
        self.validator.begin_sign_in()
    }

    pub fn complete_sign_in(&self, result: Result<Session, BackendError>) -> Result<(), MonitorError> {
        self.validator.complete_sign_in(result)
    }

    pub fn restore_session(&self) -> Result<Option<Session>, MonitorError> {
        self.validator.restore_session()
    }

    pub async fn sign_out(&self) -> Result<(), MonitorError> {
        self.validator.sign_out().await
    }

    pub fn current_session(&self) -> Option<Session> {
        self.validator.current_session()
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.validator.phase()
    }
}

async fn heartbeat_loop(
    probe: Arc<HeartbeatProbe>,
    scheduler: Arc<RetryScheduler>,
    interval: Duration,
    stop: CancellationToken,
) {
    debug!("heartbeat loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if scheduler.is_engaged() {
            trace!("retry cycle owns probing; heartbeat tick skipped");
            continue;
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = probe.probe() => {}
        }
    }
    debug!("heartbeat loop exiting");
}

async fn watchdog_loop(
    probe: Arc<HeartbeatProbe>,
    scheduler: Arc<RetryScheduler>,
    threshold: Duration,
    stop: CancellationToken,
) {
    debug!("watchdog loop started");
    loop {
        let deadline = probe.last_completed_at() + threshold;
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        if probe.last_completed_at() + threshold > Instant::now() {
            continue;
        }

        if scheduler.is_engaged() || probe.is_in_flight() {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(threshold) => {}
            }
            continue;
        }

        warn!(
            threshold_ms = threshold.as_millis() as u64,
            "no liveness check completed within threshold; forcing probe"
        );
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = probe.probe() => {}
        }
    }
    debug!("watchdog loop exiting");
}

async fn session_loop(validator: Arc<SessionValidator>, interval: Duration, stop: CancellationToken) {
    debug!("session validation loop started");
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let outcome = tokio::select! {
            _ = stop.cancelled() => break,
            outcome = validator.validate_once() => outcome,
        };
        trace!(?outcome, "session validation tick finished");
    }
    debug!("session validation loop exiting");
}
