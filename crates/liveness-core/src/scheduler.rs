//! Reconnection cadence after a disconnect edge, plus the manual retry path.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::{SeedableRng, rngs::StdRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::MonitorChannel,
    config::MonitorConfig,
    error::{BackendError, BackendErrorKind, LivenessError},
    listeners::{ListenerRegistry, SubscriptionHandle},
    probe::{HeartbeatProbe, ProbeOutcome},
    retry::RetryPolicy,
    types::{MonitorEvent, PersistentFailureSignal},
};

/// Observable progress of the automatic reconnection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Automatic attempts made in the current cycle.
    pub attempt_count: u32,
    /// Delay chosen for the pending attempt, if one is scheduled.
    pub next_delay: Option<Duration>,
    /// Attempts allowed before cooling down.
    pub max_attempts: u32,
    /// End of the current cooldown, if cooling down.
    pub cooldown_until: Option<Instant>,
}

impl RetryState {
    fn idle(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            next_delay: None,
            max_attempts,
            cooldown_until: None,
        }
    }
}

#[derive(Debug, Default)]
struct ManualStreak {
    consecutive_failures: u32,
    signalled: bool,
}

#[derive(Debug)]
struct SchedulerState {
    retry: RetryState,
    run: Option<CancellationToken>,
    generation: u64,
    manual: ManualStreak,
    stopped: bool,
}

/// Owns reconnection attempts while the backend is unreachable.
///
/// A disconnect edge starts one cycle of up to `max_attempts` backoff-spaced
/// probes. Exhausting the cycle enters a cooldown with no automatic probes;
/// when it elapses the counter resets and the next disconnect edge arms a new
/// cycle. Any success cancels the cycle.
pub struct RetryScheduler {
    probe: Arc<HeartbeatProbe>,
    policy: RetryPolicy,
    max_attempts: u32,
    cooldown: Duration,
    manual_failure_threshold: u32,
    state: Mutex<SchedulerState>,
    rng: Mutex<StdRng>,
    persistent_failure: ListenerRegistry<PersistentFailureSignal>,
    channel: MonitorChannel,
}

impl RetryScheduler {
    pub fn new(probe: Arc<HeartbeatProbe>, config: &MonitorConfig, channel: MonitorChannel) -> Self {
        Self::with_policy(probe, config.retry_policy(), config, channel)
    }

    pub fn with_policy(
        probe: Arc<HeartbeatProbe>,
        policy: RetryPolicy,
        config: &MonitorConfig,
        channel: MonitorChannel,
    ) -> Self {
        Self {
            probe,
            policy,
            max_attempts: config.max_auto_attempts,
            cooldown: config.cooldown,
            manual_failure_threshold: config.manual_failure_threshold,
            state: Mutex::new(SchedulerState {
                retry: RetryState::idle(config.max_auto_attempts),
                run: None,
                generation: 0,
                manual: ManualStreak::default(),
                stopped: false,
            }),
            rng: Mutex::new(StdRng::from_entropy()),
            persistent_failure: ListenerRegistry::new(),
            channel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn retry_state(&self) -> RetryState {
        self.lock().retry
    }

    /// Whether a retry cycle or its cooldown currently owns probing.
    pub fn is_engaged(&self) -> bool {
        self.lock().run.is_some()
    }

    pub fn on_persistent_failure<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PersistentFailureSignal) + Send + Sync + 'static,
    {
        self.persistent_failure.subscribe(callback)
    }

    pub fn remove_persistent_failure_listener(&self, handle: SubscriptionHandle) -> bool {
        self.persistent_failure.unsubscribe(handle)
    }

    /// React to a disconnect edge by arming a retry cycle.
    pub fn on_disconnected(self: &Arc<Self>) {
        let (stop, generation) = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            if state.run.is_some() {
                debug!("retry cycle already active; ignoring disconnect edge");
                return;
            }
            state.generation += 1;
            state.retry = RetryState::idle(self.max_attempts);
            let stop = CancellationToken::new();
            state.run = Some(stop.clone());
            (stop, state.generation)
        };

        info!(max_attempts = self.max_attempts, "backend unreachable; starting retry cycle");
        tokio::spawn(Arc::clone(self).run_cycle(stop, generation));
    }

    /// React to a reconnect edge: cancel pending attempts and reset counters.
    pub fn on_connected(&self) {
        let mut state = self.lock();
        if let Some(stop) = state.run.take() {
            stop.cancel();
            info!(
                attempts = state.retry.attempt_count,
                "backend reachable again; retry cycle cancelled"
            );
        }
        state.generation += 1;
        state.retry = RetryState::idle(self.max_attempts);
        state.manual = ManualStreak::default();
    }

    /// Cancel any pending attempt or cooldown and refuse new cycles.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        if let Some(stop) = state.run.take() {
            stop.cancel();
        }
        state.generation += 1;
        state.retry = RetryState::idle(self.max_attempts);
        drop(state);
        self.persistent_failure.clear();
    }

    /// Allow cycles again after [`stop`](Self::stop).
    pub fn resume(&self) {
        self.lock().stopped = false;
    }

    /// Probe immediately, outside the automatic cadence.
    ///
    /// Failures count toward a manual streak; crossing the threshold raises
    /// the persistent-failure signal once per streak. A call made while a
    /// probe is in flight is coalesced and does not count.
    pub async fn trigger_manual_retry(&self) -> ProbeOutcome {
        debug!("manual retry requested");
        let outcome = self.probe.probe().await;

        match &outcome {
            ProbeOutcome::Coalesced => {
                debug!("manual retry coalesced with in-flight probe");
            }
            ProbeOutcome::Alive => {
                self.lock().manual = ManualStreak::default();
            }
            ProbeOutcome::Unreachable(err) => {
                let signal = {
                    let mut state = self.lock();
                    state.manual.consecutive_failures += 1;
                    let failures = state.manual.consecutive_failures;
                    debug!(failures, "manual retry failed");
                    if failures >= self.manual_failure_threshold && !state.manual.signalled {
                        state.manual.signalled = true;
                        Some(PersistentFailureSignal {
                            consecutive_failures: failures,
                            last_error: match err {
                                LivenessError::TransientNetwork(inner) => inner.clone(),
                                other => BackendError::new(
                                    BackendErrorKind::Internal,
                                    "unexpected_probe_error",
                                    other.to_string(),
                                ),
                            },
                        })
                    } else {
                        None
                    }
                };

                if let Some(signal) = signal {
                    warn!(
                        error = %signal.error(),
                        last_error = %signal.last_error,
                        "manual retries keep failing; raising persistent failure"
                    );
                    self.persistent_failure.notify(&signal);
                    self.channel.emit(MonitorEvent::PersistentFailure(signal));
                }
            }
        }

        outcome
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    async fn run_cycle(self: Arc<Self>, stop: CancellationToken, generation: u64) {
        let mut retry_hint_ms = None;

        loop {
            let (attempt, delay) = {
                let mut state = self.lock();
                if state.generation != generation {
                    return;
                }
                state.retry.attempt_count += 1;
                let attempt = state.retry.attempt_count;
                let delay = {
                    let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                    self.policy
                        .delay_for_attempt(attempt, retry_hint_ms, &mut *rng)
                };
                state.retry.next_delay = Some(delay);
                (attempt, delay)
            };

            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnection attempt scheduled");
            self.channel
                .emit(MonitorEvent::RetryScheduled { attempt, delay });

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                _ = stop.cancelled() => return,
                outcome = self.probe.probe() => outcome,
            };

            match outcome {
                ProbeOutcome::Alive => {
                    debug!(attempt, "reconnection attempt succeeded");
                    self.finish_cycle(generation);
                    return;
                }
                ProbeOutcome::Coalesced => {
                    let mut state = self.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.retry.attempt_count = state.retry.attempt_count.saturating_sub(1);
                    retry_hint_ms = None;
                }
                ProbeOutcome::Unreachable(_) if attempt >= self.max_attempts => {
                    self.cool_down(&stop, generation).await;
                    return;
                }
                ProbeOutcome::Unreachable(err) => {
                    debug!(attempt, error = %err, "reconnection attempt failed");
                    retry_hint_ms = match &err {
                        LivenessError::TransientNetwork(inner) => inner.retry_after_ms,
                        _ => None,
                    };
                }
            }
        }
    }

    async fn cool_down(&self, stop: &CancellationToken, generation: u64) {
        let until = Instant::now() + self.cooldown;
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.retry.next_delay = None;
            state.retry.cooldown_until = Some(until);
        }

        let exhausted = LivenessError::MaxAttemptsExceeded {
            attempts: self.max_attempts,
        };
        warn!(
            error = %exhausted,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "pausing automatic reconnection"
        );
        self.channel.emit(MonitorEvent::CooldownStarted {
            attempts: self.max_attempts,
            duration: self.cooldown,
        });

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep_until(until) => {}
        }

        if self.is_current(generation) {
            info!("cooldown elapsed; next disconnect edge re-arms automatic retries");
        }
        self.finish_cycle(generation);
    }

    fn finish_cycle(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.run = None;
        state.retry = RetryState::idle(self.max_attempts);
    }
}
