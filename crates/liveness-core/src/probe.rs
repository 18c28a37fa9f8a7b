//! Liveness probe shared by the heartbeat, watchdog, retry and manual paths.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    client::BackendClient,
    error::{BackendError, LivenessError},
    store::ConnectionStateStore,
};

/// Result of one [`HeartbeatProbe::probe`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The backend answered in time.
    Alive,
    /// The request failed or timed out.
    Unreachable(LivenessError),
    /// Another probe was already in flight; nothing was sent.
    Coalesced,
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Retry hint carried by the failure, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Unreachable(LivenessError::TransientNetwork(err)) => err.retry_after_ms,
            _ => None,
        }
    }
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Issues bounded-latency liveness requests and feeds the state store.
///
/// At most one request is in flight at any time; a call made while one is
/// running returns [`ProbeOutcome::Coalesced`] immediately.
pub struct HeartbeatProbe {
    client: Arc<dyn BackendClient>,
    store: Arc<ConnectionStateStore>,
    timeout: Duration,
    in_flight: AtomicBool,
    last_completed: Mutex<Instant>,
}

impl HeartbeatProbe {
    pub fn new(
        client: Arc<dyn BackendClient>,
        store: Arc<ConnectionStateStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            store,
            timeout,
            in_flight: AtomicBool::new(false),
            last_completed: Mutex::new(Instant::now()),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// When the last probe completed (or when the probe was created).
    pub fn last_completed_at(&self) -> Instant {
        *self
            .last_completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn probe(&self) -> ProbeOutcome {
        // Held through the store report so reports land in probe order.
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            trace!("liveness probe already in flight; coalescing");
            return ProbeOutcome::Coalesced;
        };

        let result = match tokio::time::timeout(self.timeout, self.client.check_alive()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(self.timeout)),
        };
        *self
            .last_completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();

        match result {
            Ok(()) => {
                trace!("liveness probe succeeded");
                self.store.report_success();
                ProbeOutcome::Alive
            }
            Err(err) => {
                debug!(error = %err, "liveness probe failed");
                self.store.report_failure();
                ProbeOutcome::Unreachable(LivenessError::TransientNetwork(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::{
        error::BackendErrorKind,
        test_support::{ScriptedClient, network_error},
        types::ConnectionState,
    };

    fn probe_with(client: Arc<ScriptedClient>) -> (HeartbeatProbe, Arc<ConnectionStateStore>) {
        let store = Arc::new(ConnectionStateStore::new());
        let probe = HeartbeatProbe::new(client, Arc::clone(&store), Duration::from_secs(10));
        (probe, store)
    }

    #[tokio::test]
    async fn success_and_failure_feed_the_store() {
        let client = Arc::new(ScriptedClient::new());
        client.push_alive(Err(network_error()));
        client.push_alive(Ok(()));
        let (probe, store) = probe_with(Arc::clone(&client));

        let outcome = probe.probe().await;
        assert!(matches!(
            outcome,
            ProbeOutcome::Unreachable(LivenessError::TransientNetwork(_))
        ));
        assert!(!store.current().connected);

        assert_eq!(probe.probe().await, ProbeOutcome::Alive);
        assert!(store.current().connected);
        assert_eq!(client.alive_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_probe_is_coalesced() {
        let client = Arc::new(ScriptedClient::new());
        client.set_alive_latency(Duration::from_secs(2));
        let (probe, _store) = probe_with(Arc::clone(&client));
        let probe = Arc::new(probe);

        let first = tokio::spawn({
            let probe = Arc::clone(&probe);
            async move { probe.probe().await }
        });
        tokio::task::yield_now().await;
        assert!(probe.is_in_flight());

        assert_eq!(probe.probe().await, ProbeOutcome::Coalesced);

        let first = first.await.expect("probe task should finish");
        assert_eq!(first, ProbeOutcome::Alive);
        assert!(!probe.is_in_flight());
        assert_eq!(client.alive_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_times_out_as_failure() {
        let client = Arc::new(ScriptedClient::new());
        client.set_alive_latency(Duration::from_secs(60));
        let store = Arc::new(ConnectionStateStore::new());
        let probe = HeartbeatProbe::new(client, Arc::clone(&store), Duration::from_secs(5));

        let outcome = probe.probe().await;
        match outcome {
            ProbeOutcome::Unreachable(LivenessError::TransientNetwork(err)) => {
                assert_eq!(err.kind, BackendErrorKind::Timeout);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!store.current().connected);
        assert!(!probe.is_in_flight());
    }

    #[tokio::test]
    async fn failure_sequence_yields_single_disconnect_edge() {
        let client = Arc::new(ScriptedClient::new());
        for _ in 0..4 {
            client.push_alive(Err(network_error()));
        }
        let (probe, store) = probe_with(client);
        let edges = Arc::new(StdMutex::new(Vec::new()));
        let edges_clone = Arc::clone(&edges);
        store.subscribe(move |state: &ConnectionState| {
            edges_clone.lock().expect("edges lock").push(state.connected);
        });

        for _ in 0..4 {
            probe.probe().await;
        }

        assert_eq!(*edges.lock().expect("edges lock"), vec![false]);
    }

    #[tokio::test]
    async fn state_report_happens_while_probe_is_in_flight() {
        let client = Arc::new(ScriptedClient::new());
        client.push_alive(Err(network_error()));
        let store = Arc::new(ConnectionStateStore::new());
        let probe = Arc::new(HeartbeatProbe::new(
            client,
            Arc::clone(&store),
            Duration::from_secs(10),
        ));
        let observed = Arc::new(StdMutex::new(Vec::new()));
        let observed_clone = Arc::clone(&observed);
        let weak = Arc::downgrade(&probe);
        store.subscribe(move |_state: &ConnectionState| {
            if let Some(probe) = weak.upgrade() {
                observed_clone
                    .lock()
                    .expect("observed lock")
                    .push(probe.is_in_flight());
            }
        });

        probe.probe().await;

        assert_eq!(*observed.lock().expect("observed lock"), vec![true]);
        assert!(!probe.is_in_flight());
    }

    #[test]
    fn exposes_retry_hint_from_failure() {
        let err = network_error().with_retry_after(Duration::from_millis(750));
        let outcome = ProbeOutcome::Unreachable(LivenessError::TransientNetwork(err));
        assert_eq!(outcome.retry_after_ms(), Some(750));
        assert_eq!(ProbeOutcome::Alive.retry_after_ms(), None);
    }
}
