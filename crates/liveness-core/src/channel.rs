use tokio::sync::broadcast;

use crate::types::MonitorEvent;

/// Broadcast event stream type used by async subscribers.
pub type EventStream = broadcast::Receiver<MonitorEvent>;

/// Fan-out of [`MonitorEvent`]s to any number of async subscribers.
#[derive(Clone, Debug)]
pub struct MonitorChannel {
    event_tx: broadcast::Sender<MonitorEvent>,
}

impl MonitorChannel {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted monitor events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.event_tx.send(event);
    }
}
