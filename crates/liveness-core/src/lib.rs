//! Connection health and session continuity for clients of a hosted backend.
//!
//! This crate tracks backend reachability, drives reconnection with capped
//! backoff, and periodically re-confirms that the signed-in account is still
//! entitled to its session.

/// Broadcast channel for monitor events.
pub mod channel;
/// Backend operations the monitor depends on.
pub mod client;
/// Timing and threshold configuration.
pub mod config;
/// Backend and liveness error taxonomy.
pub mod error;
/// Snapshot-then-notify listener registry.
pub mod listeners;
/// Composition root owning timers and lifecycle.
pub mod monitor;
/// Single-flight liveness probe.
pub mod probe;
/// Backoff policy used by the reconnection cycle.
pub mod retry;
/// Automatic and manual reconnection.
pub mod scheduler;
/// Session re-validation.
pub mod session;
/// Session lifecycle state machine.
pub mod state_machine;
/// Authoritative connection state with edge-only notifications.
pub mod store;
/// Shared value types and events.
pub mod types;

#[cfg(test)]
mod test_support;

pub use channel::{EventStream, MonitorChannel};
pub use client::BackendClient;
pub use config::{ConfigError, MonitorConfig};
pub use error::{BackendError, BackendErrorKind, LivenessError, MonitorError, classify_http_status};
pub use listeners::{ListenerRegistry, SubscriptionHandle};
pub use monitor::ConnectionMonitor;
pub use probe::{HeartbeatProbe, ProbeOutcome};
pub use retry::RetryPolicy;
pub use scheduler::{RetryScheduler, RetryState};
pub use session::{SessionCache, SessionValidator, SkipReason, ValidationOutcome};
pub use state_machine::SessionStateMachine;
pub use store::ConnectionStateStore;
pub use types::{
    AccountStatus, ConnectionState, InvalidationReason, MonitorEvent, PersistentFailureSignal,
    Session, SessionInvalidated, SessionPhase,
};
