//! State-change event notifications
//!
//! The orchestrator publishes every state transition onto a broadcast
//! channel so dashboards and CLIs can follow the lifecycle without
//! polling. Delivery is at-least-once per transition; subscribers must
//! tolerate duplicate notifications of the same state and may lag (the
//! channel drops the oldest events for slow consumers).

use tokio::sync::broadcast;
use tracing::debug;

use crate::orchestrator::ConnectionState;

/// One lifecycle transition
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Present when the transition was caused by a failure
    pub error: Option<String>,
}

/// Broadcast hub for lifecycle events
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Publish a transition. Send failures just mean nobody is listening.
    pub fn publish(&self, previous: ConnectionState, current: ConnectionState, error: Option<String>) {
        let event = StateEvent { previous, current, error };
        debug!("State transition: {:?} -> {:?}", event.previous, event.current);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
