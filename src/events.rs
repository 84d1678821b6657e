//! Typed event channels
//!
//! Each event category has its own broadcast channel. Subscribers are added
//! with the `subscribe_*` methods and removed by dropping the receiver.
//! Emitting is best-effort: with no subscribers the event is discarded.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::manager::ManagerState;
use crate::persona::PersonaId;
use crate::router::RoutingStrategy;
use crate::session::{CallStatus, Direction};
use crate::synthesis::{RequestId, SynthesisResult};

/// Default channel capacity per category
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Routing and call lifecycle events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// Router picked a persona and took one unit of its capacity
    PersonaAssigned {
        caller_id: String,
        persona_id: PersonaId,
        strategy: RoutingStrategy,
        rule_id: Option<String>,
    },
    /// Router gave back one unit of a persona's capacity
    PersonaReleased {
        persona_id: PersonaId,
        current_load: u32,
    },
    /// Routing input was rejected
    RoutingFailed { caller_id: String, reason: String },
    /// A call session was bound to an executive persona
    ExecutiveAssigned {
        session_id: String,
        caller_id: String,
        persona_id: PersonaId,
        direction: Direction,
    },
    /// The matched rule asks for operator approval before answering
    ApprovalRequired {
        session_id: String,
        persona_id: PersonaId,
        notify: Vec<String>,
    },
    /// A session changed status
    SessionStatusChanged {
        session_id: String,
        status: CallStatus,
    },
    /// A session reached a terminal status
    SessionEnded {
        session_id: String,
        persona_id: PersonaId,
        status: CallStatus,
    },
}

/// Synthesis queue events, keyed by request id
#[derive(Debug, Clone)]
pub enum SynthesisEvent {
    /// Request entered the queue at the given position
    Queued { request_id: RequestId, position: usize },
    /// Request finished (possibly from cache or degraded)
    Completed {
        request_id: RequestId,
        result: SynthesisResult,
    },
    /// Request failed on every stage
    Failed { request_id: RequestId, error: String },
}

/// Voice system lifecycle events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// Manager state changed
    StateChanged { from: ManagerState, to: ManagerState },
    /// An initialization or teardown stage failed
    StageFailed { stage: String, error: String },
}

/// Broadcast senders for every event category
#[derive(Debug, Clone)]
pub struct EventBus {
    calls: broadcast::Sender<CallEvent>,
    synthesis: broadcast::Sender<SynthesisEvent>,
    system: broadcast::Sender<SystemEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given per-category capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (calls, _) = broadcast::channel(capacity);
        let (synthesis, _) = broadcast::channel(capacity);
        let (system, _) = broadcast::channel(capacity);
        Self {
            calls,
            synthesis,
            system,
        }
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    /// Subscribe to synthesis events
    #[must_use]
    pub fn subscribe_synthesis(&self) -> broadcast::Receiver<SynthesisEvent> {
        self.synthesis.subscribe()
    }

    /// Subscribe to system events
    #[must_use]
    pub fn subscribe_system(&self) -> broadcast::Receiver<SystemEvent> {
        self.system.subscribe()
    }

    /// Emit a call event
    pub fn emit_call(&self, event: CallEvent) {
        let _ = self.calls.send(event);
    }

    /// Emit a synthesis event
    pub fn emit_synthesis(&self, event: SynthesisEvent) {
        let _ = self.synthesis.send(event);
    }

    /// Emit a system event
    pub fn emit_system(&self, event: SystemEvent) {
        let _ = self.system.send(event);
    }
}
