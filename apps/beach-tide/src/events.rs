use tokio::sync::broadcast;

use crate::session::Session;
use crate::sync::ScrollAction;

/// Notifications the engine broadcasts to UI layers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionUpdated(Session),
    OutputApplied {
        session_id: String,
        bytes: usize,
        scroll: ScrollAction,
    },
    Reconciled {
        session_id: String,
        changed: bool,
    },
    SessionRemoved {
        session_id: String,
    },
    SessionError {
        session_id: Option<String>,
        message: String,
    },
    TransportConnected,
    TransportDisconnected,
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::SessionUpdated(_) => "session:updated",
            EngineEvent::OutputApplied { .. } => "session:output-applied",
            EngineEvent::Reconciled { .. } => "session:reconciled",
            EngineEvent::SessionRemoved { .. } => "session:removed",
            EngineEvent::SessionError { .. } => "session:error",
            EngineEvent::TransportConnected => "transport:connected",
            EngineEvent::TransportDisconnected => "transport:disconnected",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            EngineEvent::SessionUpdated(session) => Some(&session.id),
            EngineEvent::OutputApplied { session_id, .. }
            | EngineEvent::Reconciled { session_id, .. }
            | EngineEvent::SessionRemoved { session_id } => Some(session_id),
            EngineEvent::SessionError { session_id, .. } => session_id.as_deref(),
            EngineEvent::TransportConnected | EngineEvent::TransportDisconnected => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishing with no subscribers is fine; the event is dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
