//! Reconnecting event channel between the client and the session host.
//!
//! Frames are JSON envelopes `{ "event": ..., "payload": ... }`. Inbound
//! frames are fanned out on a [`transport_bus::LocalBus`] keyed by event
//! name; connection state changes are published on the same bus under
//! [`crate::protocol::events::CONNECTED`],
//! [`crate::protocol::events::DISCONNECTED`] and
//! [`crate::protocol::events::RECONNECT_FAILED`].

mod backoff;
pub mod memory;
mod queue;
pub mod websocket;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};
use transport_bus::{BusError, BusMessage, Subscription};

use crate::protocol::Envelope;
use crate::task::TaskGuard;

pub use backoff::ReconnectPolicy;
pub use memory::{memory_pair, MemoryPeer, MemoryTransport, PeerHandle};
pub use queue::OutboundQueue;
pub use websocket::{WebSocketConfig, WebSocketTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("host rejected credentials: {0}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::Memory => f.write_str("memory"),
        }
    }
}

/// Result of handing a frame to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Handed to the live connection.
    Sent,
    /// Held until the next successful reconnect.
    Queued,
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Opens the connection. Once connected the transport keeps itself
    /// connected until [`Transport::close`] or until retries run out.
    async fn connect(&self, credentials: &Credentials) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Sends a frame, or queues it while the connection is down.
    fn emit(&self, event: &str, payload: Value) -> Result<EmitOutcome, TransportError>;

    fn on(&self, event: &str) -> Subscription;

    fn close(&self);
}

pub trait TransportExt: Transport {
    fn emit_json<T: Serialize>(&self, event: &str, payload: &T) -> Result<EmitOutcome, TransportError> {
        let value = serde_json::to_value(payload)?;
        self.emit(event, value)
    }

    /// Runs `handler` for every frame published under `event` until the
    /// returned guard is dropped.
    fn on_fn<F>(&self, event: &str, mut handler: F) -> ListenerGuard
    where
        F: FnMut(BusMessage) + Send + 'static,
    {
        let mut subscription = self.on(event);
        let topic = event.to_string();
        let task = TaskGuard::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(message) => handler(message),
                    Err(BusError::Lagged(skipped)) => {
                        warn!(target = "tide::transport", topic = %topic, skipped, "listener lagged");
                    }
                    Err(BusError::Closed) => break,
                }
            }
            trace!(target = "tide::transport", topic = %topic, "listener finished");
        });
        ListenerGuard { _task: task }
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

/// Keeps an [`TransportExt::on_fn`] listener alive.
#[derive(Debug)]
#[must_use = "dropping the guard removes the listener"]
pub struct ListenerGuard {
    _task: TaskGuard,
}

impl ListenerGuard {
    pub fn unsubscribe(self) {}
}

/// Publishes a decoded inbound frame on the listener bus.
pub(crate) fn publish_inbound(bus: &transport_bus::LocalBus, envelope: Envelope) -> usize {
    use transport_bus::Bus;
    let payload = match serde_json::to_vec(&envelope.payload) {
        Ok(payload) => Bytes::from(payload),
        Err(err) => {
            warn!(target = "tide::transport", event = %envelope.event, error = %err, "dropping undecodable frame");
            return 0;
        }
    };
    let delivered = bus.publish(&envelope.event, payload);
    if delivered == 0 {
        trace!(target = "tide::transport", event = %envelope.event, "no listeners for inbound frame");
    }
    delivered
}

pub(crate) fn publish_state(bus: &transport_bus::LocalBus, event: &'static str) {
    use transport_bus::Bus;
    trace!(target = "tide::transport", event, "connection state");
    bus.publish(event, Bytes::new());
}
