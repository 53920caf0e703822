//! In-process transport. The [`MemoryPeer`] side plays the host: it reads
//! the frames the client emits, pushes events back, and can drop and restore
//! the link to exercise reconnect handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use transport_bus::{Bus, LocalBus, Subscription};

use super::{
    publish_inbound, publish_state, Credentials, EmitOutcome, OutboundQueue, Transport,
    TransportError, TransportKind,
};
use crate::protocol::{events, Envelope};

struct Shared {
    bus: LocalBus,
    connected: AtomicBool,
    closed: AtomicBool,
    reachable: AtomicBool,
    required_token: Mutex<Option<String>>,
    link: Mutex<OutboundQueue>,
    to_peer: mpsc::UnboundedSender<Envelope>,
}

impl Shared {
    /// Marks the link up and flushes queued frames ahead of anything new.
    fn bring_up(&self) {
        {
            let mut queue = self.link.lock();
            for frame in queue.drain() {
                let _ = self.to_peer.send(frame);
            }
            self.connected.store(true, Ordering::SeqCst);
        }
        publish_state(&self.bus, events::CONNECTED);
    }
}

pub struct MemoryTransport {
    shared: Arc<Shared>,
}

pub struct MemoryPeer {
    handle: PeerHandle,
    frames: mpsc::UnboundedReceiver<Envelope>,
}

/// Cloneable control side of a [`MemoryPeer`].
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<Shared>,
}

pub fn memory_pair(outbound_buffer: usize) -> (MemoryTransport, MemoryPeer) {
    let (to_peer, frames) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        bus: LocalBus::new(),
        connected: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        reachable: AtomicBool::new(true),
        required_token: Mutex::new(None),
        link: Mutex::new(OutboundQueue::new(outbound_buffer)),
        to_peer,
    });
    (
        MemoryTransport {
            shared: shared.clone(),
        },
        MemoryPeer {
            handle: PeerHandle { shared },
            frames,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn connect(&self, credentials: &Credentials) -> Result<(), TransportError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !shared.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("peer unreachable".into()));
        }
        if let Some(expected) = shared.required_token.lock().clone() {
            if credentials.token.as_deref() != Some(expected.as_str()) {
                return Err(TransportError::Rejected("token mismatch".into()));
            }
        }
        if !shared.connected.load(Ordering::SeqCst) {
            shared.bring_up();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<EmitOutcome, TransportError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let frame = Envelope::new(event, payload);
        let mut queue = shared.link.lock();
        if shared.connected.load(Ordering::SeqCst) {
            shared
                .to_peer
                .send(frame)
                .map_err(|_| TransportError::Closed)?;
            return Ok(EmitOutcome::Sent);
        }
        if let Some(evicted) = queue.push(frame) {
            warn!(target = "tide::transport", event = %evicted.event, "outbound buffer full; dropped oldest frame");
        }
        Ok(EmitOutcome::Queued)
    }

    fn on(&self, event: &str) -> Subscription {
        self.shared.bus.subscribe(event)
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            publish_state(&self.shared.bus, events::DISCONNECTED);
        }
    }
}

impl MemoryPeer {
    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Next frame the client emitted, or `None` once the client is gone.
    pub async fn next_frame(&mut self) -> Option<Envelope> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<Envelope> {
        self.frames.try_recv().ok()
    }
}

impl PeerHandle {
    /// Delivers an event to the client. Returns `false` if the link is down,
    /// in which case the event is lost.
    pub fn push<T: Serialize>(&self, event: &str, payload: &T) -> bool {
        if !self.shared.connected.load(Ordering::SeqCst) {
            debug!(target = "tide::transport", event, "peer push while link down; dropped");
            return false;
        }
        match Envelope::encode(event, payload) {
            Ok(envelope) => {
                publish_inbound(&self.shared.bus, envelope);
                true
            }
            Err(err) => {
                warn!(target = "tide::transport", event, error = %err, "peer payload failed to encode");
                false
            }
        }
    }

    /// Simulates a network drop.
    pub fn drop_link(&self) {
        let was_connected = {
            let _link = self.shared.link.lock();
            self.shared.connected.swap(false, Ordering::SeqCst)
        };
        if was_connected {
            publish_state(&self.shared.bus, events::DISCONNECTED);
        }
    }

    /// Simulates a successful automatic reconnect.
    pub fn restore_link(&self) {
        if self.shared.closed.load(Ordering::SeqCst) || self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        self.shared.bring_up();
    }

    /// Simulates the client giving up after exhausting its retries.
    pub fn fail_reconnect(&self) {
        self.drop_link();
        publish_state(&self.shared.bus, events::RECONNECT_FAILED);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn require_token(&self, token: Option<String>) {
        *self.shared.required_token.lock() = token;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn queued_frames(&self) -> usize {
        self.shared.link.lock().len()
    }
}
