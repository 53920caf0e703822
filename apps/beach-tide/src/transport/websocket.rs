//! WebSocket transport with automatic reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use transport_bus::{Bus, LocalBus, Subscription};
use url::Url;

use super::{
    publish_inbound, publish_state, Credentials, EmitOutcome, OutboundQueue, ReconnectPolicy,
    Transport, TransportError, TransportKind,
};
use crate::protocol::{events, Envelope};
use crate::task::TaskGuard;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub endpoint: Url,
    pub reconnect: ReconnectPolicy,
    pub outbound_buffer: usize,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
}

impl WebSocketConfig {
    /// Accepts `ws://`/`wss://` URLs or a bare `host:port/path`, which is
    /// given `ws://` for local addresses and `wss://` otherwise.
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        let mut raw = endpoint.trim().to_string();
        if !raw.contains("://") {
            let local = raw.starts_with("127.0.0.1") || raw.starts_with("localhost");
            raw = format!("{}://{raw}", if local { "ws" } else { "wss" });
        }
        let mut url = Url::parse(&raw)
            .map_err(|err| TransportError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{endpoint}: unsupported scheme {other}"
                )));
            }
        }
        // avoid ::1 resolution on hosts where the server only binds IPv4
        if url.host_str() == Some("localhost") {
            url.set_host(Some("127.0.0.1"))
                .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))?;
        }
        Ok(Self {
            endpoint: url,
            reconnect: ReconnectPolicy::default(),
            outbound_buffer: 256,
            heartbeat: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_outbound_buffer(mut self, frames: usize) -> Self {
        self.outbound_buffer = frames;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    fn request_url(&self, credentials: &Credentials) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(token) = &credentials.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }
}

struct Link {
    sender: Option<mpsc::UnboundedSender<Envelope>>,
    queue: OutboundQueue,
}

struct Shared {
    config: WebSocketConfig,
    bus: LocalBus,
    connected: AtomicBool,
    closed: AtomicBool,
    link: Mutex<Link>,
}

impl Shared {
    fn attach(&self, sender: mpsc::UnboundedSender<Envelope>) {
        {
            let mut link = self.link.lock();
            let flushed = link.queue.len();
            let Link { sender: slot, queue } = &mut *link;
            for frame in queue.drain() {
                let _ = sender.send(frame);
            }
            *slot = Some(sender);
            self.connected.store(true, Ordering::SeqCst);
            if flushed > 0 {
                debug!(target = "tide::transport", flushed, "flushed buffered frames");
            }
        }
        publish_state(&self.bus, events::CONNECTED);
    }

    fn detach(&self) {
        self.detach_with(Vec::new());
    }

    /// Drops the live sender and puts `unsent` back at the head of the
    /// queue, ahead of anything emitted after the link went down.
    fn detach_with(&self, unsent: Vec<Envelope>) {
        let was_connected = {
            let mut link = self.link.lock();
            link.sender = None;
            if !unsent.is_empty() {
                debug!(target = "tide::transport", frames = unsent.len(), "requeued unsent frames");
                let dropped = link.queue.restore(unsent);
                if dropped > 0 {
                    warn!(target = "tide::transport", dropped, "outbound buffer full; dropped oldest frames");
                }
            }
            self.connected.swap(false, Ordering::SeqCst)
        };
        if was_connected {
            publish_state(&self.bus, events::DISCONNECTED);
        }
    }

    fn deliver(&self, text: &str) {
        match Envelope::from_text(text) {
            Ok(envelope) => {
                trace!(target = "tide::transport", event = %envelope.event, "inbound frame");
                publish_inbound(&self.bus, envelope);
            }
            Err(err) => {
                warn!(target = "tide::transport", error = %err, "ignoring malformed frame");
            }
        }
    }
}

pub struct WebSocketTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<TaskGuard>>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        let queue = OutboundQueue::new(config.outbound_buffer);
        Self {
            shared: Arc::new(Shared {
                config,
                bus: LocalBus::new(),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                link: Mutex::new(Link {
                    sender: None,
                    queue,
                }),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.shared.config.endpoint
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(&self, credentials: &Credentials) -> Result<(), TransportError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let url = shared.config.request_url(credentials);
        let stream = dial(&url, shared.config.connect_timeout).await?;
        info!(target = "tide::transport", endpoint = %shared.config.endpoint, "connected");

        let (sender, outbound) = mpsc::unbounded_channel();
        shared.attach(sender);
        let task = TaskGuard::spawn(supervise(shared.clone(), url, stream, outbound));
        *self.supervisor.lock() = Some(task);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<EmitOutcome, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let frame = Envelope::new(event, payload);
        let mut link = self.shared.link.lock();
        let frame = if let Some(sender) = &link.sender {
            match sender.send(frame) {
                Ok(()) => return Ok(EmitOutcome::Sent),
                Err(mpsc::error::SendError(frame)) => frame,
            }
        } else {
            frame
        };
        if let Some(evicted) = link.queue.push(frame) {
            warn!(
                target = "tide::transport",
                event = %evicted.event,
                dropped = link.queue.dropped(),
                "outbound buffer full; dropped oldest frame"
            );
        }
        Ok(EmitOutcome::Queued)
    }

    fn on(&self, event: &str) -> Subscription {
        self.shared.bus.subscribe(event)
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.supervisor.lock().take();
        self.shared.detach();
    }
}

async fn dial(url: &Url, timeout: Duration) -> Result<WsStream, TransportError> {
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Err(_) => Err(TransportError::Connection(format!(
            "timed out after {timeout:?}"
        ))),
        Ok(Err(tungstenite::Error::Http(response))) => {
            let status = response.status();
            if matches!(status.as_u16(), 401 | 403) {
                Err(TransportError::Rejected(status.to_string()))
            } else {
                Err(TransportError::Connection(format!("http {status}")))
            }
        }
        Ok(Err(err)) => Err(TransportError::Connection(err.to_string())),
        Ok(Ok((stream, _response))) => Ok(stream),
    }
}

async fn supervise(
    shared: Arc<Shared>,
    url: Url,
    mut stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        let unsent = run_connection(&shared, stream, &mut outbound).await;
        shared.detach_with(unsent);
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!(target = "tide::transport", endpoint = %shared.config.endpoint, "connection lost; reconnecting");
        match reconnect(&shared, &url).await {
            Some(next) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                shared.attach(sender);
                stream = next;
                outbound = receiver;
            }
            None => {
                if !shared.closed.load(Ordering::SeqCst) {
                    warn!(
                        target = "tide::transport",
                        retries = shared.config.reconnect.max_retries,
                        "giving up on reconnect"
                    );
                    publish_state(&shared.bus, events::RECONNECT_FAILED);
                }
                return;
            }
        }
    }
}

async fn reconnect(shared: &Shared, url: &Url) -> Option<WsStream> {
    for (attempt, delay) in shared.config.reconnect.delays().enumerate() {
        tokio::time::sleep(delay).await;
        if shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        match dial(url, shared.config.connect_timeout).await {
            Ok(stream) => {
                info!(target = "tide::transport", attempt = attempt + 1, "reconnected");
                return Some(stream);
            }
            Err(err) => {
                debug!(
                    target = "tide::transport",
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "reconnect attempt failed"
                );
            }
        }
    }
    None
}

/// Pumps one connection until it breaks. Returns the frames that were handed
/// to the link but never written, in emit order.
async fn run_connection(
    shared: &Shared,
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Envelope>,
) -> Vec<Envelope> {
    let (mut sink, mut source) = stream.split();
    let heartbeat_every = shared.config.heartbeat;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut unsent = Vec::new();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target = "tide::transport", event = %frame.event, error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(target = "tide::transport", error = %err, "send failed");
                    unsent.push(frame);
                    break;
                }
            }
            inbound = source.next() => {
                last_seen = Instant::now();
                match inbound {
                    Some(Ok(Message::Text(text))) => shared.deliver(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => shared.deliver(text),
                        Err(_) => warn!(target = "tide::transport", len = bytes.len(), "ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(target = "tide::transport", ?frame, "host closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(target = "tide::transport", error = %err, "read failed");
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_every * 3 {
                    warn!(target = "tide::transport", "no traffic from host; dropping connection");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    drain_unsent(outbound, &mut unsent);
    unsent
}

fn drain_unsent(outbound: &mut mpsc::UnboundedReceiver<Envelope>, unsent: &mut Vec<Envelope>) {
    while let Ok(frame) = outbound.try_recv() {
        unsent.push(frame);
    }
}
