//! The engine façade: owns the registry, the per-session views and the
//! host client, and routes transport events to them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusError, LocalBus, Subscription};

use crate::config::EngineConfig;
use crate::display::{TerminalDisplay, VirtualDisplay};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::host::{HostApi, HostClient};
use crate::protocol::{events, OutputEvent, RemovedEvent};
use crate::session::{Session, SessionRegistry, SessionStatus, SessionSummary};
use crate::sync::{ClientSessionView, ReconcileOutcome, Reconciler, ScrollAction};
use crate::task::TaskGuard;
use crate::transport::{Transport, TransportError};

pub use crate::display::DisplayFactory;

pub(crate) fn output_topic(session_id: &str) -> String {
    format!("output/{session_id}")
}

pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) host: Arc<dyn HostApi>,
    pub(crate) reconciler: Reconciler,
    pub(crate) registry: RwLock<SessionRegistry>,
    pub(crate) views: RwLock<HashMap<String, Arc<ClientSessionView>>>,
    /// Per-session output fan-out; topics are [`output_topic`].
    pub(crate) router: Arc<LocalBus>,
    pub(crate) events: EventSink,
    pub(crate) pending_ops: Mutex<HashSet<String>>,
    display_factory: DisplayFactory,
    pumps: Mutex<Vec<TaskGuard>>,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct SessionEngine {
    pub(crate) shared: Arc<EngineShared>,
}

pub struct SessionEngineBuilder {
    transport: Arc<dyn Transport>,
    host: Option<Arc<dyn HostApi>>,
    config: EngineConfig,
    display_factory: Option<DisplayFactory>,
}

impl SessionEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the host API; defaults to a [`HostClient`] on the transport.
    pub fn host(mut self, host: Arc<dyn HostApi>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn display_factory(mut self, factory: DisplayFactory) -> Self {
        self.display_factory = Some(factory);
        self
    }

    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> SessionEngine {
        let host: Arc<dyn HostApi> = match self.host {
            Some(host) => host,
            None => Arc::new(HostClient::new(
                self.transport.clone(),
                self.config.host_timeout,
            )),
        };
        let events = EventSink::new(self.config.event_capacity);
        let display_factory: DisplayFactory = match self.display_factory {
            Some(factory) => factory,
            None => Arc::new(|_: &Session| -> Box<dyn TerminalDisplay> {
                Box::new(VirtualDisplay::new())
            }),
        };
        let shared = Arc::new(EngineShared {
            reconciler: Reconciler::new(host.clone(), events.clone()),
            host,
            transport: self.transport,
            config: self.config,
            registry: RwLock::new(SessionRegistry::new()),
            views: RwLock::new(HashMap::new()),
            router: Arc::new(LocalBus::new()),
            events,
            pending_ops: Mutex::new(HashSet::new()),
            display_factory,
            pumps: Mutex::new(Vec::new()),
        });
        let engine = SessionEngine { shared };
        engine.start_pumps();
        engine
    }
}

impl SessionEngine {
    pub fn builder(transport: Arc<dyn Transport>) -> SessionEngineBuilder {
        SessionEngineBuilder {
            transport,
            host: None,
            config: EngineConfig::default(),
            display_factory: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.shared.registry.read().list()
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.shared.registry.read().get(id).cloned()
    }

    pub fn view(&self, id: &str) -> Option<Arc<ClientSessionView>> {
        self.shared.views.read().get(id).cloned()
    }

    /// The session, or the reason there is none.
    pub(crate) fn require(&self, id: &str) -> Result<Session, EngineError> {
        let registry = self.shared.registry.read();
        match registry.get(id) {
            Some(session) => Ok(session.clone()),
            None if registry.is_removed(id) => Err(EngineError::SessionRemoved(id.to_string())),
            None => Err(EngineError::UnknownSession(id.to_string())),
        }
    }

    pub(crate) fn require_view(&self, id: &str) -> Result<Arc<ClientSessionView>, EngineError> {
        self.require(id)?;
        self.view(id)
            .ok_or_else(|| EngineError::UnknownSession(id.to_string()))
    }

    /// Applies one output chunk to the session's view directly, bypassing
    /// the transport.
    pub fn on_output_chunk(&self, id: &str, chunk: &[u8]) -> Result<ScrollAction, EngineError> {
        let view = self.require_view(id)?;
        let scroll = view.apply_output(chunk);
        self.shared.events.publish(EngineEvent::OutputApplied {
            session_id: id.to_string(),
            bytes: chunk.len(),
            scroll,
        });
        view.schedule_refresh();
        Ok(scroll)
    }

    /// Reconciles now, without the debounce window.
    pub async fn reconcile(&self, id: &str) -> Result<ReconcileOutcome, EngineError> {
        let view = self.require_view(id)?;
        self.shared.reconciler.reconcile(&view).await
    }

    /// Reconciles now and rewrites the display even if the snapshot is
    /// unchanged.
    pub async fn force_reconcile(&self, id: &str) -> Result<ReconcileOutcome, EngineError> {
        let view = self.require_view(id)?;
        self.shared.reconciler.force(&view).await
    }

    /// Requests a debounced reconcile.
    pub fn schedule_refresh(&self, id: &str) -> Result<(), EngineError> {
        self.require_view(id)?.schedule_refresh();
        Ok(())
    }

    /// Ensures the session's output listener is attached and brings the
    /// view up to date. Used when a session is opened or brought to front.
    pub async fn attach(&self, id: &str) -> Result<ReconcileOutcome, EngineError> {
        let session = self.require(id)?;
        let view = self.ensure_view(&session);
        if !view.is_listening() {
            self.attach_listener(&view);
        }
        self.shared.reconciler.reconcile(&view).await
    }

    pub fn rename(&self, id: &str, name: impl Into<String>) -> Result<Session, EngineError> {
        let renamed = self.shared.registry.write().rename(id, name);
        match renamed {
            Some(session) => {
                self.shared
                    .events
                    .publish(EngineEvent::SessionUpdated(session.clone()));
                Ok(session)
            }
            None => self.require(id),
        }
    }

    /// Pulls the host's session list into the registry. Connected sessions
    /// the host no longer reports are marked disconnected.
    pub async fn refresh_sessions(&self) -> Result<Vec<Session>, EngineError> {
        let summaries = self.shared.host.list_sessions().await?;
        let reported: HashSet<String> = summaries.iter().map(|s| s.id.clone()).collect();
        for summary in summaries {
            self.apply_summary(summary);
        }
        let busy = self.shared.pending_ops.lock().clone();
        let stale: Vec<String> = self
            .sessions()
            .into_iter()
            .filter(|s| s.is_connected() && !reported.contains(&s.id) && !busy.contains(&s.id))
            .map(|s| s.id)
            .collect();
        for id in stale {
            debug!(target = "tide::session", session_id = %id, "host no longer reports session");
            self.apply_summary(SessionSummary::new(id, SessionStatus::Disconnected));
        }
        Ok(self.sessions())
    }

    /// Merges a host report into the registry and keeps the view in step.
    pub(crate) fn apply_summary(&self, summary: SessionSummary) -> Option<Session> {
        let outcome = self.shared.registry.write().upsert(summary);
        let session = outcome.session()?.clone();
        let view = self.ensure_view(&session);
        if outcome.status_changed() {
            if session.is_connected() {
                if !view.is_listening() {
                    self.attach_listener(&view);
                }
                view.set_continuous_refresh(self.shared.config.sync.continuous_refresh);
                // create and start reconcile on their own once spawned
                if !self.shared.pending_ops.lock().contains(&session.id) {
                    view.invalidate();
                    view.schedule_refresh();
                }
            } else {
                view.set_continuous_refresh(None);
            }
        }
        self.shared
            .events
            .publish(EngineEvent::SessionUpdated(session.clone()));
        Some(session)
    }

    pub(crate) fn ensure_view(&self, session: &Session) -> Arc<ClientSessionView> {
        if let Some(view) = self.view(&session.id) {
            return view;
        }
        let mut views = self.shared.views.write();
        views
            .entry(session.id.clone())
            .or_insert_with(|| {
                let display = (self.shared.display_factory)(session);
                let view = ClientSessionView::new(
                    session,
                    display,
                    self.shared.config.sync.clone(),
                    self.shared.reconciler.clone(),
                );
                view.attach_listener(
                    self.shared.router.subscribe(&output_topic(&session.id)),
                    self.shared.events.clone(),
                );
                debug!(target = "tide::sync", session_id = %session.id, kind = %session.kind, "view attached");
                view
            })
            .clone()
    }

    pub(crate) fn attach_listener(&self, view: &Arc<ClientSessionView>) {
        let subscription = self.shared.router.subscribe(&output_topic(view.session_id()));
        view.attach_listener(subscription, self.shared.events.clone());
    }

    /// Drops the session and its view.
    pub(crate) fn forget(&self, id: &str) -> Option<Session> {
        let removed = self.shared.registry.write().remove(id);
        self.shared.views.write().remove(id);
        if removed.is_some() {
            self.shared.router.prune();
            self.shared.events.publish(EngineEvent::SessionRemoved {
                session_id: id.to_string(),
            });
        }
        removed
    }

    pub(crate) fn report(&self, session_id: Option<&str>, err: &EngineError) {
        warn!(target = "tide::session", session_id = ?session_id, error = %err, "session error");
        self.shared.events.publish(EngineEvent::SessionError {
            session_id: session_id.map(str::to_string),
            message: err.to_string(),
        });
    }

    /// Brings every connected view back in line with the host after the
    /// transport reconnects.
    pub async fn resync(&self) {
        if let Err(err) = self.refresh_sessions().await {
            self.report(None, &err);
        }
        let views: Vec<Arc<ClientSessionView>> = {
            let registry = self.shared.registry.read();
            self.shared
                .views
                .read()
                .values()
                .filter(|view| {
                    registry
                        .get(view.session_id())
                        .is_some_and(Session::is_connected)
                })
                .cloned()
                .collect()
        };
        info!(target = "tide::sync", views = views.len(), "resyncing after reconnect");
        let reconciler = &self.shared.reconciler;
        let results = join_all(views.iter().map(|view| reconciler.reconcile(view))).await;
        for (view, result) in views.iter().zip(results) {
            if let Err(err) = result {
                self.report(Some(view.session_id()), &err);
            }
        }
    }

    fn start_pumps(&self) {
        let weak = Arc::downgrade(&self.shared);
        let transport = &self.shared.transport;
        let pumps = vec![
            route_output(transport.on(events::SESSION_OUTPUT), self.shared.router.clone()),
            pump(transport.on(events::SESSION_STATUS), weak.clone(), |engine, summary: SessionSummary| {
                engine.apply_summary(summary);
            }),
            pump(transport.on(events::SESSION_REMOVED), weak.clone(), |engine, removed: RemovedEvent| {
                info!(target = "tide::session", session_id = %removed.session_id, "host removed session");
                engine.forget(&removed.session_id);
            }),
            watch_connection(
                transport.on(events::CONNECTED),
                transport.on(events::DISCONNECTED),
                transport.on(events::RECONNECT_FAILED),
                weak,
            ),
        ];
        *self.shared.pumps.lock() = pumps;
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8], event: &str) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target = "tide::host", event, error = %err, "ignoring malformed host event");
            None
        }
    }
}

/// Moves `session:output` chunks onto their per-session topic, in order.
fn route_output(mut subscription: Subscription, router: Arc<LocalBus>) -> TaskGuard {
    TaskGuard::spawn(async move {
        loop {
            let message = match subscription.recv().await {
                Ok(message) => message,
                Err(BusError::Lagged(skipped)) => {
                    warn!(target = "tide::sync", skipped, "output router lagged");
                    continue;
                }
                Err(BusError::Closed) => break,
            };
            let Some(output) = decode::<OutputEvent>(&message.payload, events::SESSION_OUTPUT) else {
                continue;
            };
            if router.publish(&output_topic(&output.session_id), Bytes::from(output.data)) == 0 {
                debug!(target = "tide::sync", session_id = %output.session_id, "output for unattached session");
            }
        }
    })
}

fn pump<T, F>(mut subscription: Subscription, engine: Weak<EngineShared>, mut handle: F) -> TaskGuard
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(SessionEngine, T) + Send + 'static,
{
    TaskGuard::spawn(async move {
        loop {
            let message = match subscription.recv().await {
                Ok(message) => message,
                Err(BusError::Lagged(skipped)) => {
                    warn!(target = "tide::host", topic = %subscription.topic(), skipped, "event pump lagged");
                    continue;
                }
                Err(BusError::Closed) => break,
            };
            let Some(value) = decode::<T>(&message.payload, &message.topic) else {
                continue;
            };
            let Some(shared) = engine.upgrade() else { break };
            handle(SessionEngine { shared }, value);
        }
    })
}

fn watch_connection(
    mut connected: Subscription,
    mut disconnected: Subscription,
    mut failed: Subscription,
    engine: Weak<EngineShared>,
) -> TaskGuard {
    TaskGuard::spawn(async move {
        loop {
            tokio::select! {
                biased;
                lost = disconnected.recv() => {
                    if matches!(lost, Err(BusError::Closed)) { break }
                    let Some(shared) = engine.upgrade() else { break };
                    warn!(target = "tide::transport", "transport disconnected; sessions keep their last buffer");
                    shared.events.publish(EngineEvent::TransportDisconnected);
                }
                up = connected.recv() => {
                    if matches!(up, Err(BusError::Closed)) { break }
                    let Some(shared) = engine.upgrade() else { break };
                    shared.events.publish(EngineEvent::TransportConnected);
                    SessionEngine { shared }.resync().await;
                }
                gave_up = failed.recv() => {
                    if matches!(gave_up, Err(BusError::Closed)) { break }
                    let Some(shared) = engine.upgrade() else { break };
                    let err = EngineError::Transport(TransportError::Connection(
                        "reconnect attempts exhausted".into(),
                    ));
                    SessionEngine { shared }.report(None, &err);
                }
            }
        }
    })
}
