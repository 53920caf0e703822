use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;
use transport_bus::Subscription;

use super::flavor::{flavor_for, SessionFlavor};
use super::output::{self, ScrollAction};
use super::reconcile::{GateState, Reconciler};
use super::scheduler::RefreshScheduler;
use super::snapshot::{Snapshot, SnapshotHash};
use super::SyncConfig;
use crate::display::TerminalDisplay;
use crate::events::EventSink;
use crate::session::{Session, SessionKind};
use crate::task::TaskGuard;

/// Mutable per-view state. Guarded by one mutex that is never held across
/// an await.
pub struct ViewState {
    pub display: Box<dyn TerminalDisplay>,
    pub last_content_hash: Option<SnapshotHash>,
    pub last_output_at: Option<Instant>,
    pub last_input_at: Option<Instant>,
    pub buffer_reconciled: bool,
    pub pending_prompt_scroll: bool,
    /// Start of a UTF-8 sequence cut off at the end of the last chunk.
    pub utf8_tail: Vec<u8>,
}

impl ViewState {
    pub fn new(display: Box<dyn TerminalDisplay>) -> Self {
        Self {
            display,
            last_content_hash: None,
            last_output_at: None,
            last_input_at: None,
            buffer_reconciled: false,
            pending_prompt_scroll: false,
            utf8_tail: Vec::new(),
        }
    }
}

/// A client's rendering of one session. Owns the timers and the output
/// listener for that session; dropping the view stops all of them.
pub struct ClientSessionView {
    session_id: String,
    flavor: &'static dyn SessionFlavor,
    config: SyncConfig,
    state: Mutex<ViewState>,
    pub(crate) gate: Mutex<GateState>,
    scheduler: RefreshScheduler,
    listener: Mutex<Option<TaskGuard>>,
    continuous: Mutex<Option<TaskGuard>>,
}

impl ClientSessionView {
    pub(crate) fn new(
        session: &Session,
        display: Box<dyn TerminalDisplay>,
        config: SyncConfig,
        reconciler: Reconciler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            session_id: session.id.clone(),
            flavor: flavor_for(session.kind),
            scheduler: RefreshScheduler::spawn(weak.clone(), reconciler, config.clone()),
            config,
            state: Mutex::new(ViewState::new(display)),
            gate: Mutex::new(GateState::Idle),
            listener: Mutex::new(None),
            continuous: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> SessionKind {
        self.flavor.kind()
    }

    pub fn apply_output(&self, chunk: &[u8]) -> ScrollAction {
        let mut state = self.state.lock();
        output::apply_chunk(
            &mut state,
            self.flavor,
            chunk,
            Instant::now(),
            self.config.prompt_quiet,
        )
    }

    /// Replaces the display with `snapshot` unless it matches what was last
    /// applied. Returns whether the display changed.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> bool {
        let mut state = self.state.lock();
        if state.last_content_hash == Some(snapshot.hash()) {
            return false;
        }
        let was_at_bottom = state.display.is_at_bottom();
        state.display.clear();
        state.display.write(snapshot.data());
        state.last_content_hash = Some(snapshot.hash());
        state.buffer_reconciled = true;
        state.pending_prompt_scroll = false;
        if was_at_bottom {
            state.display.scroll_to_bottom();
        }
        true
    }

    /// Forgets the last snapshot hash so the next reconcile rewrites.
    pub fn invalidate(&self) {
        self.state.lock().last_content_hash = None;
    }

    pub fn note_input(&self) {
        self.state.lock().last_input_at = Some(Instant::now());
    }

    pub fn schedule_refresh(&self) {
        self.scheduler.schedule();
    }

    /// When a refresh first requested at `first_request` should wait for
    /// typing to settle, returns the instant it may run. `None` means run now.
    pub(crate) fn input_hold(&self, first_request: Instant, now: Instant) -> Option<Instant> {
        let last_input = self.state.lock().last_input_at?;
        let settled = last_input + self.config.input_quiet;
        let limit = first_request + self.config.max_input_defer;
        let until = settled.min(limit);
        (until > now).then_some(until)
    }

    pub fn last_content_hash(&self) -> Option<SnapshotHash> {
        self.state.lock().last_content_hash
    }

    pub fn buffer_reconciled(&self) -> bool {
        self.state.lock().buffer_reconciled
    }

    pub fn pending_prompt_scroll(&self) -> bool {
        self.state.lock().pending_prompt_scroll
    }

    pub(crate) fn attach_listener(self: &Arc<Self>, subscription: Subscription, events: EventSink) {
        let task = output::spawn_listener(Arc::downgrade(self), subscription, events);
        if self.listener.lock().replace(task).is_some() {
            debug!(target = "tide::sync", session_id = %self.session_id, "replaced output listener");
        }
    }

    pub(crate) fn detach_listener(&self) {
        self.listener.lock().take();
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Turns periodic refresh on or off for this view.
    pub fn set_continuous_refresh(self: &Arc<Self>, period: Option<Duration>) {
        let task = period.filter(|p| !p.is_zero()).map(|period| {
            let view = Arc::downgrade(self);
            TaskGuard::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(view) = view.upgrade() else { break };
                    view.schedule_refresh();
                }
            })
        });
        *self.continuous.lock() = task;
    }

    pub fn continuous_refresh_active(&self) -> bool {
        self.continuous.lock().is_some()
    }
}

impl std::fmt::Debug for ClientSessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSessionView")
            .field("session_id", &self.session_id)
            .field("kind", &self.flavor.kind())
            .finish_non_exhaustive()
    }
}
