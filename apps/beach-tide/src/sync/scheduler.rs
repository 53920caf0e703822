//! Per-view debounce in front of [`Reconciler::reconcile`].
//!
//! Every `schedule` call restarts the quiet window; when it elapses one
//! reconcile runs. If the user typed recently the run waits until input has
//! been quiet for `input_quiet`, but never longer than `max_input_defer`
//! after the first request of the burst. Requests made while a reconcile is
//! running collapse into a single follow-up burst.

use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{trace, warn};

use super::reconcile::Reconciler;
use super::view::ClientSessionView;
use super::SyncConfig;
use crate::events::EngineEvent;
use crate::task::TaskGuard;

#[derive(Debug)]
pub struct RefreshScheduler {
    wake: Arc<Notify>,
    _task: TaskGuard,
}

impl RefreshScheduler {
    pub(crate) fn spawn(
        view: Weak<ClientSessionView>,
        reconciler: Reconciler,
        config: SyncConfig,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        Self {
            wake: wake.clone(),
            _task: TaskGuard::spawn(run(wake, view, reconciler, config)),
        }
    }

    pub fn schedule(&self) {
        self.wake.notify_one();
    }
}

async fn run(
    wake: Arc<Notify>,
    view: Weak<ClientSessionView>,
    reconciler: Reconciler,
    config: SyncConfig,
) {
    loop {
        wake.notified().await;
        let first_request = Instant::now();
        let mut deadline = first_request + config.debounce;
        loop {
            tokio::select! {
                _ = wake.notified() => deadline = Instant::now() + config.debounce,
                _ = sleep_until(deadline) => {
                    let Some(view) = view.upgrade() else { return };
                    match view.input_hold(first_request, Instant::now()) {
                        Some(until) => {
                            trace!(target = "tide::sync", session_id = %view.session_id(), "refresh held for input");
                            deadline = until;
                        }
                        None => break,
                    }
                }
            }
        }

        let Some(view) = view.upgrade() else { return };
        if let Err(err) = reconciler.reconcile(&view).await {
            warn!(target = "tide::sync", session_id = %view.session_id(), error = %err, "scheduled reconcile failed");
            reconciler.events().publish(EngineEvent::SessionError {
                session_id: Some(view.session_id().to_string()),
                message: err.to_string(),
            });
        }
    }
}
