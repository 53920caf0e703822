//! Snapshot-based reconciliation, at most one fetch in flight per view.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::view::ClientSessionView;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::host::HostApi;
use crate::telemetry::PerfGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The snapshot differed and was written.
    Applied,
    /// The snapshot matched what the view already shows.
    Unchanged,
    /// Another reconcile was running; this request was folded into its
    /// follow-up run.
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateState {
    Idle,
    Running,
    RunningWithFollowUp,
}

/// Resets the gate if the running reconcile is cancelled.
struct GateGuard<'a> {
    gate: &'a Mutex<GateState>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *self.gate.lock() = GateState::Idle;
    }
}

#[derive(Clone)]
pub struct Reconciler {
    host: Arc<dyn HostApi>,
    events: EventSink,
}

impl Reconciler {
    pub fn new(host: Arc<dyn HostApi>, events: EventSink) -> Self {
        Self { host, events }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Fetches the host snapshot and applies it if it changed. A request
    /// that arrives while one is running returns
    /// [`ReconcileOutcome::Coalesced`] and causes exactly one more run.
    pub async fn reconcile(&self, view: &ClientSessionView) -> Result<ReconcileOutcome, EngineError> {
        {
            let mut gate = view.gate.lock();
            match *gate {
                GateState::Idle => *gate = GateState::Running,
                GateState::Running | GateState::RunningWithFollowUp => {
                    *gate = GateState::RunningWithFollowUp;
                    trace!(target = "tide::sync", session_id = %view.session_id(), "reconcile coalesced");
                    return Ok(ReconcileOutcome::Coalesced);
                }
            }
        }
        let _reset = GateGuard { gate: &view.gate };

        loop {
            let result = self.run_once(view).await;
            let follow_up = {
                let mut gate = view.gate.lock();
                let follow_up = *gate == GateState::RunningWithFollowUp;
                if follow_up {
                    *gate = GateState::Running;
                }
                follow_up
            };
            if !follow_up {
                return result;
            }
        }
    }

    /// Reconciles even if the host buffer matches the last applied snapshot.
    pub async fn force(&self, view: &ClientSessionView) -> Result<ReconcileOutcome, EngineError> {
        view.invalidate();
        self.reconcile(view).await
    }

    async fn run_once(&self, view: &ClientSessionView) -> Result<ReconcileOutcome, EngineError> {
        let session_id = view.session_id();
        let snapshot = self.host.buffer_snapshot(session_id).await?;
        let changed = {
            let _perf = PerfGuard::new("snapshot_apply");
            view.apply_snapshot(&snapshot)
        };
        debug!(
            target = "tide::sync",
            session_id = %session_id,
            hash = %snapshot.hash().short(),
            bytes = snapshot.len(),
            changed,
            "reconciled"
        );
        self.events.publish(EngineEvent::Reconciled {
            session_id: session_id.to_string(),
            changed,
        });
        Ok(if changed {
            ReconcileOutcome::Applied
        } else {
            ReconcileOutcome::Unchanged
        })
    }
}
