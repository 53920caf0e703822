//! create / start / stop / remove.
//!
//! ```text
//! connecting -> connected -> disconnected -> connected (start) ...
//!                                   \-> removed (terminal)
//! ```
//!
//! At most one lifecycle call runs per session; a second one is rejected
//! with [`EngineError::OperationPending`].

use std::collections::HashSet;
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Session, SessionKind, SessionStatus, SessionSummary};
use crate::engine::SessionEngine;
use crate::error::EngineError;
use crate::host::{HostError, SpawnRequest};

struct OpGuard<'a> {
    ops: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.ops.lock().remove(&self.id);
    }
}

fn default_name(kind: SessionKind, cwd: &str) -> String {
    match Path::new(cwd).file_name().and_then(|name| name.to_str()) {
        Some(dir) => format!("{kind}@{dir}"),
        None => kind.to_string(),
    }
}

impl SessionEngine {
    fn begin_op(&self, id: &str) -> Result<OpGuard<'_>, EngineError> {
        let ops = &self.shared.pending_ops;
        if !ops.lock().insert(id.to_string()) {
            return Err(EngineError::OperationPending(id.to_string()));
        }
        Ok(OpGuard {
            ops,
            id: id.to_string(),
        })
    }

    fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
        pid: Option<u32>,
    ) -> Result<Session, EngineError> {
        self.apply_summary(SessionSummary::new(id, status).pid(pid))
            .ok_or_else(|| EngineError::SessionRemoved(id.to_string()))
    }

    /// Rejections downgrade the session to disconnected; timeouts leave the
    /// status as last known.
    fn spawn_error(&self, id: &str, err: HostError) -> EngineError {
        let err = match err {
            HostError::Rejected { message, .. } => {
                let _ = self.set_status(id, SessionStatus::Disconnected, None);
                EngineError::SpawnFailed {
                    id: id.to_string(),
                    message,
                }
            }
            other => other.into(),
        };
        self.report(Some(id), &err);
        err
    }

    /// Registers a new session and asks the host to spawn it.
    pub async fn create(
        &self,
        kind: SessionKind,
        working_directory: impl Into<String>,
        name: Option<String>,
    ) -> Result<Session, EngineError> {
        let id = Uuid::new_v4().to_string();
        let cwd = working_directory.into();
        let name = name.unwrap_or_else(|| default_name(kind, &cwd));
        let _op = self.begin_op(&id)?;

        self.apply_summary(
            SessionSummary::new(id.clone(), SessionStatus::Connecting)
                .kind(kind)
                .working_directory(cwd.clone())
                .display_name(name.clone()),
        )
        .ok_or_else(|| EngineError::SessionRemoved(id.clone()))?;
        info!(target = "tide::session", session_id = %id, %kind, cwd = %cwd, "creating session");

        let request = SpawnRequest {
            session_id: id.clone(),
            cwd,
            name,
            kind,
        };
        let spawned = match self.shared.host.spawn(request).await {
            Ok(spawned) => spawned,
            Err(err) => return Err(self.spawn_error(&id, err)),
        };
        let session = self.set_status(&id, SessionStatus::Connected, Some(spawned.pid))?;
        info!(target = "tide::session", session_id = %id, pid = spawned.pid, "session connected");

        if let Some(view) = self.view(&id) {
            if let Err(err) = self.shared.reconciler.reconcile(&view).await {
                self.report(Some(&id), &err);
            }
        }
        Ok(session)
    }

    /// Stops the host process. The session stays listed as disconnected.
    pub async fn stop(&self, id: &str) -> Result<Session, EngineError> {
        let _op = self.begin_op(id)?;
        let session = self.require(id)?;
        if session.status != SessionStatus::Connected {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                operation: "stop",
                status: session.status,
            });
        }
        if let Err(err) = self.shared.host.stop(id).await {
            let err = EngineError::from(err);
            self.report(Some(id), &err);
            return Err(err);
        }
        let session = self.set_status(id, SessionStatus::Disconnected, None)?;
        if let Some(view) = self.view(id) {
            view.detach_listener();
        }
        info!(target = "tide::session", session_id = %id, "session stopped");
        Ok(session)
    }

    /// Respawns a disconnected session in its original working directory.
    pub async fn start(&self, id: &str) -> Result<Session, EngineError> {
        let _op = self.begin_op(id)?;
        let session = self.require(id)?;
        if session.status != SessionStatus::Disconnected {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                operation: "start",
                status: session.status,
            });
        }

        let request = SpawnRequest {
            session_id: id.to_string(),
            cwd: session.working_directory.clone(),
            name: session.display_name.clone(),
            kind: session.kind,
        };
        let spawned = match self.shared.host.spawn(request).await {
            Ok(spawned) => spawned,
            Err(err) => return Err(self.spawn_error(id, err)),
        };
        if spawned.already_running {
            debug!(target = "tide::session", session_id = %id, "host reports process already running");
        }

        let view = self.ensure_view(&session);
        self.attach_listener(&view);
        let session = self.set_status(id, SessionStatus::Connected, Some(spawned.pid))?;
        if let Err(err) = self.shared.reconciler.force(&view).await {
            self.report(Some(id), &err);
        }
        info!(target = "tide::session", session_id = %id, pid = spawned.pid, "session restarted");
        Ok(session)
    }

    /// Stops the session if it is running, then forgets it. Removing an
    /// unknown or already removed session is a no-op.
    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let _op = self.begin_op(id)?;
        let session = match self.require(id) {
            Ok(session) => session,
            Err(EngineError::SessionRemoved(_) | EngineError::UnknownSession(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if session.is_connected() {
            if let Err(err) = self.shared.host.stop(id).await {
                let err = EngineError::from(err);
                self.report(Some(id), &err);
                return Err(err);
            }
        }
        self.forget(id);
        info!(target = "tide::session", session_id = %id, "session removed");
        Ok(())
    }
}
