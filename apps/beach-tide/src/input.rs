//! Keystroke and resize forwarding.

use tracing::{debug, trace};

use crate::engine::SessionEngine;
use crate::error::EngineError;

impl SessionEngine {
    /// Sends `data` to the session's process. Input to a session that is
    /// not connected is refused, not queued.
    pub async fn forward(&self, id: &str, data: &[u8]) -> Result<(), EngineError> {
        let session = self.require(id)?;
        if !session.is_connected() {
            debug!(target = "tide::input", session_id = %id, status = %session.status, "input refused");
            return Err(EngineError::SessionNotConnected(id.to_string()));
        }
        let view = self.require_view(id)?;
        view.note_input();
        self.shared.host.send(id, data).await?;
        trace!(target = "tide::input", session_id = %id, bytes = data.len(), "input forwarded");
        Ok(())
    }

    /// Tells the host the display size changed and schedules a refresh.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), EngineError> {
        let session = self.require(id)?;
        if !session.is_connected() {
            return Err(EngineError::SessionNotConnected(id.to_string()));
        }
        self.shared
            .host
            .configure_display_size(id, cols, rows)
            .await?;
        debug!(target = "tide::input", session_id = %id, cols, rows, "display resized");
        self.require_view(id)?.schedule_refresh();
        Ok(())
    }
}
