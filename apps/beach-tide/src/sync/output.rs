//! Live output application.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{Level, trace, warn};
use transport_bus::{BusError, Subscription};

use super::flavor::SessionFlavor;
use super::view::{ClientSessionView, ViewState};
use crate::events::{EngineEvent, EventSink};
use crate::task::TaskGuard;
use crate::telemetry::{self, logging::hexdump};

/// Sequences after which earlier output is gone: erase display, erase
/// scrollback, full reset.
const CLEAR_SEQUENCES: &[&[u8]] = &[b"\x1b[2J", b"\x1b[3J", b"\x1bc"];

/// What the view did with its scroll position after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAction {
    /// Was at the bottom, stayed there.
    Followed,
    /// User had scrolled away; position kept.
    Held,
    /// A prompt is being drawn; scrolling waits for it to finish.
    Deferred,
    /// The pending prompt finished and the view jumped to the bottom.
    Released,
}

/// Offset just past the last clear-screen sequence in `chunk`.
fn clear_offset(chunk: &[u8]) -> Option<usize> {
    CLEAR_SEQUENCES
        .iter()
        .filter_map(|seq| {
            chunk
                .windows(seq.len())
                .rposition(|window| window == *seq)
                .map(|start| start + seq.len())
        })
        .max()
}

/// Length of an incomplete multi-byte sequence at the end of `bytes`.
fn incomplete_suffix(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

pub(crate) fn apply_chunk(
    state: &mut ViewState,
    flavor: &dyn SessionFlavor,
    chunk: &[u8],
    now: Instant,
    prompt_quiet: Duration,
) -> ScrollAction {
    let was_at_bottom = state.display.is_at_bottom();
    match clear_offset(chunk) {
        Some(offset) => {
            state.display.clear();
            if offset < chunk.len() {
                state.display.write(&chunk[offset..]);
            }
        }
        None => state.display.write(chunk),
    }

    let after_quiet = state
        .last_output_at
        .is_none_or(|at| now.saturating_duration_since(at) >= prompt_quiet);
    state.last_output_at = Some(now);
    // the display no longer matches the last applied snapshot
    state.last_content_hash = None;

    // classify whole characters even when a glyph straddles two chunks
    let mut bytes = std::mem::take(&mut state.utf8_tail);
    bytes.extend_from_slice(chunk);
    let complete = bytes.len() - incomplete_suffix(&bytes);
    state.utf8_tail = bytes.split_off(complete);
    let text = String::from_utf8_lossy(&bytes);
    if !state.pending_prompt_scroll && flavor.opens_prompt(&text, after_quiet) {
        state.pending_prompt_scroll = true;
    }
    if state.pending_prompt_scroll {
        if flavor.closes_prompt(&text) {
            state.pending_prompt_scroll = false;
            state.display.scroll_to_bottom();
            ScrollAction::Released
        } else {
            ScrollAction::Deferred
        }
    } else if was_at_bottom {
        state.display.scroll_to_bottom();
        ScrollAction::Followed
    } else {
        ScrollAction::Held
    }
}

/// Applies every chunk routed to the view, in arrival order, until the view
/// is dropped or the subscription closes.
pub(crate) fn spawn_listener(
    view: Weak<ClientSessionView>,
    mut subscription: Subscription,
    events: EventSink,
) -> TaskGuard {
    TaskGuard::spawn(async move {
        loop {
            let received = subscription.recv().await;
            let Some(view) = view.upgrade() else { break };
            match received {
                Ok(message) => {
                    let chunk = &message.payload;
                    if tracing::enabled!(Level::TRACE) {
                        trace!(target = "tide::sync", session_id = %view.session_id(), "chunk\n{}", hexdump(chunk));
                    }
                    telemetry::record_bytes("output_applied", chunk.len());
                    let scroll = view.apply_output(chunk);
                    events.publish(EngineEvent::OutputApplied {
                        session_id: view.session_id().to_string(),
                        bytes: chunk.len(),
                        scroll,
                    });
                    view.schedule_refresh();
                }
                Err(BusError::Lagged(skipped)) => {
                    warn!(target = "tide::sync", session_id = %view.session_id(), skipped, "output chunks dropped; resyncing");
                    view.invalidate();
                    view.schedule_refresh();
                }
                Err(BusError::Closed) => break,
            }
        }
    })
}
