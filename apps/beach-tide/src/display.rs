//! Terminal display surfaces the synchronizer writes into.
//!
//! The engine never interprets escape sequences; bytes are passed through to
//! whichever widget backs the view.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use crossterm::{cursor::MoveTo, execute, terminal::Clear, terminal::ClearType};
use parking_lot::Mutex;
use tracing::warn;

use crate::session::Session;

pub trait TerminalDisplay: Send {
    fn write(&mut self, bytes: &[u8]);
    fn clear(&mut self);
    fn scroll_to_bottom(&mut self);
    fn is_at_bottom(&self) -> bool;
}

#[derive(Debug, Default)]
struct VirtualState {
    content: Vec<u8>,
    /// Lines between the viewport bottom and the end of the content.
    scroll_offset: usize,
    writes: u64,
    clears: u64,
    bottom_scrolls: u64,
}

/// Headless display backed by a byte buffer.
///
/// Clones share the same buffer, so a caller can keep a handle to inspect
/// what the engine rendered.
#[derive(Debug, Clone, Default)]
pub struct VirtualDisplay {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().content.clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().content).into_owned()
    }

    /// Moves the viewport up by `lines`, as a user scrolling back would.
    pub fn scroll_up(&self, lines: usize) {
        let mut state = self.state.lock();
        let max = line_count(&state.content);
        state.scroll_offset = (state.scroll_offset + lines).min(max);
    }

    pub fn scroll_offset(&self) -> usize {
        self.state.lock().scroll_offset
    }

    /// Number of writes and clears applied so far.
    pub fn mutation_count(&self) -> u64 {
        let state = self.state.lock();
        state.writes + state.clears
    }

    pub fn bottom_scrolls(&self) -> u64 {
        self.state.lock().bottom_scrolls
    }
}

fn line_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == b'\n').count()
}

impl TerminalDisplay for VirtualDisplay {
    fn write(&mut self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.content.extend_from_slice(bytes);
        state.writes += 1;
        if state.scroll_offset > 0 {
            // keep the same rows in view while content grows underneath
            state.scroll_offset += line_count(bytes);
        }
        let max = line_count(&state.content);
        state.scroll_offset = state.scroll_offset.min(max);
    }

    fn clear(&mut self) {
        let mut state = self.state.lock();
        state.content.clear();
        state.clears += 1;
    }

    fn scroll_to_bottom(&mut self) {
        let mut state = self.state.lock();
        state.scroll_offset = 0;
        state.bottom_scrolls += 1;
    }

    fn is_at_bottom(&self) -> bool {
        self.state.lock().scroll_offset == 0
    }
}

/// Builds the display for a newly attached view.
pub type DisplayFactory = Arc<dyn Fn(&Session) -> Box<dyn TerminalDisplay> + Send + Sync>;

/// Hands every view its own [`VirtualDisplay`] and keeps a handle to each,
/// keyed by session id.
#[derive(Debug, Clone, Default)]
pub struct VirtualDisplays {
    displays: Arc<Mutex<HashMap<String, VirtualDisplay>>>,
}

impl VirtualDisplays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> DisplayFactory {
        let displays = self.displays.clone();
        Arc::new(move |session: &Session| {
            let display = VirtualDisplay::new();
            displays.lock().insert(session.id.clone(), display.clone());
            Box::new(display) as Box<dyn TerminalDisplay>
        })
    }

    pub fn get(&self, session_id: &str) -> Option<VirtualDisplay> {
        self.displays.lock().get(session_id).cloned()
    }
}

/// Writes straight to the controlling terminal. Scrollback belongs to the
/// terminal emulator, so the view is always considered at the bottom.
#[derive(Debug, Default)]
pub struct StdoutDisplay {
    _private: (),
}

impl StdoutDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TerminalDisplay for StdoutDisplay {
    fn write(&mut self, bytes: &[u8]) {
        let mut stdout = io::stdout().lock();
        if let Err(err) = stdout.write_all(bytes).and_then(|_| stdout.flush()) {
            warn!(target = "tide::sync", error = %err, "stdout write failed");
        }
    }

    fn clear(&mut self) {
        let mut stdout = io::stdout();
        if let Err(err) = execute!(stdout, Clear(ClearType::All), Clear(ClearType::Purge), MoveTo(0, 0)) {
            warn!(target = "tide::sync", error = %err, "stdout clear failed");
        }
    }

    fn scroll_to_bottom(&mut self) {}

    fn is_at_bottom(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_buffer() {
        let display = VirtualDisplay::new();
        let mut writer = display.clone();
        writer.write(b"a.txt\n");
        writer.write(b"b.txt\n");
        assert_eq!(display.text(), "a.txt\nb.txt\n");
        assert_eq!(display.mutation_count(), 2);
    }

    #[test]
    fn scrolled_view_keeps_position_while_output_grows() {
        let mut display = VirtualDisplay::new();
        display.write(b"1\n2\n3\n4\n");
        display.scroll_up(2);
        assert!(!display.is_at_bottom());
        display.write(b"5\n");
        assert_eq!(display.scroll_offset(), 3);
        display.scroll_to_bottom();
        assert!(display.is_at_bottom());
    }

    #[test]
    fn factory_registers_each_view() {
        let displays = VirtualDisplays::new();
        let factory = displays.factory();
        let session = Session {
            id: "s1".into(),
            kind: crate::session::SessionKind::Shell,
            status: crate::session::SessionStatus::Connecting,
            working_directory: "/tmp".into(),
            display_name: "s1".into(),
            pid: None,
        };
        let mut display = factory(&session);
        display.write(b"hi");
        assert_eq!(displays.get("s1").map(|d| d.text()), Some("hi".to_string()));
        assert!(displays.get("s2").is_none());
    }

    #[test]
    fn scroll_up_is_bounded_by_content() {
        let display = VirtualDisplay::new();
        display.scroll_up(10);
        assert!(display.scroll_offset() == 0);
    }
}
