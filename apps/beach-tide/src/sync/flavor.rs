use std::fmt;

use crate::session::SessionKind;

/// Per-kind output heuristics.
pub trait SessionFlavor: Send + Sync + fmt::Debug {
    fn kind(&self) -> SessionKind;

    /// Whether `text` starts an interactive prompt that is still being
    /// drawn. `after_quiet` is true when the session had been silent for the
    /// prompt quiet interval before this chunk. Explicit confirmation text
    /// counts on its own; a bare box edge only counts after a pause.
    fn opens_prompt(&self, text: &str, after_quiet: bool) -> bool;

    /// Whether `text` finishes a prompt opened earlier.
    fn closes_prompt(&self, text: &str) -> bool;
}

/// Shells only follow the bottom when the user was already there.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellFlavor;

impl SessionFlavor for ShellFlavor {
    fn kind(&self) -> SessionKind {
        SessionKind::Shell
    }

    fn opens_prompt(&self, _text: &str, _after_quiet: bool) -> bool {
        false
    }

    fn closes_prompt(&self, _text: &str) -> bool {
        false
    }
}

const CONFIRMATION_MARKERS: &[&str] = &["Do you want to", "❯ 1.", "(y/n)", "[y/N]", "[Y/n]"];
const BOX_OPENERS: &[char] = &['╭', '┌'];
const BOX_CLOSERS: &[char] = &['╰', '╯', '└', '┘'];

/// Assistant sessions draw confirmation dialogs in boxes over several
/// chunks; the view waits for the closing edge before scrolling.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssistantFlavor;

impl SessionFlavor for AssistantFlavor {
    fn kind(&self) -> SessionKind {
        SessionKind::Assistant
    }

    fn opens_prompt(&self, text: &str, after_quiet: bool) -> bool {
        CONFIRMATION_MARKERS.iter().any(|marker| text.contains(marker))
            || (after_quiet && text.contains(BOX_OPENERS))
    }

    fn closes_prompt(&self, text: &str) -> bool {
        text.contains(BOX_CLOSERS)
    }
}

static SHELL: ShellFlavor = ShellFlavor;
static ASSISTANT: AssistantFlavor = AssistantFlavor;

pub fn flavor_for(kind: SessionKind) -> &'static dyn SessionFlavor {
    match kind {
        SessionKind::Shell => &SHELL,
        SessionKind::Assistant => &ASSISTANT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_never_defers() {
        let flavor = flavor_for(SessionKind::Shell);
        assert!(!flavor.opens_prompt("╭──── Do you want to", true));
    }

    #[test]
    fn assistant_box_needs_quiet_interval() {
        let flavor = flavor_for(SessionKind::Assistant);
        assert_eq!(flavor.kind(), SessionKind::Assistant);
        assert!(flavor.opens_prompt("╭──────╮\n│ Edit file? │", true));
        assert!(!flavor.opens_prompt("╭──────╮", false));
        assert!(!flavor.opens_prompt("plain output", true));
    }

    #[test]
    fn confirmation_text_opens_prompt_mid_stream() {
        let flavor = flavor_for(SessionKind::Assistant);
        assert!(flavor.opens_prompt("Do you want to proceed?", false));
        assert!(flavor.opens_prompt("Overwrite? [y/N]", false));
        assert!(flavor.opens_prompt("│ ❯ 1. Yes │", true));
    }

    #[test]
    fn assistant_prompt_closes_on_bottom_edge() {
        let flavor = flavor_for(SessionKind::Assistant);
        assert!(flavor.closes_prompt("╰──────╯"));
        assert!(!flavor.closes_prompt("│ ❯ 1. Yes │"));
    }
}
