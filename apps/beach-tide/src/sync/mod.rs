//! Keeps each client view converged on the host's buffer: live output is
//! appended as it streams in, and snapshots reconcile the view after gaps.

pub mod flavor;
pub mod output;
pub mod reconcile;
pub mod scheduler;
mod snapshot;
pub mod view;

use std::time::Duration;

use serde::Deserialize;

pub use flavor::{flavor_for, AssistantFlavor, SessionFlavor, ShellFlavor};
pub use output::ScrollAction;
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use scheduler::RefreshScheduler;
pub use snapshot::{Snapshot, SnapshotHash};
pub use view::ClientSessionView;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet window before a scheduled reconcile fires.
    #[serde(rename = "debounce_ms", with = "crate::config::millis")]
    pub debounce: Duration,
    /// Refreshes wait this long after the last keystroke.
    #[serde(rename = "input_quiet_ms", with = "crate::config::millis")]
    pub input_quiet: Duration,
    /// Upper bound on how long input can hold back a pending refresh.
    #[serde(rename = "max_input_defer_ms", with = "crate::config::millis")]
    pub max_input_defer: Duration,
    /// Output silence after which a prompt marker is trusted.
    #[serde(rename = "prompt_quiet_ms", with = "crate::config::millis")]
    pub prompt_quiet: Duration,
    #[serde(rename = "continuous_refresh_ms", with = "crate::config::millis::option")]
    pub continuous_refresh: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(75),
            input_quiet: Duration::from_millis(150),
            max_input_defer: Duration::from_secs(1),
            prompt_quiet: Duration::from_millis(250),
            continuous_refresh: None,
        }
    }
}
