//! Session records mirrored from the host.

pub mod lifecycle;
pub mod registry;

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub use registry::{SessionRegistry, Upsert};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Shell,
    Assistant,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Shell => "shell",
            SessionKind::Assistant => "assistant",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side mirror of one host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub working_directory: String,
    pub display_name: String,
    /// Only present while `status` is [`SessionStatus::Connected`].
    pub pid: Option<u32>,
}

impl Session {
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }
}

/// Partial session record as reported by the host. Absent fields leave the
/// mirrored value untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SessionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl SessionSummary {
    pub fn new(id: impl Into<String>, status: SessionStatus) -> Self {
        Self {
            id: id.into(),
            status,
            kind: None,
            working_directory: None,
            display_name: None,
            pid: None,
        }
    }

    pub fn kind(mut self, kind: SessionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn working_directory(mut self, cwd: impl Into<String>) -> Self {
        self.working_directory = Some(cwd.into());
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        SessionSummary::new(session.id.clone(), session.status)
            .kind(session.kind)
            .working_directory(session.working_directory.clone())
            .display_name(session.display_name.clone())
            .pid(session.pid)
    }
}
