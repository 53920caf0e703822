//! Wire format shared with the session host.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{SessionKind, SessionSummary};

pub mod events {
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const RECONNECT_FAILED: &str = "reconnect_failed";

    pub const HOST_REQUEST: &str = "host:request";
    pub const HOST_REPLY: &str = "host:reply";

    pub const SESSION_OUTPUT: &str = "session:output";
    pub const SESSION_STATUS: &str = "session:status";
    pub const SESSION_REMOVED: &str = "session:removed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn encode<T: Serialize>(event: impl Into<String>, payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HostCall {
    Spawn {
        session_id: String,
        cwd: String,
        name: String,
        kind: SessionKind,
    },
    Send {
        session_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Stop {
        session_id: String,
    },
    GetBufferSnapshot {
        session_id: String,
    },
    ListSessions,
    ConfigureDisplaySize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
}

impl HostCall {
    pub fn name(&self) -> &'static str {
        match self {
            HostCall::Spawn { .. } => "spawn",
            HostCall::Send { .. } => "send",
            HostCall::Stop { .. } => "stop",
            HostCall::GetBufferSnapshot { .. } => "get_buffer_snapshot",
            HostCall::ListSessions => "list_sessions",
            HostCall::ConfigureDisplaySize { .. } => "configure_display_size",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            HostCall::Spawn { session_id, .. }
            | HostCall::Send { session_id, .. }
            | HostCall::Stop { session_id }
            | HostCall::GetBufferSnapshot { session_id }
            | HostCall::ConfigureDisplaySize { session_id, .. } => Some(session_id),
            HostCall::ListSessions => None,
        }
    }
}

/// A call on the `host:request` event. Notifications carry no id and get no
/// reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub call: HostCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    Spawned {
        pid: u32,
        #[serde(default)]
        already_running: bool,
    },
    Ack,
    Snapshot {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Sessions {
        sessions: Vec<SessionSummary>,
    },
}

impl ReplyBody {
    pub fn name(&self) -> &'static str {
        match self {
            ReplyBody::Spawned { .. } => "spawned",
            ReplyBody::Ack => "ack",
            ReplyBody::Snapshot { .. } => "snapshot",
            ReplyBody::Sessions { .. } => "sessions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReply {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ReplyBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostReply {
    pub fn ok(request_id: u64, body: ReplyBody) -> Self {
        Self {
            request_id,
            result: Some(body),
            error: None,
        }
    }

    pub fn error(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            result: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub session_id: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedEvent {
    pub session_id: String,
}

/// Base64 encoding for byte payloads inside JSON.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
