#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use beach_tide::display::VirtualDisplays;
use beach_tide::protocol::{events, HostCall, HostReply, HostRequest, OutputEvent, RemovedEvent, ReplyBody};
use beach_tide::session::{SessionKind, SessionStatus, SessionSummary};
use beach_tide::transport::{memory_pair, Credentials, MemoryPeer, PeerHandle, Transport};
use beach_tide::{EngineConfig, EngineEvent, SessionEngine};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const FIRST_PID: u32 = 1234;

#[derive(Default)]
struct HostState {
    order: Vec<String>,
    sessions: HashMap<String, SessionSummary>,
    buffers: HashMap<String, Vec<u8>>,
    next_pid: u32,
    snapshots: HashMap<String, usize>,
    inputs: Vec<(String, Vec<u8>)>,
    resizes: Vec<(String, u16, u16)>,
    calls: Vec<&'static str>,
    spawn_failure: Option<String>,
    unresponsive: bool,
}

/// Scripted host on the far side of a memory transport.
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
    handle: PeerHandle,
    _task: Arc<JoinHandle<()>>,
}

impl FakeHost {
    pub fn start(mut peer: MemoryPeer) -> Self {
        let state = Arc::new(Mutex::new(HostState {
            next_pid: FIRST_PID,
            ..HostState::default()
        }));
        let handle = peer.handle();
        let task = {
            let state = state.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                while let Some(frame) = peer.next_frame().await {
                    if frame.event != events::HOST_REQUEST {
                        continue;
                    }
                    let request: HostRequest = frame.decode().expect("host request");
                    let reply = serve(&state, request);
                    if let Some(reply) = reply {
                        handle.push(events::HOST_REPLY, &reply);
                    }
                }
            })
        };
        Self {
            state,
            handle,
            _task: Arc::new(task),
        }
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Appends to the host buffer and streams the chunk to the client.
    /// While the link is down only the buffer changes.
    pub fn emit_output(&self, session_id: &str, data: &[u8]) -> bool {
        self.state
            .lock()
            .buffers
            .entry(session_id.to_string())
            .or_default()
            .extend_from_slice(data);
        self.handle.push(
            events::SESSION_OUTPUT,
            &OutputEvent {
                session_id: session_id.to_string(),
                data: data.to_vec(),
            },
        )
    }

    /// Changes the host buffer without streaming anything.
    pub fn set_buffer(&self, session_id: &str, data: &[u8]) {
        self.state
            .lock()
            .buffers
            .insert(session_id.to_string(), data.to_vec());
    }

    pub fn buffer(&self, session_id: &str) -> Vec<u8> {
        self.state
            .lock()
            .buffers
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot_count(&self, session_id: &str) -> usize {
        self.state.lock().snapshots.get(session_id).copied().unwrap_or(0)
    }

    pub fn inputs(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().inputs.clone()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.state.lock().resizes.clone()
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state.lock().calls.iter().filter(|call| **call == name).count()
    }

    pub fn fail_spawns(&self, message: Option<&str>) {
        self.state.lock().spawn_failure = message.map(str::to_string);
    }

    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().unresponsive = unresponsive;
    }

    /// Registers a session as if another client had created it.
    pub fn add_session(&self, summary: SessionSummary) {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&summary.id) {
            state.order.push(summary.id.clone());
        }
        state.sessions.insert(summary.id.clone(), summary);
    }

    /// The process exited on the host side.
    pub fn exit_session(&self, session_id: &str) {
        let summary = {
            let mut state = self.state.lock();
            let Some(summary) = state.sessions.get_mut(session_id) else {
                return;
            };
            summary.status = SessionStatus::Disconnected;
            summary.pid = None;
            summary.clone()
        };
        self.handle.push(events::SESSION_STATUS, &summary);
    }

    /// The host brought the process back without being asked.
    pub fn revive_session(&self, session_id: &str, pid: u32) {
        let summary = {
            let mut state = self.state.lock();
            let Some(summary) = state.sessions.get_mut(session_id) else {
                return;
            };
            summary.status = SessionStatus::Connected;
            summary.pid = Some(pid);
            summary.clone()
        };
        self.handle.push(events::SESSION_STATUS, &summary);
    }

    pub fn remove_session(&self, session_id: &str) {
        {
            let mut state = self.state.lock();
            state.sessions.remove(session_id);
            state.order.retain(|id| id != session_id);
        }
        self.handle.push(
            events::SESSION_REMOVED,
            &RemovedEvent {
                session_id: session_id.to_string(),
            },
        );
    }

    pub fn disconnect(&self) {
        self.handle.drop_link();
    }

    pub fn reconnect(&self) {
        self.handle.restore_link();
    }
}

fn serve(state: &Mutex<HostState>, request: HostRequest) -> Option<HostReply> {
    let mut state = state.lock();
    state.calls.push(request.call.name());
    if let HostCall::Send { session_id, data } = &request.call {
        state.inputs.push((session_id.clone(), data.clone()));
        return None;
    }
    let request_id = request.request_id?;
    if state.unresponsive {
        return None;
    }
    let reply = match request.call {
        HostCall::Spawn {
            session_id,
            cwd,
            name,
            kind,
        } => {
            if let Some(message) = state.spawn_failure.clone() {
                return Some(HostReply::error(request_id, message));
            }
            if let Some(existing) = state.sessions.get(&session_id) {
                if existing.status == SessionStatus::Connected {
                    let pid = existing.pid.unwrap_or_default();
                    return Some(HostReply::ok(
                        request_id,
                        ReplyBody::Spawned {
                            pid,
                            already_running: true,
                        },
                    ));
                }
            }
            let pid = state.next_pid;
            state.next_pid += 1;
            if !state.sessions.contains_key(&session_id) {
                state.order.push(session_id.clone());
            }
            state.buffers.entry(session_id.clone()).or_default();
            state.sessions.insert(
                session_id.clone(),
                SessionSummary::new(session_id, SessionStatus::Connected)
                    .kind(kind)
                    .working_directory(cwd)
                    .display_name(name)
                    .pid(Some(pid)),
            );
            ReplyBody::Spawned {
                pid,
                already_running: false,
            }
        }
        HostCall::Send { .. } => return None,
        HostCall::Stop { session_id } => match state.sessions.get_mut(&session_id) {
            Some(summary) => {
                summary.status = SessionStatus::Disconnected;
                summary.pid = None;
                ReplyBody::Ack
            }
            None => return Some(HostReply::error(request_id, "unknown session")),
        },
        HostCall::GetBufferSnapshot { session_id } => {
            *state.snapshots.entry(session_id.clone()).or_default() += 1;
            match state.buffers.get(&session_id) {
                Some(data) => ReplyBody::Snapshot { data: data.clone() },
                None => return Some(HostReply::error(request_id, "unknown session")),
            }
        }
        HostCall::ListSessions => ReplyBody::Sessions {
            sessions: state
                .order
                .iter()
                .filter_map(|id| state.sessions.get(id).cloned())
                .collect(),
        },
        HostCall::ConfigureDisplaySize {
            session_id,
            cols,
            rows,
        } => {
            state.resizes.push((session_id, cols, rows));
            ReplyBody::Ack
        }
    };
    Some(HostReply::ok(request_id, reply))
}

pub struct Harness {
    pub engine: SessionEngine,
    pub host: FakeHost,
    pub displays: VirtualDisplays,
    pub transport: Arc<dyn Transport>,
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let (transport, peer) = memory_pair(config.outbound_buffer);
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let host = FakeHost::start(peer);
    transport
        .connect(&Credentials::default())
        .await
        .expect("memory transport connects");
    let displays = VirtualDisplays::new();
    let engine = SessionEngine::builder(transport.clone())
        .config(config)
        .display_factory(displays.factory())
        .build();
    Harness {
        engine,
        host,
        displays,
        transport,
    }
}

impl Harness {
    pub async fn create_shell(&self, cwd: &str) -> String {
        self.engine
            .create(SessionKind::Shell, cwd, None)
            .await
            .expect("create succeeds")
            .id
    }

    pub fn screen(&self, session_id: &str) -> String {
        self.displays
            .get(session_id)
            .map(|display| display.text())
            .unwrap_or_default()
    }
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next event matching `pred`, skipping everything else.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("engine event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("expected engine event")
}
