//! Typed request/response calls to the session host.
//!
//! Requests go out on `host:request` with a numeric id; the host answers on
//! `host:reply` with the same id. Every call is bounded by a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use transport_bus::BusError;

use crate::protocol::{events, HostCall, HostReply, HostRequest, ReplyBody};
use crate::session::{SessionKind, SessionSummary};
use crate::sync::Snapshot;
use crate::task::TaskGuard;
use crate::telemetry;
use crate::transport::{EmitOutcome, Transport, TransportError, TransportExt};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host did not answer {call} within {timeout:?}")]
    Unresponsive {
        call: &'static str,
        timeout: Duration,
    },
    #[error("host rejected {call}: {message}")]
    Rejected { call: &'static str, message: String },
    #[error("unexpected {body} reply to {call}")]
    UnexpectedReply {
        call: &'static str,
        body: &'static str,
    },
    #[error("reply channel closed before {call} completed")]
    ChannelClosed { call: &'static str },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnResult {
    pub pid: u32,
    pub already_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub session_id: String,
    pub cwd: String,
    pub name: String,
    pub kind: SessionKind,
}

/// Operations the engine needs from the host.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResult, HostError>;
    /// Fire-and-forget keystroke delivery.
    async fn send(&self, session_id: &str, data: &[u8]) -> Result<(), HostError>;
    async fn stop(&self, session_id: &str) -> Result<(), HostError>;
    async fn buffer_snapshot(&self, session_id: &str) -> Result<Snapshot, HostError>;
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, HostError>;
    async fn configure_display_size(&self, session_id: &str, cols: u16, rows: u16)
        -> Result<(), HostError>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<HostReply>>>>;

/// [`HostApi`] over a [`Transport`].
pub struct HostClient {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
    _replies: TaskGuard,
}

impl HostClient {
    /// Must be called inside a Tokio runtime; spawns the reply listener.
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let mut replies = transport.on(events::HOST_REPLY);
        let routes = pending.clone();
        let listener = TaskGuard::spawn(async move {
            loop {
                let message = match replies.recv().await {
                    Ok(message) => message,
                    Err(BusError::Lagged(skipped)) => {
                        warn!(target = "tide::host", skipped, "reply listener lagged");
                        continue;
                    }
                    Err(BusError::Closed) => break,
                };
                let reply: HostReply = match serde_json::from_slice(&message.payload) {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(target = "tide::host", error = %err, "malformed host reply");
                        continue;
                    }
                };
                let waiter = routes.lock().remove(&reply.request_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => {
                        debug!(target = "tide::host", request_id = reply.request_id, "late reply discarded");
                    }
                }
            }
        });
        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            _replies: listener,
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    async fn call(&self, call: HostCall) -> Result<ReplyBody, HostError> {
        let name = call.name();
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let request = HostRequest {
            request_id: Some(request_id),
            call,
        };
        match self.transport.emit_json(events::HOST_REQUEST, &request) {
            Ok(EmitOutcome::Sent) => {
                trace!(
                    target = "tide::host",
                    request_id,
                    call = name,
                    session_id = request.call.session_id().unwrap_or("-"),
                    "request sent"
                );
            }
            Ok(EmitOutcome::Queued) => {
                debug!(
                    target = "tide::host",
                    request_id,
                    call = name,
                    session_id = request.call.session_id().unwrap_or("-"),
                    "request queued while disconnected"
                );
            }
            Err(err) => {
                self.pending.lock().remove(&request_id);
                return Err(err.into());
            }
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                return Err(HostError::ChannelClosed { call: name });
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                warn!(target = "tide::host", request_id, call = name, timeout = ?self.timeout, "host call timed out");
                return Err(HostError::Unresponsive {
                    call: name,
                    timeout: self.timeout,
                });
            }
        };

        match (reply.result, reply.error) {
            (_, Some(message)) => Err(HostError::Rejected { call: name, message }),
            (Some(body), None) => Ok(body),
            (None, None) => Ok(ReplyBody::Ack),
        }
    }

    async fn expect_ack(&self, call: HostCall) -> Result<(), HostError> {
        let name = call.name();
        match self.call(call).await? {
            ReplyBody::Ack => Ok(()),
            other => Err(HostError::UnexpectedReply {
                call: name,
                body: other.name(),
            }),
        }
    }
}

#[async_trait]
impl HostApi for HostClient {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResult, HostError> {
        let call = HostCall::Spawn {
            session_id: request.session_id,
            cwd: request.cwd,
            name: request.name,
            kind: request.kind,
        };
        match self.call(call).await? {
            ReplyBody::Spawned {
                pid,
                already_running,
            } => Ok(SpawnResult {
                pid,
                already_running,
            }),
            other => Err(HostError::UnexpectedReply {
                call: "spawn",
                body: other.name(),
            }),
        }
    }

    async fn send(&self, session_id: &str, data: &[u8]) -> Result<(), HostError> {
        let request = HostRequest {
            request_id: None,
            call: HostCall::Send {
                session_id: session_id.to_string(),
                data: data.to_vec(),
            },
        };
        self.transport.emit_json(events::HOST_REQUEST, &request)?;
        telemetry::record_bytes("input_forwarded", data.len());
        Ok(())
    }

    async fn stop(&self, session_id: &str) -> Result<(), HostError> {
        self.expect_ack(HostCall::Stop {
            session_id: session_id.to_string(),
        })
        .await
    }

    async fn buffer_snapshot(&self, session_id: &str) -> Result<Snapshot, HostError> {
        let _perf = telemetry::PerfGuard::new("snapshot_fetch");
        let call = HostCall::GetBufferSnapshot {
            session_id: session_id.to_string(),
        };
        match self.call(call).await? {
            ReplyBody::Snapshot { data } => {
                telemetry::record_bytes("snapshot_bytes", data.len());
                Ok(Snapshot::new(data))
            }
            other => Err(HostError::UnexpectedReply {
                call: "get_buffer_snapshot",
                body: other.name(),
            }),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, HostError> {
        match self.call(HostCall::ListSessions).await? {
            ReplyBody::Sessions { sessions } => Ok(sessions),
            other => Err(HostError::UnexpectedReply {
                call: "list_sessions",
                body: other.name(),
            }),
        }
    }

    async fn configure_display_size(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), HostError> {
        self.expect_ack(HostCall::ConfigureDisplaySize {
            session_id: session_id.to_string(),
            cols,
            rows,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::transport::{memory_pair, Credentials, MemoryPeer};

    async fn connected_client(timeout: Duration) -> (HostClient, MemoryPeer) {
        let (transport, peer) = memory_pair(16);
        transport.connect(&Credentials::default()).await.expect("connect");
        (HostClient::new(Arc::new(transport), timeout), peer)
    }

    fn request_of(frame: &Envelope) -> HostRequest {
        assert_eq!(frame.event, events::HOST_REQUEST);
        frame.decode().expect("host request")
    }

    #[test_timeout::tokio_timeout_test]
    async fn spawn_reply_is_matched_by_request_id() {
        let (client, mut peer) = connected_client(Duration::from_secs(5)).await;
        let handle = peer.handle();
        let host = tokio::spawn(async move {
            let frame = peer.next_frame().await.expect("request frame");
            let request = request_of(&frame);
            assert!(matches!(request.call, HostCall::Spawn { ref cwd, .. } if cwd == "/tmp"));
            let id = request.request_id.expect("spawn carries an id");
            handle.push(events::HOST_REPLY, &HostReply::ok(id + 100, ReplyBody::Ack));
            handle.push(
                events::HOST_REPLY,
                &HostReply::ok(id, ReplyBody::Spawned { pid: 1234, already_running: false }),
            );
        });

        let spawned = client
            .spawn(SpawnRequest {
                session_id: "s1".into(),
                cwd: "/tmp".into(),
                name: "s1".into(),
                kind: SessionKind::Shell,
            })
            .await
            .expect("spawn succeeds");
        assert_eq!(spawned.pid, 1234);
        assert_eq!(client.pending_calls(), 0);
        host.await.expect("host task");
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn silent_host_times_out() {
        let (client, _peer) = connected_client(Duration::from_secs(5)).await;
        let err = client.stop("s1").await.expect_err("no reply");
        assert!(matches!(
            err,
            HostError::Unresponsive { call: "stop", timeout } if timeout == Duration::from_secs(5)
        ));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn error_reply_maps_to_rejected() {
        let (client, mut peer) = connected_client(Duration::from_secs(5)).await;
        let handle = peer.handle();
        tokio::spawn(async move {
            let frame = peer.next_frame().await.expect("request frame");
            let id = request_of(&frame).request_id.expect("id");
            handle.push(events::HOST_REPLY, &HostReply::error(id, "no such directory"));
        });
        let err = client.buffer_snapshot("s1").await.expect_err("rejected");
        assert!(matches!(err, HostError::Rejected { call: "get_buffer_snapshot", ref message } if message == "no such directory"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_is_a_notification() {
        let (client, mut peer) = connected_client(Duration::from_secs(5)).await;
        client.send("s1", b"ls\n").await.expect("send");
        let request = request_of(&peer.next_frame().await.expect("frame"));
        assert_eq!(request.request_id, None);
        assert_eq!(
            request.call,
            HostCall::Send {
                session_id: "s1".into(),
                data: b"ls\n".to_vec()
            }
        );
        assert_eq!(client.pending_calls(), 0);
    }
}
