mod support;

use std::time::Duration;

use beach_tide::protocol::events;
use beach_tide::session::{SessionKind, SessionStatus, SessionSummary};
use beach_tide::{EngineConfig, EngineError, EngineEvent};
use support::{eventually, harness, harness_with, next_event, FIRST_PID};

#[test_timeout::tokio_timeout_test]
async fn create_announces_connecting_then_connected() {
    let h = harness().await;
    let mut events = h.engine.subscribe();
    let session = h
        .engine
        .create(SessionKind::Assistant, "/home/dev/app", Some("review".into()))
        .await
        .expect("create");

    let first = next_event(&mut events, |e| matches!(e, EngineEvent::SessionUpdated(_))).await;
    let EngineEvent::SessionUpdated(connecting) = first else { unreachable!() };
    assert_eq!(connecting.status, SessionStatus::Connecting);
    assert_eq!(connecting.pid, None);

    let second = next_event(&mut events, |e| matches!(e, EngineEvent::SessionUpdated(_))).await;
    let EngineEvent::SessionUpdated(connected) = second else { unreachable!() };
    assert_eq!(connected.status, SessionStatus::Connected);
    assert_eq!(connected.pid, Some(FIRST_PID));

    assert_eq!(session.kind, SessionKind::Assistant);
    assert_eq!(session.display_name, "review");
    assert_eq!(session.working_directory, "/home/dev/app");
    assert_eq!(h.engine.sessions().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn stop_then_start_respawns_in_same_directory() {
    let h = harness().await;
    let id = h.create_shell("/var/log").await;

    h.host.set_buffer(&id, b"tail -f syslog\n");
    h.engine.reconcile(&id).await.expect("reconcile");

    let stopped = h.engine.stop(&id).await.expect("stop");
    assert_eq!(stopped.status, SessionStatus::Disconnected);
    assert_eq!(stopped.pid, None);
    let display = h.displays.get(&id).expect("display");
    let writes = display.mutation_count();
    assert!(matches!(
        h.engine.forward(&id, b"x").await,
        Err(EngineError::SessionNotConnected(_))
    ));
    assert!(matches!(
        h.engine.resize(&id, 100, 30).await,
        Err(EngineError::SessionNotConnected(_))
    ));
    assert_eq!(display.mutation_count(), writes);
    assert_eq!(display.text(), "tail -f syslog\n");
    assert!(h.host.inputs().is_empty());

    h.host.set_buffer(&id, b"restarted\n");
    let started = h.engine.start(&id).await.expect("start");
    assert_eq!(started.status, SessionStatus::Connected);
    assert_eq!(started.pid, Some(FIRST_PID + 1));
    assert_eq!(started.working_directory, "/var/log");
    assert_eq!(h.screen(&id), "restarted\n");

    h.engine.forward(&id, b"pwd\n").await.expect("forward after start");
    eventually("input delivered", || h.host.inputs().len() == 1).await;
}

#[test_timeout::tokio_timeout_test]
async fn transitions_are_checked() {
    let h = harness().await;
    let id = h.create_shell("/tmp").await;

    let err = h.engine.start(&id).await.expect_err("already running");
    assert!(matches!(
        err,
        EngineError::InvalidTransition { operation: "start", status: SessionStatus::Connected, .. }
    ));

    h.engine.stop(&id).await.expect("stop");
    let err = h.engine.stop(&id).await.expect_err("already stopped");
    assert!(matches!(err, EngineError::InvalidTransition { operation: "stop", .. }));

    assert!(matches!(
        h.engine.stop("missing").await,
        Err(EngineError::UnknownSession(_))
    ));
}

#[test_timeout::tokio_timeout_test]
async fn removed_sessions_stay_removed() {
    let h = harness().await;
    let id = h.create_shell("/tmp").await;
    let mut events = h.engine.subscribe();

    h.engine.remove(&id).await.expect("remove");
    next_event(&mut events, |e| matches!(e, EngineEvent::SessionRemoved { .. })).await;
    assert_eq!(h.host.calls("stop"), 1, "running session is stopped first");
    assert!(h.engine.session(&id).is_none());
    assert!(h.engine.view(&id).is_none());

    h.engine.remove(&id).await.expect("remove is idempotent");
    assert_eq!(h.host.calls("stop"), 1);
    assert!(matches!(h.engine.start(&id).await, Err(EngineError::SessionRemoved(_))));
    assert!(matches!(
        h.engine.forward(&id, b"ls\n").await,
        Err(EngineError::SessionRemoved(_))
    ));

    h.host.handle().push(
        events::SESSION_STATUS,
        &SessionSummary::new(id.clone(), SessionStatus::Connected).pid(Some(9)),
    );
    h.host.add_session(SessionSummary::new(id.clone(), SessionStatus::Connected).pid(Some(9)));
    h.engine.refresh_sessions().await.expect("refresh");
    assert!(h.engine.session(&id).is_none(), "late host reports do not resurrect");
}

#[test_timeout::tokio_timeout_test]
async fn rejected_spawn_leaves_session_disconnected() {
    let h = harness().await;
    h.host.fail_spawns(Some("no such directory: /nope"));
    let mut events = h.engine.subscribe();

    let err = h
        .engine
        .create(SessionKind::Shell, "/nope", None)
        .await
        .expect_err("spawn rejected");
    let EngineError::SpawnFailed { id, message } = err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(message, "no such directory: /nope");
    assert_eq!(
        h.engine.session(&id).map(|s| s.status),
        Some(SessionStatus::Disconnected)
    );
    let reported = next_event(&mut events, |e| matches!(e, EngineEvent::SessionError { .. })).await;
    assert_eq!(reported.session_id(), Some(id.as_str()));

    h.host.fail_spawns(None);
    let started = h.engine.start(&id).await.expect("retry start");
    assert_eq!(started.status, SessionStatus::Connected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn silent_host_surfaces_unresponsive() {
    let config = EngineConfig {
        host_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    };
    let h = harness_with(config).await;
    h.host.set_unresponsive(true);

    let err = h
        .engine
        .create(SessionKind::Shell, "/tmp", None)
        .await
        .expect_err("no reply");
    assert!(matches!(
        err,
        EngineError::HostUnresponsive { call: "spawn", timeout } if timeout == Duration::from_secs(2)
    ));
    assert!(err.is_transient());
    let sessions = h.engine.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Connecting);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn concurrent_lifecycle_calls_are_rejected() {
    let h = harness().await;
    let id = h.create_shell("/tmp").await;
    h.host.set_unresponsive(true);

    let engine = h.engine.clone();
    let first = {
        let id = id.clone();
        tokio::spawn(async move { engine.stop(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(
        h.engine.stop(&id).await,
        Err(EngineError::OperationPending(_))
    ));
    assert!(matches!(
        h.engine.remove(&id).await,
        Err(EngineError::OperationPending(_))
    ));

    let outcome = first.await.expect("join");
    assert!(matches!(outcome, Err(EngineError::HostUnresponsive { call: "stop", .. })));
    assert_eq!(
        h.engine.session(&id).map(|s| s.status),
        Some(SessionStatus::Connected)
    );

    h.host.set_unresponsive(false);
    h.engine.stop(&id).await.expect("stop once the host answers");
}

#[test_timeout::tokio_timeout_test]
async fn host_side_exit_and_removal_are_mirrored() {
    let h = harness().await;
    let exiting = h.create_shell("/a").await;
    let doomed = h.create_shell("/b").await;
    let mut events = h.engine.subscribe();

    h.host.set_buffer(&exiting, b"bye\n");
    h.engine.reconcile(&exiting).await.expect("reconcile");
    h.host.exit_session(&exiting);
    eventually("exit mirrored", || {
        h.engine.session(&exiting).map(|s| s.status) == Some(SessionStatus::Disconnected)
    })
    .await;
    let display = h.displays.get(&exiting).expect("display");
    let writes = display.mutation_count();
    assert!(matches!(
        h.engine.forward(&exiting, b"x").await,
        Err(EngineError::SessionNotConnected(_))
    ));
    assert_eq!(display.mutation_count(), writes);
    assert_eq!(display.text(), "bye\n");

    h.host.remove_session(&doomed);
    let removed = next_event(&mut events, |e| matches!(e, EngineEvent::SessionRemoved { .. })).await;
    assert_eq!(removed.session_id(), Some(doomed.as_str()));
    assert!(h.engine.session(&doomed).is_none());
}

#[test_timeout::tokio_timeout_test]
async fn rename_updates_display_name() {
    let h = harness().await;
    let id = h.create_shell("/tmp").await;
    let renamed = h.engine.rename(&id, "build box").expect("rename");
    assert_eq!(renamed.display_name, "build box");
    assert!(matches!(
        h.engine.rename("missing", "x"),
        Err(EngineError::UnknownSession(_))
    ));
}
