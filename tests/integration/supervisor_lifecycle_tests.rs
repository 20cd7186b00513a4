//! Integration tests driving real `sh` child processes through the
//! supervisor: completion, streaming, retries, stop, idle, timeout,
//! resume, and session rebinding.

#![cfg(unix)]

use std::time::Duration;

use agent_foreman::models::event::{EventKind, StreamChannel};
use agent_foreman::models::session::SessionState;
use agent_foreman::models::task::TaskCategory;
use agent_foreman::supervisor::OutcomeStatus;
use agent_foreman::AppError;

use super::test_helpers::{
    build_rig, collect_until_terminal, shell_task, test_config,
};

const TERMINAL_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn successful_process_completes_with_streams() {
    let temp = tempfile::tempdir().expect("tempdir");
    let rig = build_rig(test_config(temp.path()));
    let mut rx = rig.hub.subscribe();

    let task = shell_task(
        "t1",
        TaskCategory::Primary,
        0,
        "echo hello from agent\necho diagnostics >&2\nexit 0",
    );
    let handle = rig.supervisor.start(&task);
    let session_id = handle.session_id.clone();

    let outcome = handle.wait().await.expect("outcome");
    assert_eq!(outcome.status, OutcomeStatus::Done);
    assert_eq!(outcome.exit_code, Some(0));

    // Session record: done, pid cleared, exit code recorded.
    let session = rig.store.read(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Done);
    assert_eq!(session.pid, None);
    assert_eq!(session.exit_code, Some(0));
    assert!(session.elapsed_seconds.is_some());
    assert!(session.pid_state_consistent());

    // Events: one started, stream lines from both channels, one completed.
    let events = collect_until_terminal(&mut rx, TERMINAL_DEADLINE).await;
    let started: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Started { .. }))
        .collect();
    assert_eq!(started.len(), 1);

    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::Stream { ref line, channel: StreamChannel::Primary } if line == "hello from agent"
    )));
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::Stream { ref line, channel: StreamChannel::Diagnostic } if line == "diagnostics"
    )));

    let terminal = events.last().expect("terminal event");
    assert!(matches!(
        terminal.kind,
        EventKind::Completed { exit_code: 0, .. }
    ));
}

#[tokio::test]
async fn crash_is_retried_with_same_session_and_fresh_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let rig = build_rig(test_config(temp.path()));
    let mut rx = rig.hub.subscribe();

    let mut task = shell_task("t1", TaskCategory::Primary, 0, "exit 1");
    task.max_retries = 2;

    let handle = rig.supervisor.start(&task);
    let session_id = handle.session_id.clone();
    let outcome = handle.wait().await.expect("outcome");

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.exit_code, Some(1));

    let events = collect_until_terminal(&mut rx, TERMINAL_DEADLINE).await;

    // Exactly max_retries additional attempts: 3 started events total.
    let started: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Started { .. }))
        .collect();
    assert_eq!(started.len(), 3, "one initial attempt plus two retries");

    // Same session across attempts, distinct run id per attempt.
    assert!(started.iter().all(|e| e.session_id == session_id));
    let run_ids: std::collections::HashSet<&str> =
        started.iter().map(|e| e.run_id.as_str()).collect();
    assert_eq!(run_ids.len(), 3, "every attempt gets a fresh run_id");

    // Two retried errors, then a single lineage-terminal error.
    let retried = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Error { will_retry: true, .. }))
        .count();
    let terminal = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Error { will_retry: false, .. }))
        .count();
    assert_eq!(retried, 2);
    assert_eq!(terminal, 1);

    // Retries exhausted: session failed with the last error in message.
    let session = rig.store.read(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.pid, None);
    assert!(
        session
            .message
            .as_deref()
            .is_some_and(|m| m.contains("retries exhausted")),
        "got {:?}",
        session.message
    );
}

#[tokio::test]
async fn soft_stop_ends_idle_without_retry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let rig = build_rig(test_config(temp.path()));
    let mut rx = rig.hub.subscribe();

    let mut task = shell_task("t1", TaskCategory::Primary, 0, "sleep 30");
    // Retries configured but a requested stop must never consume them.
    task.max_retries = 3;

    let handle = rig.supervisor.start(&task);
    let session_id = handle.session_id.clone();

    // Wait for the attempt to actually start before stopping it.
    let started = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("started event in time")
        .expect("channel open");
    assert!(matches!(started.kind, EventKind::Started { .. }));

    rig.supervisor.soft_stop(&session_id).expect("soft stop");

    let outcome = handle.wait().await.expect("outcome");
    assert_eq!(outcome.status, OutcomeStatus::Stopped);

    // Stopped, not failed — and exactly one attempt ever ran.
    let session = rig.store.read(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Idle);
    assert_eq!(session.pid, None);

    let events = collect_until_terminal(&mut rx, TERMINAL_DEADLINE).await;
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.kind, EventKind::Started { .. })),
        "no further attempts after a requested stop"
    );
}

#[tokio::test]
#[serial_test::serial]
async fn silent_process_goes_idle_with_live_pid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.supervisor.idle_seconds = 1;
    let rig = build_rig(config);

    let task = shell_task("t1", TaskCategory::Primary, 0, "sleep 3");
    let handle = rig.supervisor.start(&task);
    let session_id = handle.session_id.clone();

    // Past the idle window, before process exit: idle, process still alive.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let session = rig.store.read(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Idle);
    assert!(session.pid.is_some(), "idle is a signal, not a kill");

    // The process then finishes on its own.
    let outcome = handle.wait().await.expect("outcome");
    assert_eq!(outcome.status, OutcomeStatus::Done);
}

#[tokio::test]
async fn wall_clock_timeout_fails_distinctly() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.supervisor.timeout_seconds = 1;
    let rig = build_rig(config);
    let mut rx = rig.hub.subscribe();

    let mut task = shell_task("t1", TaskCategory::Primary, 0, "sleep 30");
    task.max_retries = 3;

    let handle = rig.supervisor.start(&task);
    let session_id = handle.session_id.clone();
    let outcome = handle.wait().await.expect("outcome");

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert!(
        outcome
            .message
            .as_deref()
            .is_some_and(|m| m.contains("timeout")),
        "timeout must be reported distinctly, got {:?}",
        outcome.message
    );

    let session = rig.store.read(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Failed);

    // A timeout is a policy stop, never retried.
    let events = collect_until_terminal(&mut rx, TERMINAL_DEADLINE).await;
    let started = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Started { .. }))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn spawn_failure_is_surfaced_not_retried() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.agent_cli = "/nonexistent/agent/binary".into();
    let rig = build_rig(config);
    let mut rx = rig.hub.subscribe();

    let mut task = shell_task("t1", TaskCategory::Primary, 0, "echo unreachable");
    task.max_retries = 5;

    let handle = rig.supervisor.start(&task);
    let session_id = handle.session_id.clone();
    let outcome = handle.wait().await.expect("outcome");

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert!(
        outcome
            .message
            .as_deref()
            .is_some_and(|m| m.contains("failed to spawn")),
        "got {:?}",
        outcome.message
    );

    // Durable failed record even though no process ever ran.
    let session = rig.store.read(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.pid, None);

    // Single terminal error, no retries.
    let events = collect_until_terminal(&mut rx, TERMINAL_DEADLINE).await;
    let errors = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Error { .. }))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn resume_reuses_session_with_fresh_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let rig = build_rig(test_config(temp.path()));
    let mut rx = rig.hub.subscribe();

    let task = shell_task("t1", TaskCategory::Primary, 0, "echo first pass");
    let handle = rig.supervisor.start(&task);
    let outcome = handle.wait().await.expect("outcome");
    let session_id = outcome.session_id.clone();
    assert_eq!(outcome.status, OutcomeStatus::Done);

    let first_events = collect_until_terminal(&mut rx, TERMINAL_DEADLINE).await;
    let first_run = first_events
        .iter()
        .find(|e| matches!(e.kind, EventKind::Started { .. }))
        .expect("first started")
        .run_id
        .clone();

    // Resume the finished session with a new payload.
    let handle = rig
        .supervisor
        .resume(&session_id, "echo second pass")
        .await
        .expect("resume");
    let outcome = handle.wait().await.expect("outcome");
    assert_eq!(outcome.status, OutcomeStatus::Done);
    assert_eq!(outcome.session_id, session_id, "session id is stable");

    let second_events = collect_until_terminal(&mut rx, TERMINAL_DEADLINE).await;
    let second_started = second_events
        .iter()
        .find(|e| matches!(e.kind, EventKind::Started { .. }))
        .expect("second started");

    assert_eq!(second_started.session_id, session_id);
    assert_ne!(second_started.run_id, first_run, "fresh run_id per attempt");

    // Continuity: the new attempt carries the previous summary.
    assert!(matches!(
        second_started.kind,
        EventKind::Started { resumed_from: Some(ref prev), .. } if prev == "echo first pass"
    ));
}

#[tokio::test]
async fn resume_unknown_session_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let rig = build_rig(test_config(temp.path()));

    let err = rig
        .supervisor
        .resume("ghost", "echo x")
        .await
        .expect_err("unknown session must not resume");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn announced_session_id_rebinds_the_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let rig = build_rig(test_config(temp.path()));

    let task = shell_task(
        "t1",
        TaskCategory::Primary,
        0,
        r#"echo '{"type":"session_started","session_id":"ext-123"}'
sleep 1
echo after marker"#,
    );
    let handle = rig.supervisor.start(&task);
    let provisional = handle.session_id.clone();

    let outcome = handle.wait().await.expect("outcome");
    assert_eq!(outcome.status, OutcomeStatus::Done);
    assert_eq!(outcome.session_id, "ext-123");

    // The record moved to the announced id.
    let session = rig.store.read("ext-123").await.expect("rebound session");
    assert_eq!(session.state, SessionState::Done);
    let err = rig
        .store
        .read(&provisional)
        .await
        .expect_err("provisional id should be gone");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn stopping_unknown_session_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let rig = build_rig(test_config(temp.path()));

    let err = rig
        .supervisor
        .soft_stop("ghost")
        .expect_err("no live lineage");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");

    let err = rig
        .supervisor
        .force_kill("ghost")
        .expect_err("no live lineage");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}
