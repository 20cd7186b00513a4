//! Unit tests for the event hub: seq assignment, history replay, fan-out,
//! lag cut-off, and active-run tracking.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use agent_foreman::hub::EventHub;
use agent_foreman::models::event::{EventKind, RawEvent, StreamChannel};
use agent_foreman::AppError;

fn stream_event(session: &str, run: &str, line: &str) -> RawEvent {
    RawEvent::new(
        session,
        run,
        EventKind::Stream {
            line: line.into(),
            channel: StreamChannel::Primary,
        },
    )
}

#[test]
fn seq_starts_at_one_and_increments_per_run() {
    let hub = EventHub::new(64, 64);

    let first = hub.publish(stream_event("s1", "r1", "a"));
    let second = hub.publish(stream_event("s1", "r1", "b"));
    let other_run = hub.publish(stream_event("s1", "r2", "c"));

    assert_eq!(first.seq, 1);
    assert_eq!(second.seq, 2);
    // A fresh run gets its own ordering scope.
    assert_eq!(other_run.seq, 1);
}

#[test]
fn envelope_metadata_is_hub_assigned() {
    let hub = EventHub::new(64, 64);
    let envelope = hub.publish(stream_event("s1", "r1", "a"));

    assert!(!envelope.event_id.is_empty());
    assert_eq!(envelope.session_id, "s1");
    assert_eq!(envelope.run_id, "r1");
}

#[tokio::test]
async fn concurrent_producers_get_unique_contiguous_seq() {
    let hub = Arc::new(EventHub::new(128, 128));

    let mut handles = Vec::new();
    for i in 0..50_u32 {
        let hub = Arc::clone(&hub);
        handles.push(tokio::spawn(async move {
            hub.publish(stream_event("s1", "shared-run", &format!("line {i}")))
                .seq
        }));
    }

    let mut seqs = HashSet::new();
    for handle in handles {
        seqs.insert(handle.await.expect("producer task"));
    }

    // 50 events: unique, contiguous 1..=50, no duplicates.
    assert_eq!(seqs.len(), 50);
    assert_eq!(seqs.iter().min(), Some(&1));
    assert_eq!(seqs.iter().max(), Some(&50));
}

#[tokio::test]
async fn subscriber_observes_events_in_seq_order() {
    let hub = EventHub::new(64, 64);
    let mut rx = hub.subscribe();

    for i in 0..10_u32 {
        hub.publish(stream_event("s1", "r1", &format!("line {i}")));
    }

    let mut last_seq = 0;
    for _ in 0..10 {
        let envelope = rx.recv().await.expect("event");
        assert_eq!(envelope.seq, last_seq + 1, "seq must be gapless");
        last_seq = envelope.seq;
    }
}

#[tokio::test]
async fn lagging_subscriber_is_cut_off() {
    let hub = EventHub::new(64, 4);
    let mut rx = hub.subscribe();

    // Overrun the subscriber's buffer without draining it.
    for i in 0..20_u32 {
        hub.publish(stream_event("s1", "r1", &format!("line {i}")));
    }

    let result = rx.recv().await;
    assert!(
        matches!(result, Err(RecvError::Lagged(_))),
        "expected lag cut-off, got {result:?}"
    );
}

#[test]
fn history_replays_since_seq() {
    let hub = EventHub::new(64, 64);
    for i in 0..5_u32 {
        hub.publish(stream_event("s1", "r1", &format!("line {i}")));
    }

    let replay = hub.history("s1", 2);
    let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![3, 4, 5]);

    assert!(hub.history("s1", 5).is_empty());
    assert_eq!(hub.history("s1", 0).len(), 5);
}

#[test]
fn history_for_unknown_session_is_empty() {
    let hub = EventHub::new(64, 64);
    assert!(hub.history("nope", 0).is_empty());
}

#[test]
fn history_buffer_is_bounded_evicting_oldest() {
    let hub = EventHub::new(3, 64);
    for i in 0..10_u32 {
        hub.publish(stream_event("s1", "r1", &format!("line {i}")));
    }

    let replay = hub.history("s1", 0);
    let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    // Only the newest three survive; seq keeps counting regardless.
    assert_eq!(seqs, vec![8, 9, 10]);
}

#[test]
fn history_spans_runs_of_one_session() {
    let hub = EventHub::new(64, 64);
    hub.publish(stream_event("s1", "r1", "first attempt"));
    hub.publish(stream_event("s1", "r2", "second attempt"));
    hub.publish(stream_event("other", "r9", "unrelated"));

    let replay = hub.history("s1", 0);
    assert_eq!(replay.len(), 2);
    assert!(replay.iter().all(|e| e.session_id == "s1"));
}

// ── Ingest boundary ──────────────────────────────────────────────────────────

#[test]
fn ingest_rejects_empty_ids() {
    let hub = EventHub::new(64, 64);

    let err = hub
        .ingest(stream_event("", "r1", "x"))
        .expect_err("empty session_id must be rejected");
    assert!(matches!(err, AppError::Ingest(_)), "got {err:?}");

    // Rejected events never reach history.
    assert!(hub.history("", 0).is_empty());
}

#[test]
fn ingest_accepts_valid_events() {
    let hub = EventHub::new(64, 64);
    let envelope = hub
        .ingest(stream_event("s1", "r1", "x"))
        .expect("valid event should be accepted");
    assert_eq!(envelope.seq, 1);
}

// ── Active-run tracking for heartbeats ───────────────────────────────────────

#[test]
fn runs_are_active_between_started_and_terminal() {
    let hub = EventHub::new(64, 64);
    assert!(hub.active_runs().is_empty());

    hub.publish(RawEvent::new(
        "s1",
        "r1",
        EventKind::Started {
            task_summary: "work".into(),
            resumed_from: None,
        },
    ));
    assert_eq!(hub.active_runs().len(), 1);

    hub.publish(stream_event("s1", "r1", "output"));
    assert_eq!(hub.active_runs().len(), 1);

    hub.publish(RawEvent::new(
        "s1",
        "r1",
        EventKind::Completed {
            exit_code: 0,
            elapsed_seconds: 0.5,
            message: None,
        },
    ));
    assert!(hub.active_runs().is_empty());
}

#[test]
fn error_event_also_deactivates_run() {
    let hub = EventHub::new(64, 64);
    hub.publish(RawEvent::new(
        "s1",
        "r1",
        EventKind::Started {
            task_summary: "work".into(),
            resumed_from: None,
        },
    ));
    hub.publish(RawEvent::new(
        "s1",
        "r1",
        EventKind::Error {
            message: "exited with code 1".into(),
            will_retry: true,
        },
    ));
    assert!(hub.active_runs().is_empty());
}
