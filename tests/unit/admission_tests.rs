//! Unit tests for per-category admission control and FIFO queueing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_foreman::models::task::TaskCategory;
use agent_foreman::scheduler::AdmissionController;

fn controller(primary: u32, worker: u32) -> Arc<AdmissionController> {
    let ceilings = HashMap::from([
        (TaskCategory::Primary, primary),
        (TaskCategory::Worker, worker),
    ]);
    Arc::new(AdmissionController::new(&ceilings))
}

fn status_for(
    controller: &AdmissionController,
    category: TaskCategory,
) -> (u32, u32, u32) {
    let status = controller
        .status()
        .into_iter()
        .find(|s| s.category == category)
        .expect("category status");
    (status.running, status.queued, status.ceiling)
}

#[tokio::test]
async fn under_ceiling_grants_immediately() {
    let controller = controller(2, 4);

    let _p1 = controller
        .acquire(TaskCategory::Primary, "t1", None)
        .await
        .expect("grant");
    let _p2 = controller
        .acquire(TaskCategory::Primary, "t2", None)
        .await
        .expect("grant");

    assert_eq!(status_for(&controller, TaskCategory::Primary), (2, 0, 2));
}

#[tokio::test]
async fn at_ceiling_queues_fifo() {
    let controller = controller(1, 4);

    let first = controller
        .acquire(TaskCategory::Primary, "t1", None)
        .await
        .expect("grant");

    // Two more requests queue behind the ceiling of 1.
    let c2 = Arc::clone(&controller);
    let waiting_2 = tokio::spawn(async move { c2.acquire(TaskCategory::Primary, "t2", None).await });
    let c3 = Arc::clone(&controller);
    let waiting_3 = tokio::spawn(async move { c3.acquire(TaskCategory::Primary, "t3", None).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status_for(&controller, TaskCategory::Primary), (1, 2, 1));

    // Releasing the held permit grants exactly one waiter.
    first.release();
    let second = tokio::time::timeout(Duration::from_secs(1), waiting_2)
        .await
        .expect("second should be granted")
        .expect("join")
        .expect("grant");
    assert_eq!(status_for(&controller, TaskCategory::Primary), (1, 1, 1));

    second.release();
    let third = tokio::time::timeout(Duration::from_secs(1), waiting_3)
        .await
        .expect("third should be granted")
        .expect("join")
        .expect("grant");
    assert_eq!(status_for(&controller, TaskCategory::Primary), (1, 0, 1));
    third.release();

    assert_eq!(status_for(&controller, TaskCategory::Primary), (0, 0, 1));
}

#[tokio::test]
async fn categories_do_not_interfere() {
    let controller = controller(1, 2);

    let _primary = controller
        .acquire(TaskCategory::Primary, "p1", None)
        .await
        .expect("grant");

    // Worker capacity is independent of the saturated primary ceiling.
    let _w1 = controller
        .acquire(TaskCategory::Worker, "w1", None)
        .await
        .expect("grant");
    let _w2 = controller
        .acquire(TaskCategory::Worker, "w2", None)
        .await
        .expect("grant");

    assert_eq!(status_for(&controller, TaskCategory::Primary), (1, 0, 1));
    assert_eq!(status_for(&controller, TaskCategory::Worker), (2, 0, 2));
}

#[tokio::test]
async fn permit_drop_releases_capacity() {
    let controller = controller(1, 1);

    {
        let _permit = controller
            .acquire(TaskCategory::Primary, "t1", None)
            .await
            .expect("grant");
    }

    // Dropped without explicit release; capacity must be back.
    let _again = tokio::time::timeout(
        Duration::from_secs(1),
        controller.acquire(TaskCategory::Primary, "t2", None),
    )
    .await
    .expect("no wait expected")
    .expect("grant");
}

#[tokio::test]
async fn cancel_queued_removes_waiter_synchronously() {
    let controller = controller(1, 1);

    let held = controller
        .acquire(TaskCategory::Primary, "t1", None)
        .await
        .expect("grant");

    let c2 = Arc::clone(&controller);
    let waiting = tokio::spawn(async move { c2.acquire(TaskCategory::Primary, "t2", None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(controller.cancel_queued("t2"), "waiter should be removed");
    assert_eq!(status_for(&controller, TaskCategory::Primary), (1, 0, 1));

    // The cancelled wait resolves with an error, not a grant.
    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("cancelled wait must resolve")
        .expect("join");
    assert!(result.is_err(), "cancelled acquire must error");

    held.release();
}

#[tokio::test]
async fn cancel_unknown_task_is_noop() {
    let controller = controller(1, 1);
    assert!(!controller.cancel_queued("ghost"));
}

#[tokio::test]
async fn queue_wait_is_bounded_by_deadline() {
    let controller = controller(1, 1);

    let _held = controller
        .acquire(TaskCategory::Primary, "t1", None)
        .await
        .expect("grant");

    let err = controller
        .acquire(TaskCategory::Primary, "t2", Some(Duration::from_millis(200)))
        .await
        .expect_err("deadline should expire");
    assert!(err.to_string().contains("timed out"), "got {err}");

    // The expired waiter is gone from the queue.
    assert_eq!(status_for(&controller, TaskCategory::Primary), (1, 0, 1));
}

#[tokio::test]
async fn cancelled_waiter_is_skipped_when_granting() {
    let controller = controller(1, 1);

    let held = controller
        .acquire(TaskCategory::Primary, "t1", None)
        .await
        .expect("grant");

    let c2 = Arc::clone(&controller);
    let cancelled = tokio::spawn(async move { c2.acquire(TaskCategory::Primary, "t2", None).await });
    let c3 = Arc::clone(&controller);
    let survivor = tokio::spawn(async move { c3.acquire(TaskCategory::Primary, "t3", None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    controller.cancel_queued("t2");
    held.release();

    // The grant skips the cancelled waiter and lands on the survivor.
    let granted = tokio::time::timeout(Duration::from_secs(1), survivor)
        .await
        .expect("survivor should be granted")
        .expect("join")
        .expect("grant");
    granted.release();

    let result = cancelled.await.expect("join");
    assert!(result.is_err());
}
