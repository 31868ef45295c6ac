use crate::*;

use crucible_core::{TaskRequest, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Cancelling a running task terminates the process and publishes a
/// CANCELLED result to the owner.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_running_task() {
    let bed = testbed();

    let mut request = TaskRequest::new(SLOW, b"{\"input\":\"stall\"}".to_vec());
    request.timeout_minutes = Some(2);
    let id = request.id;

    let dispatcher = Arc::clone(&bed.dispatcher);
    let runner = tokio::spawn(async move { dispatcher.run_task(request).await });

    // Let the task get past start and into its read phase.
    tokio::time::sleep(Duration::from_millis(500)).await;
    bed.dispatcher.cancel_task(id).await;

    let result = runner.await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(result.output.is_none());
}

/// Cancelling a waiter's id never touches the shared execution; only the
/// owning execution's id reaches the process.
#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_waiter_leaves_the_shared_execution_alone() {
    let bed = testbed();

    let payload = b"{\"input\":\"shared slow\"}".to_vec();
    let mut owner_request = TaskRequest::new(SLOW, payload.clone());
    owner_request.timeout_minutes = Some(2);
    let owner_id = owner_request.id;

    let mut waiter_request = TaskRequest::new(SLOW, payload);
    waiter_request.timeout_minutes = Some(2);
    let waiter_id = waiter_request.id;
    assert_ne!(owner_id, waiter_id);

    let dispatcher = Arc::clone(&bed.dispatcher);
    let owner = tokio::spawn(async move { dispatcher.run_task(owner_request).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    let dispatcher = Arc::clone(&bed.dispatcher);
    let waiter = tokio::spawn(async move { dispatcher.run_task(waiter_request).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // "Cancel my wait" is a no-op against the process.
    bed.dispatcher.cancel_task(waiter_id).await;
    assert!(!owner.is_finished());

    // Cancelling the owning id terminates the execution; both callers
    // observe the same published CANCELLED result.
    bed.dispatcher.cancel_task(owner_id).await;
    let owner_result = owner.await.unwrap().unwrap();
    let waiter_result = waiter.await.unwrap().unwrap();
    assert_eq!(owner_result.status, TaskStatus::Cancelled);
    assert_eq!(waiter_result, owner_result);
    assert_eq!(bed.dispatcher.executions_started(), 1);
}

/// Cancel is idempotent at the dispatcher surface too: repeated and
/// post-completion cancels are silent no-ops.
#[tokio::test(flavor = "multi_thread")]
async fn repeated_and_stale_cancels_are_safe() {
    let bed = testbed();

    let mut request = TaskRequest::new(ECHO, b"{\"input\":\"quick\"}".to_vec());
    request.timeout_minutes = Some(1);
    let id = request.id;
    let result = bed.dispatcher.run_task(request).await.unwrap();
    assert_eq!(result.status, TaskStatus::Success);

    // Task already finished; unknown id never ran at all.
    bed.dispatcher.cancel_task(id).await;
    bed.dispatcher.cancel_task(id).await;
    bed.dispatcher.cancel_task(Uuid::new_v4()).await;
}
