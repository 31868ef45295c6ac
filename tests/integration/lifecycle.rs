use crate::*;

use anyhow::Result;
use crucible_core::{TaskError, TaskRequest, TaskStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The echo contract: SUCCESS with the input round-tripped unchanged.
#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trips_input() -> Result<()> {
    let bed = testbed();

    let mut request = TaskRequest::new(ECHO, b"{\"input\":\"hello\"}".to_vec());
    request.timeout_minutes = Some(1);
    request.additional_properties = Some(serde_json::json!({ "str": "abc", "num": 123 }));
    let id = request.id;

    let result = bed.dispatcher.run_task(request).await?;
    assert_eq!(result.id, id);
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.output.as_deref(), Some(&b"{\"input\":\"hello\"}"[..]));
    assert_eq!(
        result.additional_properties,
        Some(serde_json::json!({ "str": "abc", "num": 123 }))
    );
    assert_eq!(bed.dispatcher.executions_started(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stdout_and_stderr_are_captured() -> Result<()> {
    let bed = testbed();

    let mut request = TaskRequest::new(ECHO, b"{\"input\":\"capture me\"}".to_vec());
    request.timeout_minutes = Some(1);
    let result = bed.dispatcher.run_task(request).await?;
    assert!(result.stdout.contains("echoing one frame"), "stdout: {}", result.stdout);

    let mut request = TaskRequest::new(FAIL, b"{\"input\":\"x\"}".to_vec());
    request.timeout_minutes = Some(1);
    let result = bed.dispatcher.run_task(request).await?;
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.output.is_none());
    assert!(
        result.stderr.contains("this task always fails"),
        "stderr: {}",
        result.stderr
    );
    Ok(())
}

/// A script that writes its response and exits in the same instant must
/// land as SUCCESS every time; the exit observation racing ahead of the
/// frame read must never turn into a FAILED result. Repeated with fresh
/// payloads because the race is timing-dependent.
#[tokio::test(flavor = "multi_thread")]
async fn reply_then_immediate_exit_is_success() -> Result<()> {
    let bed = testbed();

    for round in 0..20 {
        let mut request =
            TaskRequest::new(ECHO, format!("{{\"input\":\"round {round}\"}}").into_bytes());
        request.timeout_minutes = Some(1);
        let result = bed.dispatcher.run_task(request).await?;
        assert_eq!(result.status, TaskStatus::Success, "round {round}");
        assert!(result.output.is_some(), "round {round} lost its frame");
    }
    Ok(())
}

/// A failing script publishes a FAILED result, not an error: duplicate
/// callers must fail fast rather than re-run doomed work.
#[tokio::test(flavor = "multi_thread")]
async fn failure_is_a_terminal_result() {
    let bed = testbed();

    let mut request = TaskRequest::new(FAIL, b"{\"input\":\"doomed\"}".to_vec());
    request.timeout_minutes = Some(1);
    let result = bed.dispatcher.run_task(request.clone()).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);

    // Same payload again: served from the cache, no second process.
    request.id = uuid::Uuid::new_v4();
    let again = bed.dispatcher.run_task(request).await.unwrap();
    assert_eq!(again.status, TaskStatus::Failed);
    assert_eq!(again.id, result.id);
    assert_eq!(bed.dispatcher.executions_started(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_script_is_a_setup_error() {
    let bed = testbed();

    let mut request = TaskRequest::new("no-such-script.sh", b"{}".to_vec());
    request.timeout_minutes = Some(1);
    let err = bed.dispatcher.run_task(request).await.unwrap_err();
    assert!(matches!(err, TaskError::Setup { .. }));
    assert!(err.is_retryable());
    assert_eq!(bed.dispatcher.executions_started(), 0);
}

/// Listeners fire exactly once per published result, and a panicking
/// listener never reaches the direct caller.
#[tokio::test(flavor = "multi_thread")]
async fn listeners_fire_once_per_published_result() {
    let bed = testbed();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    bed.dispatcher.listeners().register(
        ECHO,
        "counter",
        Arc::new(move |result| {
            assert_eq!(result.status, TaskStatus::Success);
            counted.fetch_add(1, Ordering::SeqCst);
        }),
    );
    bed.dispatcher
        .listeners()
        .register(ECHO, "bad", Arc::new(|_| panic!("listener bug")));

    let mut request = TaskRequest::new(ECHO, b"{\"input\":\"notify\"}".to_vec());
    request.timeout_minutes = Some(1);
    let result = bed.dispatcher.run_task(request.clone()).await.unwrap();
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A cache hit returns the published result without a second dispatch.
    request.id = uuid::Uuid::new_v4();
    bed.dispatcher.run_task(request).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
