mod common;

use common::test_helpers::{fast_options, unavailable, ScriptedUsers};
use ninelives_rpc::{
    codes, CallPipeline, CircuitBreakerOptions, CircuitState, ErrorKind, ManualClock,
    ResilientClient, RpcStatus, TrackingSleeper,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn breaker_opens_after_threshold_and_recovers_through_probe() {
    let clock = ManualClock::new();
    let opts = fast_options().max_retries(0).breaker(
        CircuitBreakerOptions::default()
            .failure_threshold(3)
            .recovery_timeout(Duration::from_millis(1_000))
            .error_rate(0, 50.0),
    );
    let pipeline = CallPipeline::new("users.v1.Users", opts).unwrap().with_clock(clock.clone());
    let stub = ScriptedUsers::new([unavailable(), unavailable(), unavailable()]);
    let client = ResilientClient::with_pipeline(stub.clone(), pipeline);

    for _ in 0..3 {
        let err = client.call("GetUser", |mut c| async move { c.get_user(1).await }).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert_eq!(err.code, Some(codes::UNAVAILABLE));
    }
    let state = client.state("GetUser").unwrap();
    assert_eq!(state.state, CircuitState::Open);
    assert_eq!(state.next_attempt_at, 1_000);

    // Fast-fail without touching the stub.
    let err = client.call("GetUser", |mut c| async move { c.get_user(1).await }).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(err.code, Some(codes::UNAVAILABLE));
    assert_eq!(stub.calls(), 3);

    clock.advance(999);
    let err = client.call("GetUser", |mut c| async move { c.get_user(1).await }).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(stub.calls(), 3);

    clock.advance(1);
    let user = client.call("GetUser", |mut c| async move { c.get_user(1).await }).await.unwrap();
    assert_eq!(user, "user-1");
    assert_eq!(stub.calls(), 4);

    let state = client.state("GetUser").unwrap();
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);

    let metrics = client.metrics("GetUser").unwrap();
    assert_eq!(metrics.total_requests, 6);
    assert_eq!(metrics.failed_requests, 3);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.rejected_requests, 2);
    assert_eq!(metrics.circuit_open_count, 1);
}

#[tokio::test]
async fn transient_failures_are_retried_with_growing_delays() {
    let sleeper = TrackingSleeper::new();
    let opts = fast_options()
        .max_retries(3)
        .retry_delays(Duration::from_millis(100), Duration::from_secs(10));
    let pipeline = CallPipeline::new("users.v1.Users", opts).unwrap().with_sleeper(sleeper.clone());
    let stub = ScriptedUsers::new([unavailable(), unavailable()]);
    let client = ResilientClient::with_pipeline(stub.clone(), pipeline);

    let user = client.call("GetUser", |mut c| async move { c.get_user(9).await }).await.unwrap();

    assert_eq!(user, "user-9");
    assert_eq!(stub.calls(), 3);
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
    let metrics = client.metrics("GetUser").unwrap();
    assert_eq!(metrics.failed_requests, 2);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(client.state("GetUser").unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn sensitive_fields_never_reach_the_caller() {
    let denied = RpcStatus::new(codes::PERMISSION_DENIED, "access denied")
        .with_details(json!({
            "user": "ada",
            "password": "hunter2",
            "attempts": [{"Token": "t-1", "ok": false}]
        }))
        .with_metadata(json!({"authorization": "Bearer xyz", "request_id": "r-7"}));
    let stub = ScriptedUsers::new([Err(denied)]);
    let client = ResilientClient::new("users.v1.Users", stub.clone(), fast_options()).unwrap();

    let err = client.call("GetUser", |mut c| async move { c.get_user(1).await }).await.unwrap_err();

    assert_eq!(stub.calls(), 1, "PERMISSION_DENIED is not retryable");
    assert_eq!(err.message, "access denied");
    assert_eq!(err.code, Some(codes::PERMISSION_DENIED));
    assert_eq!(
        err.details,
        Some(json!({
            "user": "ada",
            "password": "[REDACTED]",
            "attempts": [{"Token": "[REDACTED]", "ok": false}]
        }))
    );
    assert_eq!(err.metadata, Some(json!({"authorization": "[REDACTED]", "request_id": "r-7"})));
}
