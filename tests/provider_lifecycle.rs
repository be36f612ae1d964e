//! Provider lifecycle integration tests against a live mock subprocess

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mcp_hangar::bus::EventBus;
use mcp_hangar::config::{ProviderConfig, ProviderMode};
use mcp_hangar::domain::events::DomainEvent;
use mcp_hangar::domain::{Provider, ProviderState};

fn mock_config(script: &std::path::Path) -> ProviderConfig {
    ProviderConfig {
        mode: ProviderMode::Subprocess,
        command: vec![
            "python3".to_string(),
            script.to_string_lossy().into_owned(),
        ],
        ..ProviderConfig::default()
    }
}

/// Subprocess happy path: start, discover tools, invoke, observe events.
#[tokio::test]
async fn subprocess_happy_path() {
    let script = common::write_mock_provider();
    let provider = Provider::from_config("math", mock_config(script.path())).unwrap();
    let event_bus = EventBus::new();
    let events = common::attach_collector(&event_bus);

    let result = provider
        .invoke_tool("add", json!({"a": 10, "b": 20}), Duration::from_secs(5))
        .await
        .unwrap();
    provider.drain_and_publish(&event_bus).await;

    assert_eq!(result, json!(30));
    assert_eq!(provider.state(), ProviderState::Ready);

    let health = provider.health_snapshot().await;
    assert!(health.total_invocations >= 1);
    assert_eq!(health.total_failures, 0);

    // ProviderStarted precedes the invocation pair, which shares one
    // correlation id.
    let log = events.lock().clone();
    let tags = common::event_tags(&log);
    let started_at = tags.iter().position(|t| t == "ProviderStarted").unwrap();
    let requested_at = tags
        .iter()
        .position(|t| t == "ToolInvocationRequested")
        .unwrap();
    let completed_at = tags
        .iter()
        .position(|t| t == "ToolInvocationCompleted")
        .unwrap();
    assert!(started_at < requested_at);
    assert!(requested_at < completed_at);

    let requested_corr = log[requested_at].correlation_id().unwrap();
    let completed_corr = log[completed_at].correlation_id().unwrap();
    assert_eq!(requested_corr, completed_corr);

    provider.shutdown().await.unwrap();
}

/// ensure_ready is idempotent: the second call observes READY and does not
/// restart the child.
#[tokio::test]
async fn ensure_ready_twice_is_one_start() {
    let script = common::write_mock_provider();
    let provider = Provider::from_config("math", mock_config(script.path())).unwrap();

    provider.ensure_ready().await.unwrap();
    let first_pid = provider
        .invoke_tool("pid", json!({}), Duration::from_secs(5))
        .await
        .unwrap();

    provider.ensure_ready().await.unwrap();
    let second_pid = provider
        .invoke_tool("pid", json!({}), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(first_pid, second_pid, "no second child was spawned");

    let events = provider.collect_events().await;
    let starts = events
        .iter()
        .filter(|e| matches!(e, DomainEvent::ProviderStarted { .. }))
        .count();
    assert_eq!(starts, 1);

    provider.shutdown().await.unwrap();
}

/// Idle GC: a provider past its TTL emits idle-detected, stops with
/// reason "idle" and ends COLD.
#[tokio::test]
async fn idle_provider_is_garbage_collected() {
    let script = common::write_mock_provider();
    let mut config = mock_config(script.path());
    config.idle_ttl = Duration::from_secs(1);
    let provider = Provider::from_config("math", config).unwrap();

    provider
        .invoke_tool("add", json!({"a": 1, "b": 2}), Duration::from_secs(5))
        .await
        .unwrap();
    let _ = provider.collect_events().await;

    // Not yet idle.
    assert!(!provider.maybe_shutdown_idle().await);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(provider.maybe_shutdown_idle().await);
    assert_eq!(provider.state(), ProviderState::Cold);

    let events = provider.collect_events().await;
    let tags = common::event_tags(&events);
    let idle_at = tags.iter().position(|t| t == "ProviderIdleDetected").unwrap();
    let stopped_at = tags.iter().position(|t| t == "ProviderStopped").unwrap();
    assert!(idle_at < stopped_at);
    assert!(events.iter().any(|e| matches!(
        e,
        DomainEvent::ProviderStopped { reason, .. } if reason == "idle"
    )));
}

/// Transport death recovery: kill the child, watch the provider go DEAD,
/// then recover through a fresh child after the backoff elapses.
#[tokio::test]
async fn transport_death_then_recovery() {
    let script = common::write_mock_provider();
    let provider = Provider::from_config("math", mock_config(script.path())).unwrap();

    let first_pid = provider
        .invoke_tool("pid", json!({}), Duration::from_secs(5))
        .await
        .unwrap()
        .as_i64()
        .unwrap();

    // Kill the child out from under the client.
    std::process::Command::new("kill")
        .args(["-9", &first_pid.to_string()])
        .status()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = provider
        .invoke_tool("add", json!({"a": 1, "b": 2}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "client_not_connected");
    assert_eq!(provider.state(), ProviderState::Dead);

    // One failure recorded: the backoff window is 2s.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let second_pid = provider
        .invoke_tool("pid", json!({}), Duration::from_secs(5))
        .await
        .unwrap()
        .as_i64()
        .unwrap();
    assert_ne!(first_pid, second_pid, "recovery must spawn a new child");
    assert_eq!(provider.state(), ProviderState::Ready);

    let result = provider
        .invoke_tool("add", json!({"a": 2, "b": 3}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!(5));

    provider.shutdown().await.unwrap();
}

/// A provider RPC error counts toward totals but never degrades.
#[tokio::test]
async fn rpc_errors_do_not_degrade() {
    let script = common::write_mock_provider();
    let mut config = mock_config(script.path());
    config.env = HashMap::from([("MOCK_FAIL_ADD".to_string(), "1".to_string())]);
    config.max_consecutive_failures = 2;
    let provider = Provider::from_config("math", config).unwrap();

    for _ in 0..5 {
        let err = provider
            .invoke_tool("add", json!({"a": 1, "b": 2}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_invocation_error");
    }

    // Five domain errors, zero consecutive: still READY.
    assert_eq!(provider.state(), ProviderState::Ready);
    let health = provider.health_snapshot().await;
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.total_failures, 5);

    provider.shutdown().await.unwrap();
}

/// Tool timeout: the call returns within T + slack, the health streak
/// grows, and crossing the threshold degrades the provider.
#[tokio::test]
async fn timeouts_degrade_at_the_threshold() {
    let script = common::write_mock_provider();
    let mut config = mock_config(script.path());
    config.max_consecutive_failures = 2;
    let provider = Provider::from_config("math", config).unwrap();
    provider.ensure_ready().await.unwrap();

    for expected_state in [ProviderState::Ready, ProviderState::Degraded] {
        let started = std::time::Instant::now();
        let err = provider
            .invoke_tool(
                "sleep",
                json!({"seconds": 5}),
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_timeout");
        assert!(
            started.elapsed() < Duration::from_millis(1500),
            "timeout must be enforced promptly"
        );
        assert_eq!(provider.state(), expected_state);
    }

    let events = provider.collect_events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, DomainEvent::ProviderDegraded { .. })));

    provider.shutdown().await.unwrap();
}

/// Degraded providers refuse new calls until the backoff elapses.
#[tokio::test]
async fn degraded_provider_honors_backoff() {
    let script = common::write_mock_provider();
    let mut config = mock_config(script.path());
    config.max_consecutive_failures = 1;
    let provider = Provider::from_config("math", config).unwrap();
    provider.ensure_ready().await.unwrap();

    let _ = provider
        .invoke_tool("sleep", json!({"seconds": 5}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(provider.state(), ProviderState::Degraded);

    // Inside the backoff window the provider refuses to start.
    let err = provider
        .invoke_tool("add", json!({"a": 1, "b": 2}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "cannot_start_provider");

    provider.shutdown().await.unwrap();
}

/// Concurrent invocations: all succeed, and every Completed event pairs
/// with exactly one Requested event sharing its correlation id.
#[tokio::test(flavor = "multi_thread", worker_threads = 10)]
async fn concurrent_invocations_stay_ordered() {
    let script = common::write_mock_provider();
    let provider = Provider::from_config("math", mock_config(script.path())).unwrap();
    provider.ensure_ready().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..200i64 {
        let p = Arc::clone(&provider);
        handles.push(tokio::spawn(async move {
            p.invoke_tool("add", json!({"a": i, "b": 1}), Duration::from_secs(30))
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!(i as i64 + 1));
    }

    let health = provider.health_snapshot().await;
    assert!(health.total_invocations >= 200);
    assert_eq!(health.total_failures, 0);

    let events = provider.collect_events().await;
    let mut requested: Vec<&str> = Vec::new();
    for event in &events {
        match event {
            DomainEvent::ToolInvocationRequested { correlation_id, .. } => {
                requested.push(correlation_id);
            }
            DomainEvent::ToolInvocationCompleted { correlation_id, .. } => {
                // The matching request was drained before its completion.
                assert!(
                    requested.contains(&correlation_id.as_str()),
                    "completion without a preceding request"
                );
            }
            _ => {}
        }
    }
    let completed = events
        .iter()
        .filter(|e| matches!(e, DomainEvent::ToolInvocationCompleted { .. }))
        .count();
    assert_eq!(completed, 200);

    provider.shutdown().await.unwrap();
}

/// Health checks pass on a live provider and recover a degraded one.
#[tokio::test]
async fn health_check_recovers_a_degraded_provider() {
    let script = common::write_mock_provider();
    let mut config = mock_config(script.path());
    config.max_consecutive_failures = 1;
    let provider = Provider::from_config("math", config).unwrap();
    provider.ensure_ready().await.unwrap();

    assert!(provider.health_check().await);

    let _ = provider
        .invoke_tool("sleep", json!({"seconds": 5}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(provider.state(), ProviderState::Degraded);

    // Probe refused while in backoff, allowed and healing afterwards.
    assert!(!provider.health_check().await);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(provider.health_check().await);
    assert_eq!(provider.state(), ProviderState::Ready);

    provider.shutdown().await.unwrap();
}
