//! Group load balancing, retry and rate limiting through the full runtime

mod common;

use std::time::Duration;

use serde_json::json;

use mcp_hangar::config::Config;
use mcp_hangar::domain::events::DomainEvent;
use mcp_hangar::failsafe::CircuitState;
use mcp_hangar::runtime::Runtime;

fn runtime_with_group(script: &std::path::Path) -> std::sync::Arc<Runtime> {
    let script = script.to_string_lossy();
    // member-2 rejects every `add` with a synthetic RPC error.
    let yaml = format!(
        r#"
providers:
  member-1:
    mode: subprocess
    command: ["python3", "{script}"]
  member-2:
    mode: subprocess
    command: ["python3", "{script}"]
    env:
      MOCK_FAIL_ADD: "1"
  member-3:
    mode: subprocess
    command: ["python3", "{script}"]
groups:
  workers:
    strategy: round_robin
    min_healthy: 1
    members:
      - provider: member-1
      - provider: member-2
      - provider: member-3
    circuit_breaker:
      failure_threshold: 2
      reset_timeout: 60s
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    Runtime::build(config, None).unwrap()
}

/// Group retry: every call succeeds even with a poisoned member; the bad
/// member's circuit opens and later selections skip it.
#[tokio::test]
async fn group_retries_on_a_distinct_member() {
    let script = common::write_mock_provider();
    let runtime = runtime_with_group(script.path());
    let events = common::attach_collector(&runtime.event_bus);

    for _ in 0..4 {
        let result = runtime
            .registry
            .invoke("workers", "add", json!({"a": 10, "b": 20}), None)
            .await
            .unwrap();
        assert_eq!(result, json!(30));
    }

    let group = runtime.groups.get("workers").unwrap().clone();
    let bad = group.find_member("member-2").unwrap();
    // Two failed probes at threshold 2 opened the circuit.
    assert_eq!(bad.circuit_state(), CircuitState::Open);

    // With the circuit open, further calls never touch member-2.
    for _ in 0..6 {
        let result = runtime
            .registry
            .invoke("workers", "add", json!({"a": 1, "b": 2}), None)
            .await
            .unwrap();
        assert_eq!(result, json!(3));
    }

    let log = events.lock().clone();
    assert!(log.iter().any(|e| matches!(
        e,
        DomainEvent::CircuitOpened { provider_id, .. } if provider_id == "member-2"
    )));
    // Every failure on member-2 produced exactly one failed-invocation event.
    let member2_failures = log
        .iter()
        .filter(|e| matches!(
            e,
            DomainEvent::ToolInvocationFailed { provider_id, .. } if provider_id == "member-2"
        ))
        .count();
    assert_eq!(member2_failures, 2);

    runtime.shutdown().await;
}

/// An unavailable group re-raises rather than inventing members.
#[tokio::test]
async fn unavailable_group_is_rejected() {
    let script = common::write_mock_provider();
    let runtime = runtime_with_group(script.path());

    let group = runtime.groups.get("workers").unwrap().clone();
    // Push every member out of rotation via failure streaks.
    for member in ["member-1", "member-2", "member-3"] {
        for _ in 0..3 {
            group.report_failure(member);
        }
    }
    assert!(!group.is_available());

    let err = runtime
        .registry
        .invoke("workers", "add", json!({"a": 1, "b": 2}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "group_unavailable");

    runtime.shutdown().await;
}

/// Group ids resolve through the same front door as provider ids.
#[tokio::test]
async fn group_start_stop_and_details() {
    let script = common::write_mock_provider();
    let runtime = runtime_with_group(script.path());

    let started = runtime.registry.start("workers").await.unwrap();
    assert_eq!(started["members_started"], 3);
    assert_eq!(started["state"], "ready");

    let details = runtime.registry.details("workers").await.unwrap();
    assert_eq!(details["total_count"], 3);
    assert_eq!(details["members"].as_array().unwrap().len(), 3);

    let stopped = runtime.registry.stop("workers").await.unwrap();
    assert_eq!(stopped["stopped"], true);
    for member in runtime.groups.get("workers").unwrap().members() {
        assert_eq!(member.provider().state().as_str(), "cold");
    }

    runtime.shutdown().await;
}

/// Rate limiting at the front door: burst + 5 concurrent calls yield
/// roughly burst successes and the rest rejected, nothing lost.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn front_door_rate_limit_boundary() {
    let script = common::write_mock_provider();
    let script_path = script.path().to_string_lossy().into_owned();
    let yaml = format!(
        r#"
providers:
  math:
    mode: subprocess
    command: ["python3", "{script_path}"]
rate_limit:
  enabled: true
  requests_per_second: 10
  burst_size: 20
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let runtime = Runtime::build(config, None).unwrap();

    let mut handles = Vec::new();
    for _ in 0..25 {
        let registry = std::sync::Arc::clone(&runtime.registry);
        handles.push(tokio::spawn(async move { registry.list(None).await }));
    }

    let mut succeeded = 0;
    let mut denied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => {
                assert_eq!(e.kind(), "rate_limit_exceeded");
                denied += 1;
            }
        }
    }

    assert_eq!(succeeded + denied, 25);
    assert!(
        (20..=21).contains(&succeeded),
        "expected ~burst successes, got {succeeded}"
    );
    assert!(denied >= 4, "expected at least 4 rejections, got {denied}");

    runtime.shutdown().await;
}

/// Validation failures surface as stable payloads and never reach a
/// provider.
#[tokio::test]
async fn invalid_inputs_are_rejected_at_the_door() {
    let script = common::write_mock_provider();
    let runtime = runtime_with_group(script.path());

    let err = runtime
        .registry
        .invoke("../escape", "add", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = runtime
        .registry
        .invoke("member-1", "bad tool name", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = runtime
        .registry
        .invoke("member-1", "add", json!({}), Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    // The payload shape is stable for front-door consumers.
    let payload = runtime.registry.error_payload("registry_invoke", &err);
    assert_eq!(payload["error_type"], "validation_error");
    assert!(payload["error"].as_str().is_some());

    // None of this ever started a provider.
    for member in runtime.groups.get("workers").unwrap().members() {
        assert_eq!(member.provider().state().as_str(), "cold");
    }

    runtime.shutdown().await;
}

/// Unknown provider ids map to provider_not_found.
#[tokio::test]
async fn unknown_provider_is_not_found() {
    let script = common::write_mock_provider();
    let runtime = runtime_with_group(script.path());

    let err = runtime
        .registry
        .invoke("ghost", "add", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "provider_not_found");

    runtime.shutdown().await;
}
