//! Recovery manager: backoff reconnects, exhaustion, and catalog eviction.

mod common;

use common::{SimulatedConnector, SimulatedServer, descriptor, fast_config, harness};
use orrery::{ConnectionState, EventKind, GatewayEvent, InvokeContext, InvokeOutcome, LoadingMode};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn a_transient_connect_failure_recovers_automatically() {
    let connector = SimulatedConnector::new();
    let server = SimulatedServer::new(vec![SimulatedServer::tool("echo", false)]);
    server.fail_next_connects(1);
    connector.register("sim", server);

    let h = harness(
        vec![descriptor("sim", &[])],
        Arc::clone(&connector),
        fast_config(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.gateway.subscribe(EventKind::Recovery, move |event| {
        sink.lock().expect("sink lock").push(event.clone());
    });

    let report = h.gateway.start(LoadingMode::Full, None).await;
    assert_eq!(report.failed(), 1);
    assert_eq!(
        h.gateway.server_health("sim").expect("snapshot").state,
        ConnectionState::Error
    );

    // First reconnect fires after the base backoff delay (100ms here).
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = h.gateway.server_health("sim").expect("snapshot");
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.recovery_attempts, 0, "success resets the counters");
    assert_eq!(snapshot.consecutive_failures, 0);

    // The reconnected server's catalog is live again.
    assert!(h.registry.resolve("echo").is_some());
    let outcome = h
        .gateway
        .invoke("echo", json!({}), InvokeContext::new())
        .await;
    assert!(outcome.is_success());

    assert!(seen
        .lock()
        .expect("sink lock")
        .iter()
        .any(|e| matches!(e, GatewayEvent::ServerRecovered { server_id, .. } if server_id == "sim")));
}

#[tokio::test(start_paused = true)]
async fn exhausted_recovery_disconnects_and_evicts_the_catalog() {
    let connector = SimulatedConnector::new();
    let server = SimulatedServer::new(vec![SimulatedServer::tool("echo", false)]);
    server.fail_next_connects(100);
    connector.register("sim", server);

    let h = harness(
        vec![descriptor("sim", &[])],
        Arc::clone(&connector),
        fast_config(), // max_attempts 3, delays 100/200/400ms, no jitter
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.gateway.subscribe(EventKind::Recovery, move |event| {
        sink.lock().expect("sink lock").push(event.clone());
    });

    let report = h.gateway.start(LoadingMode::Full, None).await;
    assert_eq!(report.failed(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;

    let snapshot = h.gateway.server_health("sim").expect("snapshot");
    assert_eq!(
        snapshot.state,
        ConnectionState::Disconnected,
        "exhaustion is terminal"
    );
    assert_eq!(snapshot.recovery_attempts, 3);

    // The server's tools vanished with it.
    assert!(h.gateway.list_available_tools().is_empty());
    let outcome = h
        .gateway
        .invoke("echo", json!({}), InvokeContext::new())
        .await;
    assert!(matches!(outcome, InvokeOutcome::NotFound { .. }));

    let events = seen.lock().expect("sink lock");
    assert!(events
        .iter()
        .any(|e| matches!(e, GatewayEvent::RecoveryExhausted { server_id, attempts } if server_id == "sim" && *attempts == 3)));
}

#[tokio::test(start_paused = true)]
async fn a_probe_failure_triggers_recovery() {
    let connector = SimulatedConnector::new();
    let server = SimulatedServer::new(vec![SimulatedServer::tool("echo", false)]);
    connector.register("sim", server);

    let h = harness(
        vec![descriptor("sim", &[])],
        Arc::clone(&connector),
        fast_config(),
    );
    let report = h.gateway.start(LoadingMode::Full, None).await;
    assert_eq!(report.loaded(), 1);

    // The next probe fails, but the following reconnect succeeds.
    h.connector.server("sim").set_ping_ok(false);
    let check = h.gateway.check_server("sim").await.expect("known server");
    assert!(!check.success);
    assert_eq!(
        h.gateway.server_health("sim").expect("snapshot").state,
        ConnectionState::Error
    );

    h.connector.server("sim").set_ping_ok(true);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        h.gateway.server_health("sim").expect("snapshot").state,
        ConnectionState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn removal_during_recovery_cancels_the_reconnect() {
    let connector = SimulatedConnector::new();
    let server = SimulatedServer::new(vec![SimulatedServer::tool("echo", false)]);
    server.fail_next_connects(100);
    connector.register("sim", server);

    let h = harness(
        vec![descriptor("sim", &[])],
        Arc::clone(&connector),
        fast_config(),
    );
    let report = h.gateway.start(LoadingMode::Full, None).await;
    assert_eq!(report.failed(), 1);

    assert!(h.gateway.remove_server("sim").await);
    assert!(h.gateway.server_health("sim").is_none());

    // No recovery task is left to resurrect the server.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.gateway.server_health("sim").is_none());
    assert!(h.gateway.list_available_tools().is_empty());
}

#[tokio::test(start_paused = true)]
async fn independent_servers_recover_independently() {
    let connector = SimulatedConnector::new();
    let healthy = SimulatedServer::new(vec![SimulatedServer::tool("get_time", false)]);
    let flaky = SimulatedServer::new(vec![SimulatedServer::tool("read_file", false)]);
    flaky.fail_next_connects(1);
    connector.register("clock", healthy);
    connector.register("files", flaky);

    let h = harness(
        vec![descriptor("clock", &[]), descriptor("files", &[])],
        Arc::clone(&connector),
        fast_config(),
    );

    let report = h.gateway.start(LoadingMode::Full, None).await;
    assert_eq!(report.loaded(), 1);
    assert_eq!(report.failed(), 1);

    // The healthy server is usable while its peer recovers.
    let outcome = h
        .gateway
        .invoke("get_time", json!({}), InvokeContext::new())
        .await;
    assert!(outcome.is_success());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        h.gateway.server_health("files").expect("snapshot").state,
        ConnectionState::Connected
    );
    assert!(h.registry.resolve("read_file").is_some());
}
