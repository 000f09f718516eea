use std::sync::{Arc, Mutex};
use std::time::Duration;

use service_registry::memory::Operation;
use service_registry::{
    Backoff, ConnectionManager, ConnectionSettings, ConnectionState, EndpointDescriptor,
    EndpointProvider, MemoryCoordinator, NodeNaming, PassOutcome, RegistrationRecord,
    RegistryError, RetryPolicy, ServiceRegister, ServiceRegistry, models,
};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(5);

fn settings(max_attempts: u32) -> ConnectionSettings {
    ConnectionSettings {
        retry: RetryPolicy::new(max_attempts, Backoff::Fixed(Duration::from_millis(1))),
        reconnect: Backoff::Fixed(Duration::from_millis(1)),
        ..ConnectionSettings::default()
    }
}

fn engine(descriptors: Vec<EndpointDescriptor>) -> ServiceRegister {
    let provider: EndpointProvider = Arc::new(move || descriptors.clone());
    ServiceRegister::new(NodeNaming::new("/services").unwrap(), provider)
}

async fn start(
    store: &MemoryCoordinator,
    max_attempts: u32,
    descriptors: Vec<EndpointDescriptor>,
) -> ServiceRegistry {
    ServiceRegistry::start_with(
        Arc::new(store.clone()),
        settings(max_attempts),
        engine(descriptors),
    )
    .await
    .unwrap()
}

fn record(store: &MemoryCoordinator, path: &str) -> RegistrationRecord {
    models::decode(&store.data(path).expect("node missing")).unwrap()
}

fn endpoint_paths(store: &MemoryCoordinator) -> Vec<String> {
    store
        .paths()
        .into_iter()
        .filter(|p| store.owner(p).is_some())
        .collect()
}

#[tokio::test]
#[traced_test]
async fn test_example_scenario() -> anyhow::Result<()> {
    let store = MemoryCoordinator::new();
    let registry = start(
        &store,
        3,
        vec![EndpointDescriptor::new("http://10.0.0.5:8080", "OrderApi")],
    )
    .await;

    let status = registry.register().wait_for_pass(1, WAIT).await?;
    let PassOutcome::Succeeded(report) = status.outcome else {
        panic!("pass did not succeed: {:?}", status.outcome);
    };
    assert_eq!(report.session_id.as_str(), "s-1001");
    assert_eq!(report.registered, vec!["/services/OrderApi/s-1001"]);

    let raw = store.data("/services/OrderApi/s-1001").unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw)?;
    assert_eq!(json["url"], "http://10.0.0.5:8080");
    assert_eq!(json["serviceNodeName"], "OrderApi");
    assert_eq!(json["endpointNodeName"], "s-1001");
    assert!(json["updateTime"].is_string());

    registry.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_every_descriptor_published() {
    let store = MemoryCoordinator::new();
    let descriptors = vec![
        EndpointDescriptor::new("http://10.0.0.5:8080", "OrderApi"),
        EndpointDescriptor::new("http://10.0.0.5:8081", "Billing Api"),
        EndpointDescriptor::new("http://10.0.0.5:8082", "acme/Inventory"),
    ];
    let registry = start(&store, 3, descriptors.clone()).await;
    let status = registry.register().wait_for_pass(1, WAIT).await.unwrap();
    assert!(status.outcome.is_success());

    for (descriptor, path) in descriptors.iter().zip([
        "/services/OrderApi/s-1001",
        "/services/Billing_Api/s-1001",
        "/services/acme_Inventory/s-1001",
    ]) {
        assert_eq!(record(&store, path).url, descriptor.url);
    }
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let store = MemoryCoordinator::new();
    let registry = start(
        &store,
        3,
        vec![
            EndpointDescriptor::new("http://a", "A"),
            EndpointDescriptor::new("http://b", "B"),
        ],
    )
    .await;
    registry.register().wait_for_pass(1, WAIT).await.unwrap();
    let paths = store.paths();
    let creates = store.calls(Operation::Create);
    let first = record(&store, "/services/A/s-1001");

    tokio::time::sleep(Duration::from_millis(5)).await;
    registry.refresh().await.unwrap();

    assert_eq!(store.paths(), paths);
    assert_eq!(store.calls(Operation::Create), creates);
    let second = record(&store, "/services/A/s-1001");
    assert!(second.update_time > first.update_time);
    assert_eq!(second.url, first.url);
    assert_eq!(registry.status().pass, 2);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_session_change_republishes() {
    let store = MemoryCoordinator::new();
    let registry = start(
        &store,
        3,
        vec![
            EndpointDescriptor::new("http://a", "A"),
            EndpointDescriptor::new("http://b", "B"),
        ],
    )
    .await;
    registry.register().wait_for_pass(1, WAIT).await.unwrap();
    let before = endpoint_paths(&store);
    assert_eq!(before, vec!["/services/A/s-1001", "/services/B/s-1001"]);

    assert_eq!(store.expire_session().unwrap().as_str(), "s-1001");
    let status = registry.register().wait_for_pass(2, WAIT).await.unwrap();
    let PassOutcome::Succeeded(report) = status.outcome else {
        panic!("second pass did not succeed: {:?}", status.outcome);
    };
    assert_eq!(report.session_id.as_str(), "s-1002");

    let after = endpoint_paths(&store);
    assert_eq!(after, vec!["/services/A/s-1002", "/services/B/s-1002"]);
    assert!(before.iter().all(|p| !after.contains(p)));
    assert_eq!(store.owner("/services/A/s-1002").unwrap().as_str(), "s-1002");
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_partial_failure_isolated() {
    let store = MemoryCoordinator::new();
    store.fail_always(Operation::Create, Some("/services/B/s-1001"));
    let registry = start(
        &store,
        3,
        vec![
            EndpointDescriptor::new("http://a", "A"),
            EndpointDescriptor::new("http://b", "B"),
            EndpointDescriptor::new("http://c", "C"),
        ],
    )
    .await;

    let status = registry.register().wait_for_pass(1, WAIT).await.unwrap();
    match status.outcome {
        PassOutcome::PartiallyFailed {
            failed,
            total,
            failures,
        } => {
            assert_eq!((failed, total), (1, 3));
            assert_eq!(failures[0].target, "/services/B/s-1001");
            assert!(matches!(
                failures[0].error,
                RegistryError::RetriesExhausted { attempts: 3, .. }
            ));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(store.node("/services/A/s-1001").is_some());
    assert!(store.node("/services/B/s-1001").is_none());
    assert!(store.node("/services/C/s-1001").is_some());
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_service_path_fails_its_records() {
    let store = MemoryCoordinator::new();
    store.fail_fatal(Operation::EnsurePath, Some("/services/A"));
    let registry = start(
        &store,
        3,
        vec![
            EndpointDescriptor::new("http://a", "A"),
            EndpointDescriptor::new("http://b", "B"),
        ],
    )
    .await;

    let status = registry.register().wait_for_pass(1, WAIT).await.unwrap();
    let PassOutcome::PartiallyFailed { failures, .. } = status.outcome else {
        panic!("expected a partial failure: {:?}", status.outcome);
    };
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].error,
        RegistryError::PermissionDenied(_)
    ));
    // fatal errors are not retried
    assert_eq!(store.calls(Operation::EnsurePath), 2);
    assert!(store.node("/services/A").is_none());
    assert!(store.node("/services/B/s-1001").is_some());
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_then_succeed() {
    let store = MemoryCoordinator::new();
    store.fail_times(Operation::Create, Some("/services/A/s-1001"), 2);
    let registry = start(&store, 3, vec![EndpointDescriptor::new("http://a", "A")]).await;

    let status = registry.register().wait_for_pass(1, WAIT).await.unwrap();
    assert!(status.outcome.is_success(), "{:?}", status.outcome);
    assert_eq!(store.calls(Operation::Create), 3);
    assert_eq!(record(&store, "/services/A/s-1001").url, "http://a");
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_exhaustion_exact_attempts() {
    let store = MemoryCoordinator::new();
    store.fail_always(Operation::Exists, Some("/services/A/s-1001"));
    let registry = start(&store, 4, vec![EndpointDescriptor::new("http://a", "A")]).await;

    let status = registry.register().wait_for_pass(1, WAIT).await.unwrap();
    let PassOutcome::PartiallyFailed {
        failed, failures, ..
    } = status.outcome
    else {
        panic!("expected a partial failure: {:?}", status.outcome);
    };
    assert_eq!(failed, 1);
    assert!(matches!(
        &failures[0].error,
        RegistryError::RetriesExhausted { attempts: 4, source }
            if matches!(**source, RegistryError::Transport(_))
    ));
    assert_eq!(store.calls(Operation::Exists), 4);
    assert_eq!(store.calls(Operation::Create), 0);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_not_connected_does_not_run() {
    let store = MemoryCoordinator::new();
    let register = engine(vec![EndpointDescriptor::new("http://a", "A")]);
    let conn = ConnectionManager::new(
        Arc::new(store.clone()),
        settings(3),
        Arc::new(engine(vec![])),
    );

    let err = register.run_pass(&conn).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotConnected(_)));
    let status = register.status();
    assert_eq!(status.pass, 1);
    assert!(matches!(
        status.outcome,
        PassOutcome::NotRun(RegistryError::NotConnected(_))
    ));
    assert!(store.paths().is_empty());
    assert_eq!(store.calls(Operation::EnsurePath), 0);
}

#[tokio::test]
async fn test_connect_failures_delay_first_pass() {
    let store = MemoryCoordinator::new();
    store.fail_times(Operation::Connect, None, 2);
    let registry = start(&store, 3, vec![EndpointDescriptor::new("http://a", "A")]).await;

    let status = registry.register().wait_for_pass(1, WAIT).await.unwrap();
    assert!(status.outcome.is_success());
    assert_eq!(store.calls(Operation::Connect), 3);
    assert!(store.node("/services/A/s-1001").is_some());
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_close_cancels_running_pass() {
    let store = MemoryCoordinator::new();
    store.fail_always(Operation::Create, None);
    let registry = ServiceRegistry::start_with(
        Arc::new(store.clone()),
        ConnectionSettings {
            retry: RetryPolicy::new(10, Backoff::Fixed(Duration::from_secs(60))),
            reconnect: Backoff::Fixed(Duration::from_millis(1)),
            ..ConnectionSettings::default()
        },
        engine(vec![EndpointDescriptor::new("http://a", "A")]),
    )
    .await
    .unwrap();

    tokio::time::timeout(WAIT, async {
        while store.calls(Operation::Create) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(WAIT, registry.close())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registry.state(), ConnectionState::Closed);
    assert_eq!(store.calls(Operation::Create), 1);
    assert_eq!(registry.status().pass, 0);
    assert!(!store.has_session());
}

#[tokio::test]
async fn test_provider_changes_picked_up_on_refresh() {
    let store = MemoryCoordinator::new();
    let desired = Arc::new(Mutex::new(vec![EndpointDescriptor::new("http://a", "A")]));
    let source = Arc::clone(&desired);
    let provider: EndpointProvider = Arc::new(move || source.lock().unwrap().clone());
    let registry = ServiceRegistry::start_with(
        Arc::new(store.clone()),
        settings(3),
        ServiceRegister::new(NodeNaming::new("/services").unwrap(), provider),
    )
    .await
    .unwrap();
    registry.register().wait_for_pass(1, WAIT).await.unwrap();

    desired
        .lock()
        .unwrap()
        .push(EndpointDescriptor::new("http://b", "B"));
    let report = registry.refresh().await.unwrap();
    assert_eq!(
        report.registered,
        vec!["/services/A/s-1001", "/services/B/s-1001"]
    );
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_lost_republishes() {
    let store = MemoryCoordinator::new();
    let registry = start(&store, 3, vec![EndpointDescriptor::new("http://a", "A")]).await;
    registry.register().wait_for_pass(1, WAIT).await.unwrap();

    assert_eq!(store.drop_connection("socket reset").unwrap().as_str(), "s-1001");
    let status = registry.register().wait_for_pass(2, WAIT).await.unwrap();
    assert_eq!(status.pass, 2);
    let PassOutcome::Succeeded(report) = status.outcome else {
        panic!("second pass did not succeed: {:?}", status.outcome);
    };
    assert_eq!(report.session_id.as_str(), "s-1002");
    assert_eq!(endpoint_paths(&store), vec!["/services/A/s-1002"]);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_lost_during_pass() {
    let store = MemoryCoordinator::new();
    store.fail_always(Operation::Create, None);
    let registry = ServiceRegistry::start_with(
        Arc::new(store.clone()),
        ConnectionSettings {
            retry: RetryPolicy::new(5, Backoff::Fixed(Duration::from_millis(20))),
            reconnect: Backoff::Fixed(Duration::from_millis(1)),
            ..ConnectionSettings::default()
        },
        engine(vec![EndpointDescriptor::new("http://a", "A")]),
    )
    .await
    .unwrap();

    tokio::time::timeout(WAIT, async {
        while store.calls(Operation::Create) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    store.drop_connection("socket reset");
    store.clear_faults();

    // the stale pass runs out its retries before the new session is opened
    let status = registry.register().wait_for_pass(2, WAIT).await.unwrap();
    assert_eq!(status.pass, 2);
    let PassOutcome::Succeeded(report) = status.outcome else {
        panic!("second pass did not succeed: {:?}", status.outcome);
    };
    assert_eq!(report.session_id.as_str(), "s-1002");
    assert_eq!(endpoint_paths(&store), vec!["/services/A/s-1002"]);
    assert_eq!(store.calls(Operation::Connect), 2);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_colliding_contracts_reported() {
    let store = MemoryCoordinator::new();
    let registry = start(
        &store,
        3,
        vec![
            EndpointDescriptor::new("http://v1", "orders/v1"),
            EndpointDescriptor::new("http://v1b", "orders_v1"),
        ],
    )
    .await;

    let status = registry.register().wait_for_pass(1, WAIT).await.unwrap();
    let PassOutcome::PartiallyFailed {
        failed, failures, ..
    } = status.outcome
    else {
        panic!("collision reported as {:?}", status.outcome);
    };
    assert_eq!(failed, 1);
    assert!(matches!(failures[0].error, RegistryError::InvalidInput(_)));
    assert_eq!(record(&store, "/services/orders_v1/s-1001").url, "http://v1");
    registry.close().await.unwrap();
}
