//! End-to-end dispatch scenarios against a scripted mock node.

mod common;

use std::sync::Arc;
use std::time::Duration;

use reef_client::config::CoreConfig;
use reef_client::credentials::StaticCredentialsProvider;
use reef_client::dispatcher::{Core, KvOperation};
use reef_client::events::{CollectingEventBus, CoreEvent};
use reef_client::CoreError;
use reef_core::protocol::{DocKey, KvRequest, Status};

use common::{KvReply, MockCluster};

async fn connect_core(mock: &MockCluster, config: CoreConfig) -> (Arc<Core>, Arc<CollectingEventBus>) {
    let bus = Arc::new(CollectingEventBus::new());
    let core = Core::connect(
        &mock.connection_string(),
        Arc::new(StaticCredentialsProvider::new("user", "pass")),
        config,
        bus.clone(),
    )
    .await
    .unwrap();
    (core, bus)
}

fn upsert(key: &[u8]) -> KvRequest {
    KvRequest::Upsert {
        key: DocKey::new(key.to_vec()),
        value: br#"{"a":1}"#.to_vec(),
        flags: 0x0200_0006,
        expiry: 0,
        datatype: 0x01,
    }
}

#[tokio::test]
async fn test_upsert_round_trip() {
    let mock = MockCluster::start_default().await;
    let (core, _bus) = connect_core(&mock, CoreConfig::default()).await;

    let response = core.dispatch(upsert(b"k")).await.unwrap();

    assert_eq!(response.status, Status::Success);
    assert_eq!(response.cas, 42);
    let token = response.mutation_token.unwrap();
    assert_eq!(token.partition_uuid, 7);
    assert_eq!(token.seqno, 11);
    assert_eq!(token.bucket.as_deref(), Some("default"));

    core.shutdown().await;
}

#[tokio::test]
async fn test_initial_topology_loaded() {
    let mock = MockCluster::start_default().await;
    let (core, _bus) = connect_core(&mock, CoreConfig::default()).await;

    let topology = core.topology().unwrap();
    assert_eq!(topology.name(), "default");
    assert_eq!(topology.nodes().len(), 1);
    assert_eq!(topology.rev().rev, 1);

    core.shutdown().await;
}

#[tokio::test]
async fn test_not_my_vbucket_installs_config_and_retries() {
    let mock = MockCluster::start_default().await;
    let (core, bus) = connect_core(&mock, CoreConfig::default()).await;

    // First upsert bounces with a piggybacked, newer config; the retry
    // lands on the refreshed topology and succeeds.
    mock.script_upserts([KvReply::NotMyVbucketWithConfig(5)]);

    let response = core.dispatch(upsert(b"k")).await.unwrap();
    assert_eq!(response.status, Status::Success);
    assert_eq!(core.topology().unwrap().rev().rev, 5);

    let events = bus.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::RequestRetried { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::ConfigUpdated { rev_id: 5, .. }
    )));

    core.shutdown().await;
}

#[tokio::test]
async fn test_temporary_failure_retried_until_success() {
    let mock = MockCluster::start_default().await;
    let (core, bus) = connect_core(&mock, CoreConfig::default()).await;

    mock.script_upserts([
        KvReply::Status(0x86), // TEMPORARY_FAILURE
        KvReply::Status(0x86),
    ]);

    let response = core
        .dispatch(KvOperation::new(upsert(b"k")).with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Success);

    let retries = bus
        .events()
        .iter()
        .filter(|e| matches!(e, CoreEvent::RequestRetried { .. }))
        .count();
    assert!(retries >= 2);

    core.shutdown().await;
}

#[tokio::test]
async fn test_document_not_found_surfaced_without_retry() {
    let mock = MockCluster::start_default().await;
    let (core, bus) = connect_core(&mock, CoreConfig::default()).await;

    let result = core
        .dispatch(KvRequest::Get {
            key: DocKey::new(b"missing".to_vec()),
        })
        .await;

    match result {
        Err(CoreError::DocumentNotFound { ctx }) => {
            assert!(ctx.correlation_id.is_some());
            assert_eq!(ctx.last_status, Some(Status::NotFound));
            assert!(ctx.node.is_some());
        }
        other => panic!("expected DocumentNotFound, got {:?}", other),
    }
    assert!(!bus
        .events()
        .iter()
        .any(|e| matches!(e, CoreEvent::RequestRetried { .. })));

    core.shutdown().await;
}

#[tokio::test]
async fn test_get_round_trip_carries_flags() {
    let mock = MockCluster::start_default().await;
    let (core, _bus) = connect_core(&mock, CoreConfig::default()).await;

    let response = core
        .dispatch(KvRequest::Get {
            key: DocKey::new(b"present".to_vec()),
        })
        .await
        .unwrap();

    assert_eq!(response.status, Status::Success);
    assert_eq!(response.flags, Some(0x0200_0006));
    assert_eq!(&response.value[..], br#"{"a":1}"#);
    assert_eq!(response.cas, 99);

    core.shutdown().await;
}

#[tokio::test]
async fn test_saturated_pool_times_out_unambiguously() {
    let mock = MockCluster::start_default().await;
    let config = CoreConfig::builder()
        .kv_pool(|p| p.min_endpoints(1).max_endpoints(1).max_in_flight(1))
        .unwrap()
        .build()
        .unwrap();
    let (core, bus) = connect_core(&mock, config).await;

    // Park one slow upsert so the only endpoint is saturated.
    mock.script_upserts([KvReply::Delay(
        Duration::from_millis(300),
        Box::new(KvReply::Success {
            cas: 1,
            token: None,
        }),
    )]);

    let core_slow = core.clone();
    let slow = tokio::spawn(async move {
        core_slow
            .dispatch(KvOperation::new(upsert(b"slow")).with_timeout(Duration::from_secs(2)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The second submission never gets written and expires unambiguously.
    let result = core
        .dispatch(KvOperation::new(upsert(b"fast")).with_timeout(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(CoreError::UnambiguousTimeout { .. })));
    assert!(bus
        .events()
        .iter()
        .any(|e| matches!(e, CoreEvent::RequestTimeout { .. })));

    // The parked request still completes once the endpoint frees up.
    let slow_result = slow.await.unwrap().unwrap();
    assert_eq!(slow_result.status, Status::Success);

    core.shutdown().await;
}

#[tokio::test]
async fn test_saturated_pool_completes_within_deadline() {
    let mock = MockCluster::start_default().await;
    let config = CoreConfig::builder()
        .kv_pool(|p| p.min_endpoints(1).max_endpoints(1).max_in_flight(1))
        .unwrap()
        .build()
        .unwrap();
    let (core, _bus) = connect_core(&mock, config).await;

    mock.script_upserts([KvReply::Delay(
        Duration::from_millis(150),
        Box::new(KvReply::Success {
            cas: 1,
            token: None,
        }),
    )]);

    let core_slow = core.clone();
    let slow = tokio::spawn(async move {
        core_slow
            .dispatch(KvOperation::new(upsert(b"slow")).with_timeout(Duration::from_secs(2)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Retries under backoff until the endpoint frees, then completes.
    let response = core
        .dispatch(KvOperation::new(upsert(b"queued")).with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Success);

    slow.await.unwrap().unwrap();
    core.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_refuses_new_requests() {
    let mock = MockCluster::start_default().await;
    let (core, _bus) = connect_core(&mock, CoreConfig::default()).await;

    core.shutdown().await;

    let result = core.dispatch(upsert(b"k")).await;
    assert!(matches!(result, Err(CoreError::RequestCanceled { .. })));
}

#[tokio::test]
async fn test_subdoc_partial_success_round_trip() {
    use reef_core::protocol::{SubdocCommand, SubdocCommandType};

    let mock = MockCluster::start_default().await;
    let (core, _bus) = connect_core(&mock, CoreConfig::default()).await;

    // Three mutations; the mock fails the nested path with PATH_NOT_FOUND
    // and answers the frame with SUBDOC_MULTI_PATH_FAILURE.
    let commands = vec![
        SubdocCommand::mutation(SubdocCommandType::DictUpsert, "/a", b"1".to_vec(), false, false),
        SubdocCommand::mutation(SubdocCommandType::DictUpsert, "/x/y", b"2".to_vec(), false, false),
        SubdocCommand::mutation(SubdocCommandType::DictUpsert, "/b", b"3".to_vec(), false, false),
    ];
    let response = core
        .dispatch(KvRequest::SubdocMultiMutate {
            key: DocKey::new(b"doc".to_vec()),
            commands,
            doc_flags: 0,
            expiry: 0,
            cas: 0,
        })
        .await
        .unwrap();

    // Partial success surfaces as success with the per-op vector exposed.
    assert_eq!(response.status, Status::Success);
    assert_eq!(response.subdoc_ops.len(), 3);
    assert_eq!(response.subdoc_ops[0].status, Status::Success);
    assert_eq!(response.subdoc_ops[1].status, Status::SubdocPathNotFound);
    assert_eq!(response.subdoc_ops[2].status, Status::Success);

    core.shutdown().await;
}

#[tokio::test]
async fn test_subdoc_single_command_failure_surfaced() {
    use reef_core::protocol::{SubdocCommand, SubdocCommandType};

    let mock = MockCluster::start_default().await;
    let (core, _bus) = connect_core(&mock, CoreConfig::default()).await;

    let result = core
        .dispatch(KvRequest::SubdocMultiMutate {
            key: DocKey::new(b"doc".to_vec()),
            commands: vec![SubdocCommand::mutation(
                SubdocCommandType::DictUpsert,
                "/x/y",
                b"2".to_vec(),
                false,
                false,
            )],
            doc_flags: 0,
            expiry: 0,
            cas: 0,
        })
        .await;

    match result {
        Err(CoreError::SubDocument { kind, .. }) => {
            assert_eq!(kind, reef_core::SubDocumentErrorKind::PathNotFound);
        }
        other => panic!("expected SubDocument error, got {:?}", other),
    }

    core.shutdown().await;
}
