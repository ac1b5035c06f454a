//! Boot lifecycle through the orchestrator facade
//!
//! Tokens, lookup and the carrier are scripted; the peer transport is the
//! session-core loopback factory. Time is paused so timers resolve instantly.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callbridge_client_core::carrier::scripted::{ScriptedCarrierBehavior, ScriptedCarrierTransport};
use callbridge_client_core::{
    CallMode, CarrierErrorCode, ClientError, ClientEvent, ConnectionState, LifecycleState, Service, TransportKind,
    TransportState,
};
use callbridge_session_core::loopback::LoopbackPeerConnectionFactory;
use callbridge_session_core::MemorySignalingStore;
use common::*;
use futures::future::join_all;

#[tokio::test(start_paused = true)]
async fn test_dual_boot_reaches_dual_mode() {
    let store = Arc::new(MemorySignalingStore::new());
    let fixture = Fixture::new(MockTokenProvider::new(dual_token("alice")))
        .with_carrier(ScriptedCarrierTransport::new());
    let orchestrator = fixture.build(&store).await;

    let result = orchestrator.initialize(CREDENTIAL, "alice").await.unwrap();
    assert_eq!(result.mode, CallMode::Dual);
    assert_eq!(result.active_modes, vec![CallMode::Peer, CallMode::Carrier]);
    assert_eq!(result.identity, "alice");

    orchestrator.flush_connection_state().await;
    let status = orchestrator.status();
    assert_eq!(status.lifecycle, LifecycleState::Initialized);
    assert_eq!(status.peer_state, TransportState::Ready);
    assert_eq!(status.carrier_state, TransportState::Ready);
    assert_eq!(status.connection_state, ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_carrier_token_rejection_degrades_to_peer_mode() {
    let store = Arc::new(MemorySignalingStore::new());
    let fixture = Fixture::new(MockTokenProvider::new(dual_token("alice"))).with_carrier(
        ScriptedCarrierTransport::with_behavior(ScriptedCarrierBehavior::failing(CarrierErrorCode::TokenInvalid)),
    );
    let orchestrator = fixture.build(&store).await;

    let carrier_errors = Arc::new(AtomicUsize::new(0));
    let fatal_errors = Arc::new(AtomicUsize::new(0));
    let _subscription = {
        let carrier_errors = carrier_errors.clone();
        let fatal_errors = fatal_errors.clone();
        orchestrator.subscribe(move |event| {
            if let ClientEvent::Error { service, non_fatal, .. } = event {
                if *service == Some(Service::Carrier) && *non_fatal {
                    carrier_errors.fetch_add(1, Ordering::SeqCst);
                } else if !*non_fatal {
                    fatal_errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    };

    let result = orchestrator.initialize(CREDENTIAL, "alice").await.unwrap();
    assert_eq!(result.mode, CallMode::Peer);
    assert_eq!(result.active_modes, vec![CallMode::Peer]);

    // Let the carrier bridge deliver the SDK's own error event
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(carrier_errors.load(Ordering::SeqCst), 1);
    assert_eq!(fatal_errors.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.lifecycle().transport_state(TransportKind::Carrier), TransportState::Failed);
    assert!(orchestrator.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn test_peer_failure_is_fatal_even_with_carrier_ready() {
    let store = Arc::new(MemorySignalingStore::new());
    let fixture = Fixture::new(MockTokenProvider::new(dual_token("alice")))
        .with_carrier(ScriptedCarrierTransport::new())
        .with_factory(LoopbackPeerConnectionFactory::unsupported());
    let orchestrator = fixture.build(&store).await;

    let err = orchestrator.initialize(CREDENTIAL, "alice").await.unwrap_err();
    assert!(
        matches!(err, ClientError::TransportFailed { service: Service::Peer, .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(orchestrator.lifecycle().state(), LifecycleState::Error);
    assert!(orchestrator.lifecycle().last_error().is_some());

    orchestrator.flush_connection_state().await;
    assert_eq!(orchestrator.connection_state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_is_enforced() {
    let store = Arc::new(MemorySignalingStore::new());
    let tokens = MockTokenProvider::failing(ClientError::network_error("api unreachable"));
    let fixture = Fixture::new(tokens.clone());
    let orchestrator = fixture.build(&store).await;

    assert!(orchestrator.initialize(CREDENTIAL, "alice").await.is_err());
    for attempt in 1..=3 {
        assert!(orchestrator.retry_initialization().await.is_err(), "retry {attempt} should fail");
        assert_eq!(orchestrator.lifecycle().retry_budget().count, attempt);
    }

    let calls_before = tokens.calls();
    let err = orchestrator.retry_initialization().await.unwrap_err();
    assert!(matches!(err, ClientError::NotRetryable { .. }), "unexpected error: {err:?}");
    assert_eq!(tokens.calls(), calls_before, "exhausted budget must not fetch again");
    assert_eq!(orchestrator.lifecycle().retry_budget().count, 3);
    assert_eq!(orchestrator.lifecycle().state(), LifecycleState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_boot_error_is_not_retried() {
    let store = Arc::new(MemorySignalingStore::new());
    let tokens = MockTokenProvider::failing(ClientError::Unauthorized { reason: "session expired".into() });
    let fixture = Fixture::new(tokens.clone());
    let orchestrator = fixture.build(&store).await;

    let err = orchestrator.initialize(CREDENTIAL, "alice").await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized { .. }));

    let err = orchestrator.retry_initialization().await.unwrap_err();
    assert!(matches!(err, ClientError::NotRetryable { .. }));
    assert_eq!(orchestrator.lifecycle().retry_budget().count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_after_failure_does_not_bypass_retry_policy() {
    let store = Arc::new(MemorySignalingStore::new());
    let tokens = MockTokenProvider::failing(ClientError::Unauthorized { reason: "expired".into() });
    let fixture = Fixture::new(tokens.clone());
    let orchestrator = fixture.build(&store).await;

    assert!(orchestrator.initialize(CREDENTIAL, "alice").await.is_err());
    assert_eq!(tokens.calls(), 1);
    assert!(matches!(
        orchestrator.retry_initialization().await,
        Err(ClientError::NotRetryable { .. })
    ));

    let err = orchestrator.initialize(CREDENTIAL, "alice").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState { .. }), "unexpected error: {err:?}");
    assert_eq!(tokens.calls(), 1, "a failed lifecycle must not fetch a token again");
    assert_eq!(orchestrator.lifecycle().retry_budget().count, 0);
    assert_eq!(orchestrator.lifecycle().state(), LifecycleState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_initialize_runs_one_boot() {
    let store = Arc::new(MemorySignalingStore::new());
    let tokens = MockTokenProvider::new(dual_token("alice"));
    let fixture = Fixture::new(tokens.clone()).with_carrier(ScriptedCarrierTransport::new());
    let orchestrator = fixture.build(&store).await;

    let results = join_all((0..5).map(|_| {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.initialize(CREDENTIAL, "alice").await }
    }))
    .await;

    let first = results[0].as_ref().unwrap().clone();
    for result in &results {
        assert_eq!(result.as_ref().unwrap(), &first);
    }
    assert_eq!(tokens.calls(), 1);
    assert_eq!(fixture.carrier.as_ref().unwrap().register_calls(), 1);

    // Once initialized, further calls return the stored result
    let again = orchestrator.initialize(CREDENTIAL, "alice").await.unwrap();
    assert_eq!(again, first);
    assert_eq!(tokens.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_credential_is_rejected() {
    let store = Arc::new(MemorySignalingStore::new());
    let fixture = Fixture::new(MockTokenProvider::new(peer_token("alice")));
    let orchestrator = fixture.build(&store).await;

    let err = orchestrator.initialize("  ", "alice").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidCredential));
    assert_eq!(fixture.tokens.calls(), 0);
    assert_eq!(orchestrator.lifecycle().state(), LifecycleState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_retry_before_initialize_fails() {
    let store = Arc::new(MemorySignalingStore::new());
    let fixture = Fixture::new(MockTokenProvider::new(peer_token("alice")));
    let orchestrator = fixture.build(&store).await;

    let err = orchestrator.retry_initialization().await.unwrap_err();
    assert!(matches!(err, ClientError::NotInitialized));
}

#[tokio::test(start_paused = true)]
async fn test_identity_falls_back_to_token_identity() {
    let store = Arc::new(MemorySignalingStore::new());
    let fixture = Fixture::new(MockTokenProvider::new(peer_token("user-42")));
    let orchestrator = fixture.build(&store).await;

    let result = orchestrator.initialize(CREDENTIAL, "").await.unwrap();
    assert_eq!(result.identity, "user-42");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_returns_to_idle_and_allows_reboot() {
    let store = Arc::new(MemorySignalingStore::new());
    let tokens = MockTokenProvider::new(dual_token("alice"));
    let fixture = Fixture::new(tokens.clone()).with_carrier(ScriptedCarrierTransport::new());
    let orchestrator = fixture.build(&store).await;
    orchestrator.initialize(CREDENTIAL, "alice").await.unwrap();

    orchestrator.shutdown().await.unwrap();
    orchestrator.flush_connection_state().await;

    let status = orchestrator.status();
    assert_eq!(status.lifecycle, LifecycleState::Idle);
    assert_eq!(status.peer_state, TransportState::Idle);
    assert_eq!(status.carrier_state, TransportState::Idle);
    assert_eq!(status.connection_state, ConnectionState::Idle);
    assert!(!orchestrator.lifecycle().lock().is_held());

    // The token cache was dropped, so a new boot fetches again
    orchestrator.initialize(CREDENTIAL, "alice").await.unwrap();
    assert_eq!(tokens.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_boot_publishes_stage_progress() {
    let store = Arc::new(MemorySignalingStore::new());
    let fixture = Fixture::new(MockTokenProvider::new(peer_token("alice")));
    let orchestrator = fixture.build(&store).await;
    let mut events = orchestrator.subscribe_events();

    orchestrator.initialize(CREDENTIAL, "alice").await.unwrap();

    let mut stages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::InitializationChanged { stage: Some(stage), .. } = event {
            if stages.last() != Some(&stage) {
                stages.push(stage);
            }
        }
    }
    use callbridge_client_core::BootStage::*;
    assert_eq!(stages, vec![FetchingToken, InitializingPeer, InitializingCarrier, Finalizing]);
}
