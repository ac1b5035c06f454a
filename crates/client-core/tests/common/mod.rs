//! Shared fixtures for orchestrator integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callbridge_client_core::carrier::scripted::ScriptedCarrierTransport;
use callbridge_client_core::{
    CallMode, CallOrchestrator, CallState, ClientBuilder, ClientConfig, ClientError, ClientEvent, ClientResult,
    LookupProvider, LookupResult, TokenProvider, TransportToken,
};
use callbridge_session_core::loopback::{LoopbackPeerConnectionFactory, StaticMediaDevices};
use callbridge_session_core::{EndReason, MemorySignalingStore};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const CREDENTIAL: &str = "session-credential";

pub fn peer_token(identity: &str) -> TransportToken {
    TransportToken {
        mode: Some(CallMode::Peer),
        peer_ready: Some(true),
        carrier_token: None,
        identity: identity.to_string(),
        expires_at: None,
    }
}

pub fn dual_token(identity: &str) -> TransportToken {
    TransportToken {
        mode: Some(CallMode::Dual),
        peer_ready: Some(true),
        carrier_token: Some("carrier-jwt".to_string()),
        identity: identity.to_string(),
        expires_at: None,
    }
}

/// Token provider returning a fixed outcome after a delay
pub struct MockTokenProvider {
    outcome: Mutex<ClientResult<TransportToken>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockTokenProvider {
    pub fn new(token: TransportToken) -> Arc<Self> {
        Arc::new(Self { outcome: Mutex::new(Ok(token)), delay: Duration::from_millis(50), calls: AtomicUsize::new(0) })
    }

    pub fn failing(error: ClientError) -> Arc<Self> {
        Arc::new(Self { outcome: Mutex::new(Err(error)), delay: Duration::from_millis(10), calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn fetch_token(&self, _credential: &str) -> ClientResult<TransportToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.outcome.lock().clone()
    }
}

/// Lookup provider backed by a fixed phone -> identity table
pub struct MockLookupProvider {
    entries: Vec<(String, String)>,
    calls: AtomicUsize,
}

impl MockLookupProvider {
    pub fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            entries: entries.iter().map(|(p, i)| (p.to_string(), i.to_string())).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LookupProvider for MockLookupProvider {
    async fn lookup_phone(&self, phone: &str, _credential: Option<&str>) -> ClientResult<LookupResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .entries
            .iter()
            .find(|(p, _)| p == phone)
            .map(|(_, identity)| LookupResult {
                exists: true,
                identity: Some(identity.clone()),
                display_name: None,
            })
            .unwrap_or_else(LookupResult::not_found))
    }
}

pub struct Fixture {
    pub config: ClientConfig,
    pub tokens: Arc<MockTokenProvider>,
    pub lookup: Option<Arc<MockLookupProvider>>,
    pub factory: Arc<LoopbackPeerConnectionFactory>,
    pub carrier: Option<Arc<ScriptedCarrierTransport>>,
}

impl Fixture {
    pub fn new(tokens: Arc<MockTokenProvider>) -> Self {
        Self {
            config: ClientConfig::default(),
            tokens,
            lookup: None,
            factory: Arc::new(LoopbackPeerConnectionFactory::new()),
            carrier: None,
        }
    }

    pub fn with_carrier(mut self, carrier: ScriptedCarrierTransport) -> Self {
        self.carrier = Some(Arc::new(carrier));
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<MockLookupProvider>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_factory(mut self, factory: LoopbackPeerConnectionFactory) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn build(&self, store: &Arc<MemorySignalingStore>) -> Arc<CallOrchestrator> {
        let mut builder = ClientBuilder::new()
            .config(self.config.clone())
            .token_provider(self.tokens.clone())
            .peer_transport(self.factory.clone(), Arc::new(StaticMediaDevices::new()))
            .signaling_store(store.clone());
        if let Some(lookup) = &self.lookup {
            builder = builder.lookup_provider(lookup.clone());
        }
        if let Some(carrier) = &self.carrier {
            builder = builder.carrier(carrier.clone());
        }
        builder.build().await.expect("orchestrator builds")
    }
}

/// Build and boot a peer-only orchestrator for `identity`
pub async fn peer_client(store: &Arc<MemorySignalingStore>, identity: &str) -> Arc<CallOrchestrator> {
    let fixture = Fixture::new(MockTokenProvider::new(peer_token(identity)));
    let orchestrator = fixture.build(store).await;
    orchestrator.initialize(CREDENTIAL, identity).await.expect("boot succeeds");
    orchestrator
}

pub async fn next_matching<T>(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

pub async fn incoming_call(events: &mut broadcast::Receiver<ClientEvent>) -> (String, String, CallMode) {
    next_matching(events, |event| match event {
        ClientEvent::IncomingCall { info } => Some((info.call_id, info.from, info.mode)),
        _ => None,
    })
    .await
}

pub async fn call_state(events: &mut broadcast::Receiver<ClientEvent>, wanted: CallState) -> String {
    next_matching(events, |event| match event {
        ClientEvent::CallStateChanged { call_id, state, .. } if state == wanted => Some(call_id),
        _ => None,
    })
    .await
}

pub async fn call_ended(events: &mut broadcast::Receiver<ClientEvent>) -> (String, EndReason) {
    next_matching(events, |event| match event {
        ClientEvent::CallEnded { call_id, reason, .. } => Some((call_id, reason)),
        _ => None,
    })
    .await
}
