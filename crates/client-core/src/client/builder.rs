//! Orchestrator builder
//!
//! [`ClientBuilder`] assembles a [`CallOrchestrator`] from a [`ClientConfig`]
//! plus the collaborators the orchestrator drives:
//!
//! - the peer transport (peer connection factory and media devices), required
//! - the signaling store, defaulting to [`MemorySignalingStore`]
//! - the token and lookup providers, defaulting to the HTTP providers when an
//!   API base URL is configured
//! - the carrier transport and the call recorder, both optional
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use callbridge_client_core::ClientBuilder;
//! use callbridge_client_core::carrier::scripted::ScriptedCarrierTransport;
//! use callbridge_session_core::loopback::{LoopbackPeerConnectionFactory, StaticMediaDevices};
//!
//! # tokio_test::block_on(async {
//! let orchestrator = ClientBuilder::new()
//!     .api_base_url("https://api.example.com/v1/".parse().unwrap())
//!     .peer_transport(
//!         Arc::new(LoopbackPeerConnectionFactory::new()),
//!         Arc::new(StaticMediaDevices::new()),
//!     )
//!     .carrier(Arc::new(ScriptedCarrierTransport::new()))
//!     .build()
//!     .await
//!     .expect("orchestrator builds");
//! assert!(!orchestrator.is_initialized());
//! # })
//! ```

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use callbridge_session_core::{
    MediaDevices, MemorySignalingStore, NegotiationEngine, PeerConnectionFactory, SignalingStore,
};
use parking_lot::{Mutex, RwLock};
use tracing::info;
use url::Url;

use super::config::{ClientConfig, TimeoutConfig};
use super::manager::CallOrchestrator;
use super::types::CallRecorder;
use crate::carrier::CarrierTransport;
use crate::connection::{ConnectionState, TransitionQueue};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventEmitter};
use crate::lifecycle::{InitLifecycleManager, TransportKind};
use crate::lookup::{HttpLookupProvider, LookupProvider, PhoneLookupService};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::resolver::{CallModeResolver, SnapshotSource, TransportSnapshot};
use crate::token::{HttpTokenProvider, TokenProvider, TokenService};

/// Fluent builder for [`CallOrchestrator`]
pub struct ClientBuilder {
    config: ClientConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    lookup_provider: Option<Arc<dyn LookupProvider>>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    media: Option<Arc<dyn MediaDevices>>,
    signaling_store: Option<Arc<dyn SignalingStore>>,
    carrier: Option<Arc<dyn CarrierTransport>>,
    recorder: Option<Arc<dyn CallRecorder>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            token_provider: None,
            lookup_provider: None,
            peer_factory: None,
            media: None,
            signaling_store: None,
            carrier: None,
            recorder: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn api_base_url(mut self, url: Url) -> Self {
        self.config.api_base_url = Some(url);
        self
    }

    pub fn strict_mode_resolution(mut self, strict: bool) -> Self {
        self.config.strict_mode_resolution = strict;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn lookup_provider(mut self, provider: Arc<dyn LookupProvider>) -> Self {
        self.lookup_provider = Some(provider);
        self
    }

    /// Peer media collaborators; required
    pub fn peer_transport(mut self, factory: Arc<dyn PeerConnectionFactory>, media: Arc<dyn MediaDevices>) -> Self {
        self.peer_factory = Some(factory);
        self.media = Some(media);
        self
    }

    pub fn signaling_store(mut self, store: Arc<dyn SignalingStore>) -> Self {
        self.signaling_store = Some(store);
        self
    }

    pub fn carrier(mut self, carrier: Arc<dyn CarrierTransport>) -> Self {
        self.carrier = Some(carrier);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn CallRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Build the orchestrator and start its event bridges
    ///
    /// Must be called within a Tokio runtime.
    pub async fn build(self) -> ClientResult<Arc<CallOrchestrator>> {
        self.config.validate()?;
        let config = self.config;

        let (factory, media) = match (self.peer_factory, self.media) {
            (Some(factory), Some(media)) => (factory, media),
            _ => {
                return Err(ClientError::InvalidConfiguration {
                    field: "peer_transport".to_string(),
                    reason: "a peer connection factory and media devices are required".to_string(),
                })
            }
        };

        let token_provider: Arc<dyn TokenProvider> = match (self.token_provider, &config.api_base_url) {
            (Some(provider), _) => provider,
            (None, Some(url)) => Arc::new(HttpTokenProvider::new(url.clone())),
            (None, None) => {
                return Err(ClientError::InvalidConfiguration {
                    field: "api_base_url".to_string(),
                    reason: "required when no token provider is supplied".to_string(),
                })
            }
        };
        let lookup_provider: Option<Arc<dyn LookupProvider>> = match (self.lookup_provider, &config.api_base_url) {
            (Some(provider), _) => Some(provider),
            (None, Some(url)) => Some(Arc::new(HttpLookupProvider::new(url.clone()))),
            (None, None) => None,
        };

        let store = self
            .signaling_store
            .unwrap_or_else(|| Arc::new(MemorySignalingStore::new()));
        let engine = NegotiationEngine::new(config.engine_config(), factory, media, store);
        let lifecycle = Arc::new(InitLifecycleManager::new(config.retry_budget.max_retries));
        let tokens = Arc::new(TokenService::new(token_provider, config.timeouts.token_fetch));
        let lookup = lookup_provider.map(|provider| Arc::new(PhoneLookupService::new(provider, config.lookup.clone())));

        let recheck: SnapshotSource = {
            let lifecycle = lifecycle.clone();
            let engine = engine.clone();
            Arc::new(move || TransportSnapshot {
                peer: lifecycle.transport_state(TransportKind::Peer),
                carrier: lifecycle.transport_state(TransportKind::Carrier),
                peer_supported: engine.is_supported(),
            })
        };
        let mut resolver = CallModeResolver::new()
            .with_recheck(recheck)
            .with_grace(config.timeouts.peer_ready_grace)
            .with_strict(config.strict_mode_resolution);
        if let Some(lookup) = &lookup {
            resolver = resolver.with_lookup(lookup.clone());
        }

        let events = Arc::new(EventEmitter::new());
        let connection = {
            let events = events.clone();
            TransitionQueue::new(
                ConnectionState::Idle,
                Box::new(move |from, to| events.emit(ClientEvent::ConnectionStateChanged { from, to })),
            )
        };

        let orchestrator = Arc::new(CallOrchestrator {
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            config,
            lifecycle,
            tokens,
            lookup,
            resolver,
            engine,
            carrier: self.carrier,
            recorder: self.recorder,
            events,
            connection,
            credentials: RwLock::new(None),
            active: Mutex::new(None),
            incoming: Mutex::new(HashMap::new()),
            bridges: Mutex::new(Vec::new()),
            lifecycle_subscription: Mutex::new(None),
            carrier_error_reported: AtomicBool::new(false),
        });
        orchestrator.start_bridges();

        info!(
            carrier = orchestrator.carrier.is_some(),
            lookup = orchestrator.lookup.is_some(),
            strict = orchestrator.config.strict_mode_resolution,
            "Call orchestrator built"
        );
        Ok(orchestrator)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_session_core::loopback::{LoopbackPeerConnectionFactory, StaticMediaDevices};

    #[tokio::test]
    async fn test_peer_transport_is_required() {
        let err = ClientBuilder::new()
            .api_base_url(Url::parse("http://localhost:9").unwrap())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfiguration { ref field, .. } if field == "peer_transport"));
    }

    #[tokio::test]
    async fn test_token_source_is_required() {
        let err = ClientBuilder::new()
            .peer_transport(Arc::new(LoopbackPeerConnectionFactory::new()), Arc::new(StaticMediaDevices::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfiguration { ref field, .. } if field == "api_base_url"));
    }

    #[tokio::test]
    async fn test_built_orchestrator_starts_idle() {
        let orchestrator = ClientBuilder::new()
            .api_base_url(Url::parse("http://localhost:9").unwrap())
            .peer_transport(Arc::new(LoopbackPeerConnectionFactory::new()), Arc::new(StaticMediaDevices::new()))
            .build()
            .await
            .unwrap();

        let status = orchestrator.status();
        assert_eq!(status.lifecycle, crate::lifecycle::LifecycleState::Idle);
        assert_eq!(status.connection_state, ConnectionState::Idle);
        assert!(status.active_call.is_none());
    }
}
