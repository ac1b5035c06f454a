//! The call orchestrator
//!
//! [`CallOrchestrator`] owns every collaborator of one client: the boot
//! lifecycle, the rate limiter, the token and lookup services, the mode
//! resolver, the peer negotiation engine and the optional carrier transport.
//! This file holds construction, boot and shutdown; call operations live in
//! `calls.rs`, in-call controls in `controls.rs` and the transport event
//! bridges in `events.rs`.
//!
//! # Boot
//!
//! ```text
//! initialize(credential, identity)
//!   └─ lifecycle.start_boot()
//!        ├─ Completed  -> cached BootResult
//!        ├─ InFlight   -> wait on the shared handle
//!        ├─ Error      -> InvalidState (retry_initialization only)
//!        └─ Started    -> run_boot (bounded by timeouts.boot)
//!             ├─ FetchingToken       token service (single-flight)
//!             ├─ InitializingPeer    ┐
//!             ├─ InitializingCarrier ┘ booted concurrently
//!             └─ Finalizing          mode from transport states
//! ```
//!
//! Peer boot failure fails the cycle. Carrier boot failure is reported once
//! per cycle as a non-fatal carrier error and the cycle continues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use callbridge_session_core::NegotiationEngine;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::ClientConfig;
use super::recovery::with_timeout;
use super::types::{ActiveCall, CallRecorder, IncomingCall, OrchestratorStatus};
use crate::carrier::{CarrierError, CarrierTransport};
use crate::connection::{ConnectionState, TransitionQueue};
use crate::error::{ClientError, ClientResult, Service};
use crate::events::{ClientEvent, EventEmitter, Subscription};
use crate::lifecycle::{
    BootResult, BootStage, BootStart, CallMode, InitLifecycleManager, LifecycleState, TransportKind,
    TransportState,
};
use crate::lookup::PhoneLookupService;
use crate::rate_limiter::RateLimiter;
use crate::resolver::{CallModeResolver, TransportSnapshot};
use crate::token::TokenService;

#[derive(Clone)]
pub(crate) struct Credentials {
    pub credential: String,
    pub identity: String,
}

/// Dual-transport call orchestrator
///
/// Built by [`super::builder::ClientBuilder`]; always held in an `Arc`.
pub struct CallOrchestrator {
    pub(crate) config: ClientConfig,
    pub(crate) lifecycle: Arc<InitLifecycleManager>,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) lookup: Option<Arc<PhoneLookupService>>,
    pub(crate) resolver: CallModeResolver,
    pub(crate) engine: Arc<NegotiationEngine>,
    pub(crate) carrier: Option<Arc<dyn CarrierTransport>>,
    pub(crate) recorder: Option<Arc<dyn CallRecorder>>,
    pub(crate) events: Arc<EventEmitter<ClientEvent>>,
    pub(crate) connection: TransitionQueue,
    pub(crate) credentials: RwLock<Option<Credentials>>,
    pub(crate) active: Mutex<Option<ActiveCall>>,
    pub(crate) incoming: Mutex<HashMap<String, IncomingCall>>,
    pub(crate) bridges: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) lifecycle_subscription: Mutex<Option<Subscription>>,
    /// Set once the current boot cycle has reported a carrier failure
    pub(crate) carrier_error_reported: AtomicBool,
}

impl CallOrchestrator {
    // ===== BOOT =====

    /// Boot both transports, or join the boot already running
    ///
    /// An empty `identity` falls back to the identity vended with the token.
    pub async fn initialize(self: &Arc<Self>, credential: &str, identity: &str) -> ClientResult<BootResult> {
        if credential.trim().is_empty() {
            return Err(ClientError::InvalidCredential);
        }

        match self.lifecycle.start_boot()? {
            BootStart::Completed(result) => {
                debug!(identity = %result.identity, "Already initialized");
                Ok(result)
            }
            BootStart::InFlight(handle) => {
                debug!("Joining in-flight boot");
                handle.wait().await
            }
            BootStart::Started(handle) => {
                *self.credentials.write() = Some(Credentials {
                    credential: credential.to_string(),
                    identity: identity.to_string(),
                });
                self.spawn_boot();
                handle.wait().await
            }
        }
    }

    /// Start another boot cycle after a failed one
    ///
    /// Fails with `NotRetryable` when the last error is not retryable or the
    /// retry budget is spent; no boot is attempted in that case.
    pub async fn retry_initialization(self: &Arc<Self>) -> ClientResult<BootResult> {
        if self.credentials.read().is_none() {
            return Err(ClientError::NotInitialized);
        }
        match self.lifecycle.retry()? {
            BootStart::Started(handle) => {
                info!(budget = ?self.lifecycle.retry_budget(), "Retrying initialization");
                self.spawn_boot();
                handle.wait().await
            }
            other => other.wait().await,
        }
    }

    fn spawn_boot(self: &Arc<Self>) {
        let orchestrator = self.clone();
        // The boot outlives a caller that stops waiting on its handle
        tokio::spawn(async move { orchestrator.run_boot().await });
    }

    async fn run_boot(self: Arc<Self>) {
        let Some(handle) = self.lifecycle.current_handle() else {
            warn!("Boot task started without a running cycle");
            return;
        };
        self.carrier_error_reported.store(false, Ordering::SeqCst);

        let outcome = with_timeout("boot", self.config.timeouts.boot, self.boot_transports()).await;
        if handle.is_finished() {
            // Reset while booting; undo whatever came up
            info!("Boot cycle cancelled, stopping transports");
            self.stop_transports().await;
            return;
        }

        match outcome {
            Ok(result) => {
                if let Err(e) = self.lifecycle.complete_boot(result) {
                    debug!(error = %e, "Boot finished after lifecycle moved on");
                }
            }
            Err(e) => {
                error!(error = %e, "Initialization failed");
                self.stop_transports().await;
                self.connection.request(ConnectionState::Failed);
                self.events.emit(ClientEvent::error(e.clone(), service_of(&e), false));
                if let Err(state_err) = self.lifecycle.fail_boot(e) {
                    debug!(error = %state_err, "Boot failed after lifecycle moved on");
                }
            }
        }
    }

    async fn boot_transports(&self) -> ClientResult<BootResult> {
        let credentials = self.credentials.read().clone().ok_or(ClientError::NotInitialized)?;
        self.connection.request(ConnectionState::Initializing);

        self.lifecycle.update_stage(BootStage::FetchingToken)?;
        let token = self.tokens.get_token(&credentials.credential).await?;
        if let Some(lookup) = &self.lookup {
            lookup.set_credential(Some(credentials.credential.clone()));
        }

        let identity = if credentials.identity.trim().is_empty() {
            token.identity.clone()
        } else {
            credentials.identity.clone()
        };

        self.lifecycle.update_stage(BootStage::InitializingPeer)?;
        self.lifecycle
            .update_transport_state(TransportKind::Peer, TransportState::Initializing, None);

        let carrier_token = match (&self.carrier, token.carrier_enabled()) {
            (Some(_), true) => token.carrier_token.clone(),
            _ => None,
        };
        let carrier_state = if carrier_token.is_some() {
            TransportState::Initializing
        } else {
            TransportState::Disabled
        };
        self.lifecycle
            .update_transport_state(TransportKind::Carrier, carrier_state, None);
        self.lifecycle.update_stage(BootStage::InitializingCarrier)?;

        let (peer, ()) = tokio::join!(self.boot_peer(&identity), self.boot_carrier(carrier_token));
        peer?;

        self.lifecycle.update_stage(BootStage::Finalizing)?;
        let mode = self.lifecycle.mode();
        if mode == CallMode::None {
            return Err(ClientError::NoModeAvailable);
        }

        self.connection.request(ConnectionState::Ready);
        Ok(BootResult::new(mode, identity))
    }

    async fn boot_peer(&self, identity: &str) -> ClientResult<()> {
        match self.engine.start(identity) {
            Ok(()) => {
                self.lifecycle
                    .update_transport_state(TransportKind::Peer, TransportState::Ready, None);
                info!(identity, "Peer transport ready");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.update_transport_state(
                    TransportKind::Peer,
                    TransportState::Failed,
                    Some(e.to_string()),
                );
                Err(ClientError::transport_failed(Service::Peer, e.to_string()))
            }
        }
    }

    async fn boot_carrier(&self, token: Option<String>) {
        let (Some(carrier), Some(token)) = (&self.carrier, token) else {
            debug!("Carrier transport disabled for this boot");
            return;
        };

        match carrier.register(&token).await {
            Ok(()) => {
                self.lifecycle
                    .update_transport_state(TransportKind::Carrier, TransportState::Ready, None);
                info!("Carrier transport ready");
            }
            Err(e) => self.on_carrier_failure(e),
        }
    }

    /// Mark the carrier failed and report it once per boot cycle
    pub(crate) fn on_carrier_failure(&self, error: CarrierError) {
        if error.code.is_token_error() {
            self.tokens.invalidate();
        }
        self.lifecycle.update_transport_state(
            TransportKind::Carrier,
            TransportState::Failed,
            Some(error.to_string()),
        );

        if self.carrier_error_reported.swap(true, Ordering::SeqCst) {
            debug!(code = %error.code, "Carrier failure already reported");
            return;
        }
        warn!(code = %error.code, "Carrier transport unavailable, continuing without it");
        self.events
            .emit(ClientEvent::error(error.into(), Some(Service::Carrier), true));
    }

    async fn stop_transports(&self) {
        self.engine.stop().await;
        if let Some(carrier) = &self.carrier {
            if let Err(e) = carrier.unregister().await {
                warn!(error = %e, "Failed to unregister carrier transport");
            }
        }
    }

    // ===== SHUTDOWN =====

    /// End any call, stop both transports and return the lifecycle to idle
    pub async fn shutdown(&self) -> ClientResult<()> {
        let owner = format!("shutdown-{}", Uuid::new_v4());
        if self.lifecycle.lock().try_acquire(&owner).is_err() {
            // A boot holds the lock; cancelling it releases the lock
            self.lifecycle.reset();
            self.lifecycle.lock().try_acquire(&owner)?;
        }

        if self.active.lock().is_some() {
            if let Err(e) = self.end_call().await {
                warn!(error = %e, "Failed to end call during shutdown");
            }
        }

        let pending: Vec<String> = self.incoming.lock().keys().cloned().collect();
        for call_id in pending {
            if let Err(e) = self.reject_call(&call_id).await {
                debug!(call_id, error = %e, "Failed to reject pending call during shutdown");
            }
        }

        self.stop_transports().await;
        if let Some(lookup) = &self.lookup {
            lookup.set_credential(None);
        }
        self.tokens.invalidate();
        self.credentials.write().take();

        self.lifecycle.reset();
        self.connection.request(ConnectionState::Idle);
        self.lifecycle.lock().release(&owner);
        info!("Orchestrator shut down");
        Ok(())
    }

    // ===== STATUS & SUBSCRIPTIONS =====

    pub fn status(&self) -> OrchestratorStatus {
        let active_call = self.active.lock().as_ref().map(|call| call.info.clone());
        OrchestratorStatus {
            lifecycle: self.lifecycle.state(),
            mode: self.lifecycle.mode(),
            peer_state: self.lifecycle.transport_state(TransportKind::Peer),
            carrier_state: self.lifecycle.transport_state(TransportKind::Carrier),
            connection_state: self.connection.current(),
            muted: active_call.as_ref().map(|c| c.muted).unwrap_or(false),
            on_hold: active_call.as_ref().map(|c| c.on_hold).unwrap_or(false),
            active_call,
        }
    }

    pub(crate) fn emit_status(&self) {
        self.events.emit(ClientEvent::StatusChanged { status: self.status() });
    }

    /// Register a synchronous event listener
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Receive events through a broadcast channel
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe_channel()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<InitLifecycleManager> {
        &self.lifecycle
    }

    pub fn engine(&self) -> &Arc<NegotiationEngine> {
        &self.engine
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.current()
    }

    /// Wait until every queued connection transition has been applied
    pub async fn flush_connection_state(&self) {
        self.connection.flush().await;
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle.state() == LifecycleState::Initialized
    }

    pub(crate) fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            peer: self.lifecycle.transport_state(TransportKind::Peer),
            carrier: self.lifecycle.transport_state(TransportKind::Carrier),
            peer_supported: self.engine.is_supported(),
        }
    }

    /// Connection state to settle on once no call is up
    pub(crate) fn idle_connection_state(&self) -> ConnectionState {
        if self.is_initialized() {
            ConnectionState::Ready
        } else {
            ConnectionState::Idle
        }
    }
}

fn service_of(error: &ClientError) -> Option<Service> {
    match error {
        ClientError::TransportFailed { service, .. } => Some(*service),
        ClientError::Unauthorized { .. } | ClientError::Forbidden { .. } | ClientError::ServerError { .. } => {
            Some(Service::Token)
        }
        _ => None,
    }
}

impl Drop for CallOrchestrator {
    fn drop(&mut self) {
        for bridge in self.bridges.get_mut().drain(..) {
            bridge.abort();
        }
        if let Some(subscription) = self.lifecycle_subscription.get_mut().take() {
            subscription.unsubscribe();
        }
        if let Some(call) = self.active.get_mut().as_mut() {
            if let Some(watchdog) = call.watchdog.take() {
                watchdog.abort();
            }
        }
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("lifecycle", &self.lifecycle.state())
            .field("mode", &self.lifecycle.mode())
            .field("connection", &self.connection.current())
            .field("carrier", &self.carrier.is_some())
            .finish()
    }
}
