//! Event bridges
//!
//! Translate transport events into orchestrator state and [`ClientEvent`]s:
//!
//! - the engine bridge consumes [`SessionEvent`]s from the peer engine
//! - the carrier bridge consumes transport-level [`CarrierEvent`]s
//! - one watcher per carrier call consumes its [`CarrierCallEvent`]s
//! - the lifecycle listener republishes boot progress
//!
//! Bridges hold only a weak reference to the orchestrator and exit once it is
//! dropped.

use std::sync::{Arc, Weak};

use callbridge_session_core::{EndReason, NegotiationState, SessionEvent};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::manager::CallOrchestrator;
use super::types::{CallState, IncomingCall};
use crate::carrier::{CarrierCallEvent, CarrierEvent};
use crate::connection::ConnectionState;
use crate::error::{ClientError, Service};
use crate::events::{ClientEvent, IncomingCallInfo};
use crate::lifecycle::{CallMode, LifecycleEvent, TransportKind, TransportState};

/// Receive the next event, skipping over lag; `None` once the channel closes
async fn next_event<E: Clone>(rx: &mut broadcast::Receiver<E>, source: &str) -> Option<E> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => warn!(source, skipped, "Event bridge lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

impl CallOrchestrator {
    /// Start the engine and carrier bridges and the lifecycle listener
    pub(crate) fn start_bridges(self: &Arc<Self>) {
        let mut bridges = Vec::new();

        let weak = Arc::downgrade(self);
        let mut session_events = self.engine.subscribe();
        bridges.push(tokio::spawn(async move {
            while let Some(event) = next_event(&mut session_events, "engine").await {
                let Some(orchestrator) = weak.upgrade() else { break };
                orchestrator.on_session_event(event).await;
            }
            debug!("Engine bridge stopped");
        }));

        if let Some(carrier) = &self.carrier {
            let weak = Arc::downgrade(self);
            let mut carrier_events = carrier.subscribe();
            bridges.push(tokio::spawn(async move {
                while let Some(event) = next_event(&mut carrier_events, "carrier").await {
                    let Some(orchestrator) = weak.upgrade() else { break };
                    orchestrator.on_carrier_event(event).await;
                }
                debug!("Carrier bridge stopped");
            }));
        }

        self.bridges.lock().extend(bridges);

        let weak: Weak<CallOrchestrator> = Arc::downgrade(self);
        let subscription = self.lifecycle.subscribe(move |event| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_lifecycle_event(event);
            }
        });
        *self.lifecycle_subscription.lock() = Some(subscription);
    }

    fn on_lifecycle_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::StateChanged { to, .. } => {
                self.events.emit(ClientEvent::InitializationChanged { state: *to, stage: self.lifecycle.stage() });
                self.emit_status();
            }
            LifecycleEvent::StageChanged { stage } => {
                self.events.emit(ClientEvent::InitializationChanged {
                    state: self.lifecycle.state(),
                    stage: Some(*stage),
                });
            }
            LifecycleEvent::ModeChanged { from, to } => {
                debug!(%from, %to, "Call mode changed");
                self.emit_status();
            }
            LifecycleEvent::TransportChanged { .. } | LifecycleEvent::RetryScheduled { .. } => {}
        }
    }

    // ===== PEER ENGINE =====

    async fn on_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::IncomingCall { call_id, from } => {
                let busy = self.active.lock().as_ref().map(|call| call.info.call_id.clone());
                if let Some(active) = busy {
                    info!(call_id = %call_id, from = %from, active_call = %active, "Declining peer call while busy");
                    if let Err(e) = self.engine.reject_call(&call_id).await {
                        debug!(call_id = %call_id, error = %e, "Offer already gone");
                    }
                    return;
                }
                self.incoming.lock().insert(
                    call_id.clone(),
                    IncomingCall { mode: CallMode::Peer, from: from.clone(), carrier_call: None },
                );
                self.events.emit(ClientEvent::IncomingCall {
                    info: IncomingCallInfo { call_id, from, mode: CallMode::Peer, received_at: Utc::now() },
                });
            }
            SessionEvent::CallAnswered { call_id } => {
                debug!(call_id = %call_id, "Answer sent");
            }
            SessionEvent::NegotiationStateChanged { call_id, state } => match state {
                NegotiationState::Answered | NegotiationState::IceChecking => {
                    let current = self.current_info(&call_id).map(|info| info.state);
                    if current == Some(CallState::Ringing) {
                        if let Some(mode) = self.set_call_state(&call_id, CallState::Connecting) {
                            self.connection.request(ConnectionState::Connecting);
                            self.arm_watchdog(&call_id);
                            self.emit_call_state(&call_id, CallState::Connecting, mode);
                        }
                    }
                }
                NegotiationState::Connected => self.on_call_connected(&call_id).await,
                NegotiationState::Disconnected => {
                    if let Some(mode) = self.set_call_state(&call_id, CallState::Reconnecting) {
                        self.connection.request(ConnectionState::Disconnected);
                        self.emit_call_state(&call_id, CallState::Reconnecting, mode);
                    }
                }
                _ => {}
            },
            SessionEvent::ConnectionStateChanged { call_id, state } => {
                debug!(call_id = %call_id, ?state, "Peer connection state");
            }
            SessionEvent::LocalStream { call_id, stream } => {
                self.events.emit(ClientEvent::LocalStream { call_id, stream_id: stream.id });
            }
            SessionEvent::RemoteStream { call_id, stream } => {
                self.events.emit(ClientEvent::RemoteStream { call_id, stream_id: stream.id });
            }
            SessionEvent::QualityChanged { call_id, quality } => {
                self.events.emit(ClientEvent::ConnectionQuality { call_id, quality });
            }
            SessionEvent::Troubleshooting { call_id, report } => {
                warn!(call_id = %call_id, ?report, "Peer negotiation stalled");
            }
            SessionEvent::CallEnded { call_id, reason } => {
                if self.finish_call(&call_id, reason).await {
                    return;
                }
                let pending = self.incoming.lock().remove(&call_id);
                if let Some(pending) = pending {
                    self.events.emit(ClientEvent::CallEnded { call_id, reason, mode: pending.mode });
                }
            }
            SessionEvent::Error { call_id, error } => {
                warn!(call_id = ?call_id, error = %error, "Peer engine error");
                self.events.emit(ClientEvent::error(ClientError::from(error), Some(Service::Peer), true));
            }
        }
    }

    // ===== CARRIER =====

    async fn on_carrier_event(self: &Arc<Self>, event: CarrierEvent) {
        match event {
            CarrierEvent::Incoming(call) => {
                let call_id = call.id();
                let from = call.remote();
                let busy = self.active.lock().is_some();
                if busy {
                    info!(call_id = %call_id, from = %from, "Declining carrier call while busy");
                    if let Err(e) = call.reject().await {
                        warn!(call_id = %call_id, error = %e, "Failed to decline carrier call");
                    }
                    return;
                }

                let events = call.subscribe();
                self.incoming.lock().insert(
                    call_id.clone(),
                    IncomingCall { mode: CallMode::Carrier, from: from.clone(), carrier_call: Some(call) },
                );
                self.spawn_carrier_call_watcher(call_id.clone(), events);
                self.events.emit(ClientEvent::IncomingCall {
                    info: IncomingCallInfo { call_id, from, mode: CallMode::Carrier, received_at: Utc::now() },
                });
            }
            CarrierEvent::Registered => {
                let state = self.lifecycle.transport_state(TransportKind::Carrier);
                if matches!(state, TransportState::Initializing | TransportState::Failed) {
                    self.lifecycle
                        .update_transport_state(TransportKind::Carrier, TransportState::Ready, None);
                }
            }
            CarrierEvent::Unregistered => {
                if self.lifecycle.transport_state(TransportKind::Carrier) == TransportState::Ready {
                    self.lifecycle.update_transport_state(
                        TransportKind::Carrier,
                        TransportState::Failed,
                        Some("unregistered".to_string()),
                    );
                }
            }
            CarrierEvent::Error(error) => {
                if self.lifecycle.transport_state(TransportKind::Carrier) == TransportState::Disabled {
                    debug!(code = %error.code, "Ignoring error from disabled carrier");
                    return;
                }
                self.on_carrier_failure(error);
            }
        }
    }

    pub(crate) fn spawn_carrier_call_watcher(
        self: &Arc<Self>,
        call_id: String,
        mut events: broadcast::Receiver<CarrierCallEvent>,
    ) {
        let weak = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            while let Some(event) = next_event(&mut events, "carrier-call").await {
                let Some(orchestrator) = weak.upgrade() else { break };
                if !orchestrator.on_carrier_call_event(&call_id, event).await {
                    break;
                }
            }
            debug!(call_id = %call_id, "Carrier call watcher stopped");
        });
        let mut bridges = self.bridges.lock();
        bridges.retain(|task| !task.is_finished());
        bridges.push(watcher);
    }

    /// Apply one carrier call event; false once the call is over
    async fn on_carrier_call_event(&self, call_id: &str, event: CarrierCallEvent) -> bool {
        match event {
            CarrierCallEvent::Ringing => true,
            CarrierCallEvent::Accepted => {
                self.on_call_connected(call_id).await;
                true
            }
            CarrierCallEvent::Disconnected => {
                self.end_carrier_call(call_id, EndReason::RemoteHangup).await;
                false
            }
            CarrierCallEvent::Rejected => {
                self.end_carrier_call(call_id, EndReason::Rejected).await;
                false
            }
            CarrierCallEvent::Cancelled => {
                self.end_carrier_call(call_id, EndReason::Missed).await;
                false
            }
            CarrierCallEvent::Error(error) => {
                warn!(call_id, error = %error, "Carrier call failed");
                self.events.emit(ClientEvent::error(error.into(), Some(Service::Carrier), false));
                self.end_carrier_call(call_id, EndReason::Failed).await;
                false
            }
        }
    }

    async fn end_carrier_call(&self, call_id: &str, reason: EndReason) {
        if self.finish_call(call_id, reason).await {
            return;
        }
        let pending = self.incoming.lock().remove(call_id);
        if pending.is_some() {
            info!(call_id, %reason, "Inbound carrier call ended before answer");
            self.events.emit(ClientEvent::CallEnded { call_id: call_id.to_string(), reason, mode: CallMode::Carrier });
        }
    }

    // ===== SHARED CALL PROGRESS =====

    pub(crate) async fn on_call_connected(&self, call_id: &str) {
        let (mode, start_recording) = {
            let mut active = self.active.lock();
            let Some(call) = active.as_mut().filter(|call| call.info.call_id == call_id) else {
                return;
            };
            if call.info.state == CallState::Connected {
                return;
            }
            call.info.state = CallState::Connected;
            if let Some(watchdog) = call.watchdog.take() {
                watchdog.abort();
            }
            let start = self.recorder.is_some() && !call.recording;
            call.recording |= start;
            (call.info.mode, start)
        };

        info!(call_id, %mode, "Call connected");
        self.connection.request(ConnectionState::Connected);
        self.emit_call_state(call_id, CallState::Connected, mode);

        if !start_recording {
            return;
        }
        if let Some(recorder) = &self.recorder {
            match recorder.start(call_id).await {
                Ok(()) => self.events.emit(ClientEvent::RecordingStarted { call_id: call_id.to_string() }),
                Err(e) => {
                    if let Some(call) = self.active.lock().as_mut().filter(|c| c.info.call_id == call_id) {
                        call.recording = false;
                    }
                    self.events
                        .emit(ClientEvent::RecordingError { call_id: call_id.to_string(), reason: e.to_string() });
                }
            }
        }
    }

    /// Tear the call down if it has not connected within `stuck_call`
    pub(crate) fn arm_watchdog(self: &Arc<Self>, call_id: &str) {
        let weak = Arc::downgrade(self);
        let watched = call_id.to_string();
        let timeout = self.config.timeouts.stuck_call;

        let mut active = self.active.lock();
        let Some(call) = active.as_mut().filter(|call| call.info.call_id == call_id) else {
            return;
        };
        if call.watchdog.is_some() {
            return;
        }
        call.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(orchestrator) = weak.upgrade() else { return };
            orchestrator.on_watchdog_fired(&watched).await;
        }));
    }

    async fn on_watchdog_fired(&self, call_id: &str) {
        let carrier_call = {
            let mut active = self.active.lock();
            let Some(call) = active.as_mut().filter(|call| call.info.call_id == call_id) else {
                return;
            };
            // Detach ourselves so the teardown does not abort this task
            call.watchdog.take();
            if call.info.state == CallState::Connected {
                return;
            }
            call.carrier_call.clone()
        };

        warn!(call_id, timeout = ?self.config.timeouts.stuck_call, "Call stuck connecting, ending it");
        match carrier_call {
            Some(carrier_call) => {
                let Some(call) = self.take_active(Some(call_id)) else { return };
                if let Err(e) = carrier_call.disconnect().await {
                    warn!(call_id, error = %e, "Failed to disconnect stuck call");
                }
                self.report_call_ended(call, EndReason::Timeout).await;
            }
            None => {
                if let Err(e) = self.engine.end_call_with(EndReason::Timeout).await {
                    debug!(call_id, error = %e, "Engine had no session for stuck call");
                    self.finish_call(call_id, EndReason::Timeout).await;
                }
            }
        }
    }
}
