//! Call operations for the orchestrator
//!
//! Placing, answering, declining and ending calls. Every operation branches
//! on the transport that owns the call; the orchestrator tracks at most one
//! active call plus any number of inbound calls awaiting a decision.

use std::sync::Arc;

use callbridge_session_core::{EndReason, SessionError};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ActiveCall, CallDirection, CallInfo, CallState};
use crate::connection::ConnectionState;
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;
use crate::lifecycle::{CallMode, LifecycleState};
use crate::resolver::{DestinationKind, TransportChoice};

/// Call operations implementation for CallOrchestrator
impl super::manager::CallOrchestrator {
    /// Place an outbound call to a peer identity or phone number
    ///
    /// # Call Flow
    ///
    /// 1. Checks the rate limiter (fails `RateLimited` with a retry-after hint)
    /// 2. Waits out any in-flight boot
    /// 3. Resolves the transport through [`crate::resolver::CallModeResolver`]
    /// 4. Records the attempt against the rate limiter
    /// 5. Dispatches to the peer engine or the carrier transport
    ///
    /// Returns once the call is ringing; progress arrives as
    /// `CallStateChanged` events.
    pub async fn place_call(self: &Arc<Self>, destination: &str) -> ClientResult<CallInfo> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(ClientError::MissingDestination);
        }
        self.rate_limiter.check()?;
        self.ensure_idle()?;

        if let Some(handle) = self.lifecycle.current_handle() {
            debug!("Waiting for boot before placing call");
            handle.wait().await?;
        }
        if self.lifecycle.state() != LifecycleState::Initialized {
            return Err(ClientError::NotInitialized);
        }

        let choice = self.resolver.resolve(destination, &self.snapshot()).await?;
        self.rate_limiter.record()?;
        info!(destination, choice = %choice, "Placing call");

        self.connection.request(ConnectionState::Connecting);
        let placed = match choice {
            TransportChoice::Peer { identity, resolved_from } => match self.peer_target(identity, resolved_from).await {
                Ok((identity, dialed)) => self.place_peer_call(identity, dialed).await,
                Err(e) => Err(e),
            },
            TransportChoice::Carrier { target } => self.place_carrier_call(target).await,
        };

        match placed {
            Ok(info) => Ok(info),
            Err(e) => {
                warn!(destination, error = %e, "Failed to place call");
                self.connection.request(self.idle_connection_state());
                Err(e)
            }
        }
    }

    /// Identity to dial in peer mode, looking up phone-shaped targets once
    async fn peer_target(
        &self,
        identity: String,
        resolved_from: Option<String>,
    ) -> ClientResult<(String, Option<String>)> {
        if resolved_from.is_some() || DestinationKind::classify(&identity) != DestinationKind::PhoneNumber {
            return Ok((identity, resolved_from));
        }
        let lookup = self
            .lookup
            .as_ref()
            .ok_or_else(|| ClientError::CarrierRequired { destination: identity.clone() })?;
        match lookup.lookup_identity(&identity).await? {
            Some(resolved) => Ok((resolved, Some(identity))),
            None => Err(ClientError::RecipientNotFound { destination: identity }),
        }
    }

    async fn place_peer_call(self: &Arc<Self>, identity: String, dialed: Option<String>) -> ClientResult<CallInfo> {
        let call_id = Uuid::new_v4().to_string();
        let info = CallInfo {
            call_id: call_id.clone(),
            mode: CallMode::Peer,
            direction: CallDirection::Outbound,
            remote: identity.clone(),
            dialed,
            state: CallState::Ringing,
            started_at: Utc::now(),
            muted: false,
            on_hold: false,
        };
        // Installed first so engine events for this call find it
        self.install_call(ActiveCall::new(info.clone(), None))?;

        if let Err(e) = self.engine.start_call_with_id(&identity, &call_id).await {
            if let Some(call) = self.take_active(Some(&call_id)) {
                self.discard_call(call);
            }
            return Err(e.into());
        }

        // The remote side may already have answered
        let current = self.current_info(&call_id).unwrap_or(info);
        if current.state == CallState::Ringing {
            self.emit_call_state(&call_id, CallState::Ringing, CallMode::Peer);
        }
        Ok(current)
    }

    async fn place_carrier_call(self: &Arc<Self>, target: String) -> ClientResult<CallInfo> {
        let carrier = self
            .carrier
            .clone()
            .ok_or_else(|| ClientError::CarrierRequired { destination: target.clone() })?;
        let call = carrier.connect(&target).await?;
        let info = CallInfo {
            call_id: call.id(),
            mode: CallMode::Carrier,
            direction: CallDirection::Outbound,
            remote: target,
            dialed: None,
            state: CallState::Ringing,
            started_at: Utc::now(),
            muted: false,
            on_hold: false,
        };

        let events = call.subscribe();
        if let Err(e) = self.install_call(ActiveCall::new(info.clone(), Some(call.clone()))) {
            let _ = call.disconnect().await;
            return Err(e);
        }
        self.emit_call_state(&info.call_id, CallState::Ringing, CallMode::Carrier);
        self.spawn_carrier_call_watcher(info.call_id.clone(), events);
        Ok(info)
    }

    /// Answer an inbound call
    pub async fn accept_call(self: &Arc<Self>, call_id: &str) -> ClientResult<CallInfo> {
        self.ensure_idle()?;
        let pending = self
            .incoming
            .lock()
            .remove(call_id)
            .ok_or_else(|| ClientError::Session(SessionError::UnknownCall { call_id: call_id.to_string() }))?;

        let info = CallInfo {
            call_id: call_id.to_string(),
            mode: pending.mode,
            direction: CallDirection::Inbound,
            remote: pending.from.clone(),
            dialed: None,
            state: CallState::Connecting,
            started_at: Utc::now(),
            muted: false,
            on_hold: false,
        };
        self.install_call(ActiveCall::new(info.clone(), pending.carrier_call.clone()))?;
        self.connection.request(ConnectionState::Connecting);
        self.arm_watchdog(call_id);
        self.emit_call_state(call_id, CallState::Connecting, pending.mode);
        info!(call_id, from = %pending.from, mode = %pending.mode, "Accepting call");

        let accepted = match &pending.carrier_call {
            Some(call) => call.accept().await.map_err(ClientError::from),
            None => self.engine.accept_call(call_id).await.map(|_| ()).map_err(ClientError::from),
        };
        if let Err(e) = accepted {
            warn!(call_id, error = %e, "Failed to accept call");
            if let Some(call) = self.take_active(Some(call_id)) {
                self.discard_call(call);
            }
            return Err(e);
        }

        Ok(self.current_info(call_id).unwrap_or(info))
    }

    /// Decline an inbound call
    pub async fn reject_call(&self, call_id: &str) -> ClientResult<()> {
        let pending = self
            .incoming
            .lock()
            .remove(call_id)
            .ok_or_else(|| ClientError::Session(SessionError::UnknownCall { call_id: call_id.to_string() }))?;
        info!(call_id, from = %pending.from, "Rejecting call");

        let rejected = match &pending.carrier_call {
            Some(call) => call.reject().await.map_err(ClientError::from),
            None => self.engine.reject_call(call_id).await.map_err(ClientError::from),
        };
        if let Err(e) = &rejected {
            warn!(call_id, error = %e, "Transport failed to reject call");
        }

        self.events.emit(ClientEvent::CallEnded {
            call_id: call_id.to_string(),
            reason: EndReason::Rejected,
            mode: pending.mode,
        });
        rejected
    }

    /// Hang up the active call
    pub async fn end_call(&self) -> ClientResult<()> {
        let call = self.take_active(None).ok_or(ClientError::NoActiveCall)?;
        let call_id = call.info.call_id.clone();
        info!(call_id = %call_id, mode = %call.info.mode, "Ending call");

        let hung_up = match &call.carrier_call {
            Some(carrier_call) => carrier_call.disconnect().await.map_err(ClientError::from),
            None => match self.engine.end_call().await {
                Err(SessionError::NoActiveSession) => Ok(()),
                other => other.map_err(ClientError::from),
            },
        };
        if let Err(e) = &hung_up {
            warn!(call_id = %call_id, error = %e, "Transport failed to hang up");
        }

        self.report_call_ended(call, EndReason::LocalHangup).await;
        Ok(())
    }

    /// Snapshot of the active call, if any
    pub fn active_call(&self) -> Option<CallInfo> {
        self.active.lock().as_ref().map(|call| call.info.clone())
    }

    /// Inbound calls awaiting accept or reject, as `(call_id, from)`
    pub fn pending_calls(&self) -> Vec<(String, String)> {
        self.incoming
            .lock()
            .iter()
            .map(|(call_id, call)| (call_id.clone(), call.from.clone()))
            .collect()
    }

    // ===== HELPERS =====

    fn ensure_idle(&self) -> ClientResult<()> {
        match self.active.lock().as_ref() {
            Some(call) => Err(ClientError::CallAlreadyActive { call_id: call.info.call_id.clone() }),
            None => Ok(()),
        }
    }

    fn install_call(&self, call: ActiveCall) -> ClientResult<()> {
        let mut active = self.active.lock();
        if let Some(existing) = active.as_ref() {
            return Err(ClientError::CallAlreadyActive { call_id: existing.info.call_id.clone() });
        }
        *active = Some(call);
        Ok(())
    }

    /// Take the active call, optionally only if it is `call_id`
    pub(crate) fn take_active(&self, call_id: Option<&str>) -> Option<ActiveCall> {
        let mut active = self.active.lock();
        match (active.as_ref(), call_id) {
            (Some(call), Some(id)) if call.info.call_id != id => None,
            (Some(_), _) => active.take(),
            (None, _) => None,
        }
    }

    /// Drop a call that never got going, without end-of-call events
    fn discard_call(&self, mut call: ActiveCall) {
        if let Some(watchdog) = call.watchdog.take() {
            watchdog.abort();
        }
        debug!(call_id = %call.info.call_id, "Discarded call");
    }

    pub(crate) fn current_info(&self, call_id: &str) -> Option<CallInfo> {
        self.active
            .lock()
            .as_ref()
            .filter(|call| call.info.call_id == call_id)
            .map(|call| call.info.clone())
    }

    /// Update the active call's state; `None` when `call_id` is not active
    pub(crate) fn set_call_state(&self, call_id: &str, state: CallState) -> Option<CallMode> {
        let mut active = self.active.lock();
        let call = active.as_mut().filter(|call| call.info.call_id == call_id)?;
        call.info.state = state;
        Some(call.info.mode)
    }

    pub(crate) fn emit_call_state(&self, call_id: &str, state: CallState, mode: CallMode) {
        self.events.emit(ClientEvent::CallStateChanged { call_id: call_id.to_string(), state, mode });
        self.emit_status();
    }

    /// End the active call if it is `call_id`
    pub(crate) async fn finish_call(&self, call_id: &str, reason: EndReason) -> bool {
        match self.take_active(Some(call_id)) {
            Some(call) => {
                self.report_call_ended(call, reason).await;
                true
            }
            None => false,
        }
    }

    pub(crate) async fn report_call_ended(&self, mut call: ActiveCall, reason: EndReason) {
        if let Some(watchdog) = call.watchdog.take() {
            watchdog.abort();
        }
        let call_id = call.info.call_id.clone();
        let mode = call.info.mode;
        info!(call_id = %call_id, %reason, "Call ended");

        self.events.emit(ClientEvent::CallStateChanged { call_id: call_id.clone(), state: CallState::Ended, mode });
        self.events.emit(ClientEvent::CallEnded { call_id: call_id.clone(), reason, mode });

        if call.recording {
            if let Some(recorder) = &self.recorder {
                match recorder.stop(&call_id).await {
                    Ok(()) => self.events.emit(ClientEvent::RecordingStopped { call_id: call_id.clone() }),
                    Err(e) => self.events.emit(ClientEvent::RecordingError { call_id: call_id.clone(), reason: e.to_string() }),
                }
            }
        }

        self.connection.request(self.idle_connection_state());
        self.emit_status();
    }
}
