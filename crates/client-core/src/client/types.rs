//! Type definitions for the orchestrator facade

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::carrier::CarrierCall;
use crate::connection::ConnectionState;
use crate::error::ClientResult;
use crate::lifecycle::{CallMode, LifecycleState, TransportState};

// ===== CALL TYPES =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Orchestrator-level call state, common to both transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// Outbound call placed, waiting for the remote party
    Ringing,
    /// Answered, media path being established
    Connecting,
    Connected,
    /// Media path dropped, reconnection in progress
    Reconnecting,
    OnHold,
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Reconnecting => "reconnecting",
            CallState::OnHold => "on-hold",
            CallState::Ended => "ended",
        })
    }
}

/// Snapshot of the active call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub call_id: String,
    pub mode: CallMode,
    pub direction: CallDirection,
    /// Peer identity or phone number
    pub remote: String,
    /// Number dialed when the peer identity came from a lookup
    pub dialed: Option<String>,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub muted: bool,
    pub on_hold: bool,
}

/// The call the orchestrator currently owns
pub(crate) struct ActiveCall {
    pub info: CallInfo,
    pub carrier_call: Option<Arc<dyn CarrierCall>>,
    pub watchdog: Option<JoinHandle<()>>,
    pub recording: bool,
}

impl ActiveCall {
    pub fn new(info: CallInfo, carrier_call: Option<Arc<dyn CarrierCall>>) -> Self {
        Self { info, carrier_call, watchdog: None, recording: false }
    }
}

/// An inbound call waiting for accept or reject
#[derive(Clone)]
pub(crate) struct IncomingCall {
    pub mode: CallMode,
    pub from: String,
    pub carrier_call: Option<Arc<dyn CarrierCall>>,
}

// ===== STATUS =====

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub lifecycle: LifecycleState,
    pub mode: CallMode,
    pub peer_state: TransportState,
    pub carrier_state: TransportState,
    pub connection_state: ConnectionState,
    pub active_call: Option<CallInfo>,
    pub muted: bool,
    pub on_hold: bool,
}

// ===== COLLABORATORS =====

/// Call recording collaborator
///
/// Recording starts when a call connects and stops when it ends; the
/// orchestrator reports each outcome as a recording event.
#[async_trait]
pub trait CallRecorder: Send + Sync {
    async fn start(&self, call_id: &str) -> ClientResult<()>;

    async fn stop(&self, call_id: &str) -> ClientResult<()>;
}
