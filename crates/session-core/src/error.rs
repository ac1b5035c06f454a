//! Error types for the session negotiation engine
//!
//! Errors are grouped the same way the engine is split up:
//!
//! - **Media Errors** - raised by the local capture collaborator (permission, device)
//! - **Signaling Errors** - SDP applied in the wrong signaling state, store failures
//! - **Connectivity Errors** - ICE gathering/connection timeouts, failed connections
//! - **Lifecycle Errors** - no peer connection, session already active or closed

use thiserror::Error;

use crate::types::SignalingState;

/// Result type alias for session-core operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Typed failures raised by the peer-media collaborator when acquiring local media
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No audio input device found")]
    NoDevice,

    #[error("Audio input device is busy or in use by another application")]
    DeviceBusy,

    #[error("Media capture failed: {reason}")]
    Other { reason: String },
}

/// Errors produced while negotiating or running a peer session
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Remote SDP arrived while the peer connection was in a state that cannot accept it
    #[error("Cannot {operation} while signaling state is {state}")]
    SignalingOrder {
        operation: &'static str,
        state: SignalingState,
    },

    #[error("No peer connection has been created for this session")]
    NoPeerConnection,

    #[error("A call session is already active: {call_id}")]
    SessionBusy { call_id: String },

    #[error("No call session is active")]
    NoActiveSession,

    #[error("No call session matches {call_id}")]
    UnknownCall { call_id: String },

    #[error("ICE gathering did not complete within {timeout_ms}ms")]
    GatheringTimeout { timeout_ms: u64 },

    #[error("Peer connection was not established within {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    #[error("Peer connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectionFailed { attempts: u32 },

    #[error("Invalid ICE candidate: {reason}")]
    InvalidCandidate { reason: String },

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Signaling error: {reason}")]
    Signaling { reason: String },

    #[error("Peer transport error: {reason}")]
    Transport { reason: String },

    #[error("Peer transport is not supported by this runtime")]
    Unsupported,

    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Create a signaling error
    pub fn signaling(reason: impl Into<String>) -> Self {
        Self::Signaling { reason: reason.into() }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    /// Check if this error is a timeout that may succeed on a later attempt
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::GatheringTimeout { .. } | SessionError::ConnectionTimeout { .. }
        )
    }

    /// Check if this error is recoverable by retrying the same operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::GatheringTimeout { .. }
            | SessionError::ConnectionTimeout { .. }
            | SessionError::ConnectionFailed { .. }
            | SessionError::Signaling { .. }
            | SessionError::Transport { .. } => true,

            SessionError::Media(MediaError::DeviceBusy) => true,

            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            SessionError::SignalingOrder { .. } | SessionError::Signaling { .. } => "signaling",

            SessionError::GatheringTimeout { .. }
            | SessionError::ConnectionTimeout { .. }
            | SessionError::ConnectionFailed { .. }
            | SessionError::ReconnectionFailed { .. }
            | SessionError::InvalidCandidate { .. } => "connectivity",

            SessionError::Media(_) => "media",

            SessionError::NoPeerConnection
            | SessionError::NoActiveSession
            | SessionError::SessionBusy { .. }
            | SessionError::UnknownCall { .. }
            | SessionError::Closed => "session",

            SessionError::Transport { .. } | SessionError::Unsupported => "transport",
        }
    }
}
