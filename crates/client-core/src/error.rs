//! Error types and handling for the client-core library
//!
//! This module defines all error types that can occur during orchestration
//! and the policy that decides what happens to each of them.
//!
//! # Error Categories
//!
//! - **Input Errors** - missing credential or destination; fatal, never retried
//! - **Transport Errors** - a transport failed to boot; non-fatal for the carrier
//!   when peer mode came up, fatal otherwise
//! - **Network/Timeout Errors** - retryable, bounded by the lifecycle retry budget
//! - **Mode Errors** - no usable transport for a destination; surfaced, not retried
//! - **Rate Limit Errors** - carry a retry-after hint; never count against the budget
//! - **Signaling Order Errors** - SDP applied in the wrong state; the signal is dropped
//!
//! Every error maps to an [`ErrorCode`]. The static [`ErrorCode::policy`] table
//! says whether the code is retryable and whether it is fatal, and
//! [`ClientError::user_info`] gives the calling layer a title, description,
//! suggested action and `retryable` flag for display.
//!
//! ```rust
//! use callbridge_client_core::{ClientError, ErrorCode};
//!
//! let err = ClientError::ServerError { status: 503 };
//! assert_eq!(err.code(), ErrorCode::ServerError);
//! assert!(err.code().policy().retryable);
//! assert!(err.user_info().retryable);
//! ```

use std::fmt;
use std::time::Duration;

use callbridge_session_core::{MediaError, SessionError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for client-core operations
pub type ClientResult<T> = Result<T, ClientError>;

/// External service an error or event is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Carrier,
    Peer,
    Token,
    Lookup,
    Signaling,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Carrier => "carrier",
            Service::Peer => "peer",
            Service::Token => "token",
            Service::Lookup => "lookup",
            Service::Signaling => "signaling",
        };
        f.write_str(name)
    }
}

/// Comprehensive error types for call orchestration
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Input errors
    #[error("A credential is required to initialize")]
    InvalidCredential,

    #[error("A destination is required to place a call")]
    MissingDestination,

    /// Transport boot errors
    #[error("{service} transport failed: {reason}")]
    TransportFailed { service: Service, reason: String },

    /// Network and timeout errors
    #[error("Network error: {reason}")]
    NetworkError { reason: String },

    #[error("{operation} timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },

    /// Mode resolution errors
    #[error("No call mode is available")]
    NoModeAvailable,

    #[error("No user found for {destination}")]
    RecipientNotFound { destination: String },

    #[error("Calling {destination} requires carrier mode")]
    CarrierRequired { destination: String },

    #[error("Too many calls, retry in {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// Negotiation errors
    #[error("Signaling out of order: {reason}")]
    SignalingOrder { reason: String },

    /// Lifecycle errors
    #[error("Initialization lock is held by {owner}")]
    LockBusy { owner: String },

    #[error("Initialization cannot be retried: {reason}")]
    NotRetryable { reason: String },

    #[error("Initialization was cancelled")]
    BootCancelled,

    #[error("Cannot {operation} while lifecycle is {state}")]
    InvalidState { operation: String, state: String },

    #[error("Client is not initialized")]
    NotInitialized,

    /// Call errors
    #[error("No call is active")]
    NoActiveCall,

    #[error("A call is already active: {call_id}")]
    CallAlreadyActive { call_id: String },

    #[error(transparent)]
    Media(MediaError),

    #[error(transparent)]
    Session(SessionError),

    /// Credential endpoint errors
    #[error("Credential rejected: {reason}")]
    Unauthorized { reason: String },

    #[error("Access forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Configuration errors
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Generic errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

/// Stable code for each error kind, keyed into the policy table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidCredential,
    MissingDestination,
    TransportFailed,
    Network,
    Timeout,
    NoModeAvailable,
    RecipientNotFound,
    CarrierRequired,
    RateLimited,
    SignalingOrder,
    LockBusy,
    NotRetryable,
    BootCancelled,
    InvalidState,
    NotInitialized,
    NoActiveCall,
    CallAlreadyActive,
    MediaPermissionDenied,
    MediaNoDevice,
    MediaDeviceBusy,
    Media,
    Session,
    Unauthorized,
    Forbidden,
    ServerError,
    Configuration,
    Internal,
}

/// How the lifecycle treats an error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    /// A failed boot with this code may be retried
    pub retryable: bool,
    /// The error ends the operation it occurred in
    pub fatal: bool,
    /// Retrying consumes the lifecycle retry budget
    pub counts_against_budget: bool,
}

impl ErrorPolicy {
    const fn retry() -> Self {
        Self { retryable: true, fatal: false, counts_against_budget: true }
    }

    const fn fatal() -> Self {
        Self { retryable: false, fatal: true, counts_against_budget: false }
    }

    const fn surfaced() -> Self {
        Self { retryable: false, fatal: false, counts_against_budget: false }
    }
}

impl ErrorCode {
    /// Static error-code policy table
    pub const fn policy(self) -> ErrorPolicy {
        match self {
            ErrorCode::Network
            | ErrorCode::Timeout
            | ErrorCode::ServerError
            | ErrorCode::TransportFailed
            | ErrorCode::MediaDeviceBusy
            | ErrorCode::Session
            | ErrorCode::BootCancelled => ErrorPolicy::retry(),

            ErrorCode::RateLimited => ErrorPolicy {
                retryable: true,
                fatal: false,
                counts_against_budget: false,
            },

            ErrorCode::InvalidCredential
            | ErrorCode::MissingDestination
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden
            | ErrorCode::MediaPermissionDenied
            | ErrorCode::MediaNoDevice
            | ErrorCode::Media
            | ErrorCode::Configuration
            | ErrorCode::Internal => ErrorPolicy::fatal(),

            ErrorCode::NoModeAvailable
            | ErrorCode::RecipientNotFound
            | ErrorCode::CarrierRequired
            | ErrorCode::SignalingOrder
            | ErrorCode::LockBusy
            | ErrorCode::NotRetryable
            | ErrorCode::InvalidState
            | ErrorCode::NotInitialized
            | ErrorCode::NoActiveCall
            | ErrorCode::CallAlreadyActive => ErrorPolicy::surfaced(),
        }
    }
}

/// Human-readable description of an error for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub title: String,
    pub description: String,
    pub action: String,
    pub retryable: bool,
}

impl ClientError {
    /// Create a network error
    pub fn network_error(reason: impl Into<String>) -> Self {
        Self::NetworkError { reason: reason.into() }
    }

    /// Create an internal error
    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::InternalError { message: reason.into() }
    }

    /// Create a transport boot failure
    pub fn transport_failed(service: Service, reason: impl Into<String>) -> Self {
        Self::TransportFailed { service, reason: reason.into() }
    }

    /// Map a non-success HTTP status from a service endpoint
    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match status {
            401 => Self::Unauthorized { reason },
            403 => Self::Forbidden { reason },
            500..=599 => Self::ServerError { status },
            _ => Self::NetworkError { reason: format!("HTTP {status}: {reason}") },
        }
    }

    /// Map a request failure from the HTTP client
    pub fn from_request(operation: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::OperationTimeout { operation: operation.to_string(), duration_ms: 0 };
        }
        if let Some(status) = error.status() {
            return Self::from_status(status.as_u16(), error.to_string());
        }
        if error.is_decode() {
            return Self::InternalError { message: format!("{operation}: malformed response: {error}") };
        }
        Self::NetworkError { reason: format!("{operation}: {error}") }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::InvalidCredential => ErrorCode::InvalidCredential,
            ClientError::MissingDestination => ErrorCode::MissingDestination,
            ClientError::TransportFailed { .. } => ErrorCode::TransportFailed,
            ClientError::NetworkError { .. } => ErrorCode::Network,
            ClientError::OperationTimeout { .. } => ErrorCode::Timeout,
            ClientError::NoModeAvailable => ErrorCode::NoModeAvailable,
            ClientError::RecipientNotFound { .. } => ErrorCode::RecipientNotFound,
            ClientError::CarrierRequired { .. } => ErrorCode::CarrierRequired,
            ClientError::RateLimited { .. } => ErrorCode::RateLimited,
            ClientError::SignalingOrder { .. } => ErrorCode::SignalingOrder,
            ClientError::LockBusy { .. } => ErrorCode::LockBusy,
            ClientError::NotRetryable { .. } => ErrorCode::NotRetryable,
            ClientError::BootCancelled => ErrorCode::BootCancelled,
            ClientError::InvalidState { .. } => ErrorCode::InvalidState,
            ClientError::NotInitialized => ErrorCode::NotInitialized,
            ClientError::NoActiveCall => ErrorCode::NoActiveCall,
            ClientError::CallAlreadyActive { .. } => ErrorCode::CallAlreadyActive,
            ClientError::Media(MediaError::PermissionDenied) => ErrorCode::MediaPermissionDenied,
            ClientError::Media(MediaError::NoDevice) => ErrorCode::MediaNoDevice,
            ClientError::Media(MediaError::DeviceBusy) => ErrorCode::MediaDeviceBusy,
            ClientError::Media(MediaError::Other { .. }) => ErrorCode::Media,
            ClientError::Session(e) if e.is_timeout() => ErrorCode::Timeout,
            ClientError::Session(_) => ErrorCode::Session,
            ClientError::Unauthorized { .. } => ErrorCode::Unauthorized,
            ClientError::Forbidden { .. } => ErrorCode::Forbidden,
            ClientError::ServerError { .. } => ErrorCode::ServerError,
            ClientError::InvalidConfiguration { .. } => ErrorCode::Configuration,
            ClientError::InternalError { .. } => ErrorCode::Internal,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Session(e) => e.is_recoverable(),
            _ => self.code().policy().retryable,
        }
    }

    /// Check if error indicates a credential problem
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidCredential | ClientError::Unauthorized { .. } | ClientError::Forbidden { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::InvalidCredential | ClientError::MissingDestination => "input",

            ClientError::TransportFailed { .. } => "transport",

            ClientError::NetworkError { .. }
            | ClientError::OperationTimeout { .. }
            | ClientError::ServerError { .. } => "network",

            ClientError::NoModeAvailable
            | ClientError::RecipientNotFound { .. }
            | ClientError::CarrierRequired { .. } => "mode",

            ClientError::RateLimited { .. } => "rate-limit",

            ClientError::SignalingOrder { .. } | ClientError::Session(_) => "session",

            ClientError::LockBusy { .. }
            | ClientError::NotRetryable { .. }
            | ClientError::BootCancelled
            | ClientError::InvalidState { .. }
            | ClientError::NotInitialized => "lifecycle",

            ClientError::NoActiveCall | ClientError::CallAlreadyActive { .. } => "call",

            ClientError::Media(_) => "media",

            ClientError::Unauthorized { .. } | ClientError::Forbidden { .. } => "auth",

            ClientError::InvalidConfiguration { .. } => "configuration",

            ClientError::InternalError { .. } => "system",
        }
    }

    /// Title, description and suggested action for display
    pub fn user_info(&self) -> ErrorInfo {
        let code = self.code();
        let (title, description, action) = match code {
            ErrorCode::InvalidCredential | ErrorCode::Unauthorized => (
                "Sign-in required",
                "Your session is missing or has expired.",
                "Sign in again.",
            ),
            ErrorCode::Forbidden => (
                "Calling not allowed",
                "This account is not allowed to make calls.",
                "Contact support to enable calling.",
            ),
            ErrorCode::MissingDestination => (
                "No number entered",
                "Enter a phone number or contact to call.",
                "Enter a destination and try again.",
            ),
            ErrorCode::TransportFailed | ErrorCode::Session => (
                "Calling service unavailable",
                "The calling service could not be reached.",
                "Try again in a moment.",
            ),
            ErrorCode::Network => (
                "Connection problem",
                "We couldn't reach the calling service.",
                "Check your internet connection and try again.",
            ),
            ErrorCode::Timeout => (
                "Request timed out",
                "The calling service took too long to respond.",
                "Try again in a moment.",
            ),
            ErrorCode::ServerError => (
                "Service error",
                "The calling service had a problem.",
                "Try again in a few minutes.",
            ),
            ErrorCode::NoModeAvailable => (
                "Calling unavailable",
                "No calling method is available right now.",
                "Wait for calling to finish starting up, then try again.",
            ),
            ErrorCode::RecipientNotFound => (
                "User not found",
                "Nobody is registered with that number.",
                "Check the number and try again.",
            ),
            ErrorCode::CarrierRequired => (
                "Phone calling unavailable",
                "Calling phone numbers is not available right now.",
                "Call the contact in the app instead.",
            ),
            ErrorCode::RateLimited => (
                "Too many calls",
                "You are placing calls too quickly.",
                "Wait a few seconds before calling again.",
            ),
            ErrorCode::MediaPermissionDenied => (
                "Microphone blocked",
                "Microphone access was denied.",
                "Allow microphone access in your settings and try again.",
            ),
            ErrorCode::MediaNoDevice => (
                "No microphone",
                "No microphone was found.",
                "Connect a microphone and try again.",
            ),
            ErrorCode::MediaDeviceBusy => (
                "Microphone busy",
                "Another application is using the microphone.",
                "Close other applications using the microphone and try again.",
            ),
            ErrorCode::Media => (
                "Audio problem",
                "Audio could not be started.",
                "Check your audio devices and try again.",
            ),
            ErrorCode::NotRetryable => (
                "Calling unavailable",
                "Calling could not be started after several attempts.",
                "Restart the app or try again later.",
            ),
            ErrorCode::NotInitialized | ErrorCode::LockBusy | ErrorCode::BootCancelled | ErrorCode::InvalidState => (
                "Calling is starting",
                "Calling is not ready yet.",
                "Wait a moment and try again.",
            ),
            ErrorCode::NoActiveCall | ErrorCode::CallAlreadyActive | ErrorCode::SignalingOrder => (
                "Call problem",
                "That action isn't possible right now.",
                "Try again.",
            ),
            ErrorCode::Configuration | ErrorCode::Internal => (
                "Something went wrong",
                "An unexpected error occurred.",
                "Restart the app and try again.",
            ),
        };

        ErrorInfo {
            code,
            title: title.to_string(),
            description: description.to_string(),
            action: action.to_string(),
            retryable: self.is_recoverable(),
        }
    }
}

impl From<SessionError> for ClientError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Media(media) => ClientError::Media(media),
            SessionError::SignalingOrder { .. } => ClientError::SignalingOrder { reason: error.to_string() },
            other => ClientError::Session(other),
        }
    }
}

impl From<MediaError> for ClientError {
    fn from(error: MediaError) -> Self {
        ClientError::Media(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert!(matches!(ClientError::from_status(401, "expired"), ClientError::Unauthorized { .. }));
        assert!(matches!(ClientError::from_status(403, "nope"), ClientError::Forbidden { .. }));
        assert!(matches!(ClientError::from_status(502, "bad gateway"), ClientError::ServerError { status: 502 }));

        assert!(!ClientError::from_status(401, "").is_recoverable());
        assert!(!ClientError::from_status(403, "").is_recoverable());
        assert!(ClientError::from_status(503, "").is_recoverable());
    }

    #[test]
    fn test_rate_limit_is_outside_budget() {
        let policy = ErrorCode::RateLimited.policy();
        assert!(policy.retryable);
        assert!(!policy.counts_against_budget);
        assert!(ErrorCode::Network.policy().counts_against_budget);
    }

    #[test]
    fn test_session_errors_are_reclassified() {
        let media: ClientError = SessionError::Media(MediaError::NoDevice).into();
        assert_eq!(media.code(), ErrorCode::MediaNoDevice);
        assert!(!media.is_recoverable());

        let timeout: ClientError = SessionError::ConnectionTimeout { timeout_ms: 30000 }.into();
        assert_eq!(timeout.code(), ErrorCode::Timeout);
        assert!(timeout.is_recoverable());
    }

    #[test]
    fn test_user_info_carries_retryable_flag() {
        let info = ClientError::Media(MediaError::PermissionDenied).user_info();
        assert_eq!(info.title, "Microphone blocked");
        assert!(!info.retryable);

        let info = ClientError::network_error("connection reset").user_info();
        assert!(info.retryable);
        assert_eq!(info.code, ErrorCode::Network);
    }

    #[test]
    fn test_rate_limited_message() {
        let err = ClientError::RateLimited { retry_after: Duration::from_millis(4000) };
        assert_eq!(err.to_string(), "Too many calls, retry in 4000ms");
        assert_eq!(err.category(), "rate-limit");
    }
}
