//! Carrier transport collaborator
//!
//! The carrier SDK is driven through [`CarrierTransport`] (registration,
//! outbound connect, transport-level events) and [`CarrierCall`] (per-call
//! control). [`scripted`] provides an in-process implementation.

pub mod scripted;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::{ClientError, Service};

/// Error codes reported by the carrier SDK
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CarrierErrorCode {
    /// The access token was rejected; peer mode should take over
    TokenInvalid,
    TokenExpired,
    Network,
    Other(String),
}

impl CarrierErrorCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "token-invalid" => CarrierErrorCode::TokenInvalid,
            "token-expired" => CarrierErrorCode::TokenExpired,
            "network" => CarrierErrorCode::Network,
            other => CarrierErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CarrierErrorCode::TokenInvalid => "token-invalid",
            CarrierErrorCode::TokenExpired => "token-expired",
            CarrierErrorCode::Network => "network",
            CarrierErrorCode::Other(code) => code,
        }
    }

    /// The credential must be refetched before the carrier is usable again
    pub fn is_token_error(&self) -> bool {
        matches!(self, CarrierErrorCode::TokenInvalid | CarrierErrorCode::TokenExpired)
    }
}

impl fmt::Display for CarrierErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("carrier error {code}: {message}")]
pub struct CarrierError {
    pub code: CarrierErrorCode,
    pub message: String,
}

impl CarrierError {
    pub fn new(code: CarrierErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<CarrierError> for ClientError {
    fn from(error: CarrierError) -> Self {
        match error.code {
            CarrierErrorCode::Network => ClientError::network_error(error.to_string()),
            _ => ClientError::transport_failed(Service::Carrier, error.to_string()),
        }
    }
}

/// Transport-level carrier events
#[derive(Clone)]
pub enum CarrierEvent {
    Incoming(Arc<dyn CarrierCall>),
    Registered,
    Unregistered,
    Error(CarrierError),
}

impl fmt::Debug for CarrierEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarrierEvent::Incoming(call) => f.debug_tuple("Incoming").field(&call.id()).finish(),
            CarrierEvent::Registered => f.write_str("Registered"),
            CarrierEvent::Unregistered => f.write_str("Unregistered"),
            CarrierEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Per-call carrier events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierCallEvent {
    Ringing,
    Accepted,
    Disconnected,
    /// The caller hung up before the call was answered
    Cancelled,
    Rejected,
    Error(CarrierError),
}

#[async_trait]
pub trait CarrierCall: Send + Sync {
    fn id(&self) -> String;

    /// Remote party: caller for inbound calls, target for outbound ones
    fn remote(&self) -> String;

    fn is_inbound(&self) -> bool;

    async fn accept(&self) -> Result<(), CarrierError>;

    async fn reject(&self) -> Result<(), CarrierError>;

    async fn disconnect(&self) -> Result<(), CarrierError>;

    async fn mute(&self, muted: bool) -> Result<(), CarrierError>;

    fn is_muted(&self) -> bool;

    async fn send_digits(&self, digits: &str) -> Result<(), CarrierError>;

    async fn hold(&self, on_hold: bool) -> Result<(), CarrierError>;

    async fn transfer(&self, target: &str) -> Result<(), CarrierError>;

    fn subscribe(&self) -> broadcast::Receiver<CarrierCallEvent>;
}

#[async_trait]
pub trait CarrierTransport: Send + Sync {
    async fn register(&self, token: &str) -> Result<(), CarrierError>;

    async fn unregister(&self) -> Result<(), CarrierError>;

    fn is_registered(&self) -> bool;

    async fn connect(&self, target: &str) -> Result<Arc<dyn CarrierCall>, CarrierError>;

    fn subscribe(&self) -> broadcast::Receiver<CarrierEvent>;
}
