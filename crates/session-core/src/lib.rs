//! # callbridge-session-core
//!
//! Peer-mode call negotiation: the offer/answer and ICE exchange that
//! establishes a direct media session between two identities over a
//! pub/sub signaling side-channel.
//!
//! The crate drives injected collaborators rather than a concrete media
//! stack:
//!
//! - [`transport::PeerConnectionFactory`] / [`transport::PeerConnection`] for peer media
//! - [`transport::MediaDevices`] for local audio capture
//! - [`signaling::SignalingStore`] for the signaling key-value store
//!
//! [`NegotiationEngine`] composes the sub-roles ([`peer::PeerConnectionManager`],
//! [`ice::IceManager`], [`negotiation::SessionManager`],
//! [`signaling::SignalingTransport`], [`monitor::ConnectionMonitor`]) into the
//! inbound and outbound call flows. [`loopback`] provides in-process
//! implementations of the collaborators.

pub mod config;
pub mod engine;
pub mod error;
pub mod ice;
pub mod loopback;
pub mod monitor;
pub mod negotiation;
pub mod peer;
pub mod signaling;
pub mod transport;
pub mod types;

pub use config::{EngineConfig, MonitorConfig};
pub use engine::{NegotiationEngine, SessionEvent};
pub use error::{MediaError, SessionError, SessionResult};
pub use ice::{IceManager, RemoteCandidateOutcome, TroubleshootingReport};
pub use monitor::{ConnectionMonitor, MonitorEvent};
pub use negotiation::{ApplyOutcome, SessionManager};
pub use peer::PeerConnectionManager;
pub use signaling::{
    MemorySignalingStore, SignalEnvelope, SignalHandler, SignalRecord, SignalType, SignalingStore,
    SignalingTransport,
};
pub use transport::{MediaDevices, PeerConnection, PeerConnectionEvent, PeerConnectionFactory};
pub use types::{
    CallSession, ConnectionQuality, ConnectionStats, EndReason, IceCandidate, IceConnectionState,
    IceGatheringState, MediaConstraints, MediaKind, MediaStream, MediaTrack, NegotiationState,
    PeerConnectionState, RtcConfiguration, SessionDescription, SignalingState,
};

/// Session-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
