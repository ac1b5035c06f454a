//! Collaborator traits for the peer-media transport
//!
//! The negotiation engine never talks to a concrete media stack. It drives
//! whatever implements [`PeerConnection`] (created through a
//! [`PeerConnectionFactory`]) and acquires local audio through
//! [`MediaDevices`]. An in-process implementation lives in
//! [`crate::loopback`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{MediaError, SessionResult};
use crate::types::{
    IceCandidate, IceConnectionState, IceGatheringState, MediaConstraints, MediaStream, MediaTrack,
    PeerConnectionState, RtcConfiguration, RtcStats, RtpSender, SessionDescription, SignalingState,
};

/// Events surfaced by a peer connection
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    /// A local candidate was generated. `None` signals gathering finished.
    IceCandidate(Option<IceCandidate>),
    IceGatheringStateChanged(IceGatheringState),
    IceConnectionStateChanged(IceConnectionState),
    ConnectionStateChanged(PeerConnectionState),
    SignalingStateChanged(SignalingState),
    /// A remote track arrived, together with the stream it belongs to
    Track(MediaStream),
}

/// A single peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> SessionResult<SessionDescription>;

    async fn create_answer(&self) -> SessionResult<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> SessionResult<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> SessionResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SessionResult<()>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerConnectionState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn ice_gathering_state(&self) -> IceGatheringState;

    fn local_description(&self) -> Option<SessionDescription>;

    fn remote_description(&self) -> Option<SessionDescription>;

    fn senders(&self) -> Vec<RtpSender>;

    /// Add a track on a new sender and return it
    async fn add_track(&self, track: MediaTrack) -> SessionResult<RtpSender>;

    /// Replace the track carried by an existing sender
    async fn replace_track(&self, sender_id: &str, track: Option<MediaTrack>) -> SessionResult<()>;

    /// Trigger an ICE restart on the existing connection
    async fn restart_ice(&self) -> SessionResult<()>;

    async fn get_stats(&self) -> SessionResult<Vec<RtcStats>>;

    /// Subscribe to connection events
    fn subscribe(&self) -> broadcast::Receiver<PeerConnectionEvent>;

    async fn close(&self) -> SessionResult<()>;
}

/// Creates peer connections for the engine
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: &RtcConfiguration) -> SessionResult<Arc<dyn PeerConnection>>;

    /// Whether this runtime can create peer connections at all
    fn is_supported(&self) -> bool {
        true
    }
}

/// Local media capture
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;
}
