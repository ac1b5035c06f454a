//! Type definitions shared across the negotiation engine
//!
//! These mirror the shapes a browser-style peer connection exposes
//! (session descriptions, ICE candidates, the four state machines) so that
//! the engine can drive any peer-media implementation through
//! [`crate::transport::PeerConnection`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ===== SESSION DESCRIPTIONS =====

/// Kind of session description in the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description (SDP blob plus its role in the exchange)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

// ===== ICE =====

/// An ICE candidate as exchanged over signaling
///
/// A candidate with neither `sdp_mid` nor `sdp_m_line_index` is the
/// end-of-candidates marker and is never queued or applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: Option<String>,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<&str>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            candidate: Some(candidate.into()),
            sdp_mid: sdp_mid.map(str::to_string),
            sdp_m_line_index,
            username_fragment: None,
        }
    }

    /// The end-of-candidates marker
    pub fn end_of_candidates() -> Self {
        Self {
            candidate: Some(String::new()),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.sdp_mid.is_none() && self.sdp_m_line_index.is_none()
    }

    pub fn has_candidate_line(&self) -> bool {
        self.candidate
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }

    /// Whether this candidate may be queued or handed to a peer connection
    pub fn is_usable(&self) -> bool {
        !self.is_end_of_candidates() && self.has_candidate_line()
    }
}

/// STUN/TURN server used by the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Configuration handed to the peer connection factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    /// Number of candidates to pre-gather before an offer is created
    pub ice_candidate_pool_size: u8,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            ice_candidate_pool_size: 10,
        }
    }
}

// ===== STATE MACHINES =====

/// Signaling state of a peer connection (offer/answer progress)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate connection state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

/// ICE candidate gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Per-session negotiation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    Gathering,
    Offered,
    Answered,
    IceChecking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

// ===== MEDIA =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Constraints passed to the capture collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A local or remote media track
///
/// Clones share the same `enabled` flag, so muting through any clone mutes
/// the track everywhere it is attached.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

/// A set of tracks captured or received together
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { id: Uuid::new_v4().to_string(), tracks }
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaKind::Audio)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A sender slot on the peer connection; `track` is `None` for an empty sender
#[derive(Debug, Clone, PartialEq)]
pub struct RtpSender {
    pub id: String,
    pub kind: MediaKind,
    pub track: Option<MediaTrack>,
}

// ===== STATISTICS =====

/// A single entry of a peer connection statistics report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RtcStats {
    InboundRtp {
        bytes_received: u64,
        packets_received: u64,
        packets_lost: i64,
        /// Jitter in seconds, as reported by the transport
        jitter: f64,
    },
    OutboundRtp {
        bytes_sent: u64,
        packets_sent: u64,
    },
    CandidatePair {
        nominated: bool,
        /// Round-trip time in seconds
        current_round_trip_time: Option<f64>,
    },
}

/// Aggregated statistics computed by the connection monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: i64,
    pub jitter_ms: f64,
    pub round_trip_time_ms: Option<f64>,
    pub measured_at: DateTime<Utc>,
}

/// Coarse connection quality derived from round-trip time and ICE state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Disconnected,
    Failed,
}

// ===== CALL SESSION =====

/// The single active call session of a negotiation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: String,
    pub call_id: String,
    pub local_identity: String,
    pub remote_identity: String,
    pub is_initiator: bool,
    pub started_at: DateTime<Utc>,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Nobody accepted before the auto-hangup timer fired
    Missed,
    Rejected,
    Busy,
    LocalHangup,
    RemoteHangup,
    /// The call never reached a connected state in time
    Timeout,
    Failed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Missed => "missed",
            EndReason::Rejected => "rejected",
            EndReason::Busy => "busy",
            EndReason::LocalHangup => "hangup",
            EndReason::RemoteHangup => "remote-hangup",
            EndReason::Timeout => "timeout",
            EndReason::Failed => "failed",
        }
    }

    /// Interpret the reason carried by a remote hangup signal
    pub fn from_remote(reason: &str) -> Self {
        match reason {
            "missed" => EndReason::Missed,
            "rejected" => EndReason::Rejected,
            "busy" => EndReason::Busy,
            "timeout" => EndReason::Timeout,
            "failed" => EndReason::Failed,
            _ => EndReason::RemoteHangup,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
