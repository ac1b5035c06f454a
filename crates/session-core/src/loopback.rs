//! In-process peer-media transport
//!
//! [`LoopbackPeerConnection`] follows the signaling state machine of a real
//! peer connection (illegal description orders are rejected), gathers a
//! configurable number of host candidates, and "connects" a short while after
//! both descriptions are in place. No media flows. It is what the engine runs
//! against in tests and local demos.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{MediaError, SessionError, SessionResult};
use crate::transport::{MediaDevices, PeerConnection, PeerConnectionEvent, PeerConnectionFactory};
use crate::types::{
    IceCandidate, IceConnectionState, IceGatheringState, MediaConstraints, MediaKind, MediaStream, MediaTrack,
    PeerConnectionState, RtcConfiguration, RtcStats, RtpSender, SdpType, SessionDescription, SignalingState,
};

const CANDIDATE_INTERVAL: Duration = Duration::from_millis(10);

/// How a loopback connection behaves
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackBehavior {
    pub candidates: usize,
    /// Emit candidates but never report gathering complete
    pub gathering_stalls: bool,
    pub connects: bool,
    pub reconnects: bool,
    pub connect_delay: Duration,
    pub round_trip_time_ms: Option<f64>,
}

impl Default for LoopbackBehavior {
    fn default() -> Self {
        Self {
            candidates: 2,
            gathering_stalls: false,
            connects: true,
            reconnects: true,
            connect_delay: Duration::from_millis(50),
            round_trip_time_ms: Some(40.0),
        }
    }
}

impl LoopbackBehavior {
    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidates = count;
        self
    }

    pub fn with_gathering_stalled(mut self) -> Self {
        self.gathering_stalls = true;
        self
    }

    pub fn with_connect(mut self, connects: bool) -> Self {
        self.connects = connects;
        self
    }

    pub fn with_reconnect(mut self, reconnects: bool) -> Self {
        self.reconnects = reconnects;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_round_trip_time_ms(mut self, rtt_ms: f64) -> Self {
        self.round_trip_time_ms = Some(rtt_ms);
        self
    }
}

struct State {
    signaling: SignalingState,
    connection: PeerConnectionState,
    ice_connection: IceConnectionState,
    gathering: IceGatheringState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<RtpSender>,
    applied: Vec<IceCandidate>,
    remote_description_calls: usize,
    ice_restarts: u32,
    offers_created: u32,
    rtt_ms: Option<f64>,
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<PeerConnectionEvent>,
}

impl Shared {
    fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_ice(&self, state: IceConnectionState) {
        self.state.lock().ice_connection = state;
        self.emit(PeerConnectionEvent::IceConnectionStateChanged(state));
    }

    fn set_connection(&self, state: PeerConnectionState) {
        self.state.lock().connection = state;
        self.emit(PeerConnectionEvent::ConnectionStateChanged(state));
    }

    fn set_signaling(&self, state: SignalingState) {
        self.state.lock().signaling = state;
        self.emit(PeerConnectionEvent::SignalingStateChanged(state));
    }

    fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }
}

pub struct LoopbackPeerConnection {
    id: String,
    behavior: LoopbackBehavior,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopbackPeerConnection {
    pub fn new(behavior: LoopbackBehavior) -> Self {
        let (events, _) = broadcast::channel(128);
        let state = State {
            signaling: SignalingState::Stable,
            connection: PeerConnectionState::New,
            ice_connection: IceConnectionState::New,
            gathering: IceGatheringState::New,
            local: None,
            remote: None,
            senders: Vec::new(),
            applied: Vec::new(),
            remote_description_calls: 0,
            ice_restarts: 0,
            offers_created: 0,
            rtt_ms: behavior.round_trip_time_ms,
        };
        Self {
            id: Uuid::new_v4().simple().to_string(),
            behavior,
            shared: Arc::new(Shared { state: Mutex::new(state), events }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.shared.state.lock().applied.clone()
    }

    /// Number of successful `set_remote_description` calls
    pub fn remote_description_calls(&self) -> usize {
        self.shared.state.lock().remote_description_calls
    }

    pub fn ice_restarts(&self) -> u32 {
        self.shared.state.lock().ice_restarts
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn set_ice_connection_state(&self, state: IceConnectionState) {
        self.shared.set_ice(state);
    }

    pub fn set_connection_state(&self, state: PeerConnectionState) {
        self.shared.set_connection(state);
    }

    pub fn set_round_trip_time(&self, rtt_ms: Option<f64>) {
        self.shared.state.lock().rtt_ms = rtt_ms;
    }

    /// Drop connectivity as a network change would
    pub fn simulate_disconnect(&self) {
        self.shared.set_ice(IceConnectionState::Disconnected);
        self.shared.set_connection(PeerConnectionState::Disconnected);
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(task));
    }

    fn start_gathering(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.gathering != IceGatheringState::New {
                return;
            }
            state.gathering = IceGatheringState::Gathering;
        }
        self.shared
            .emit(PeerConnectionEvent::IceGatheringStateChanged(IceGatheringState::Gathering));

        let shared = self.shared.clone();
        let count = self.behavior.candidates;
        let stalls = self.behavior.gathering_stalls;
        self.spawn(async move {
            for i in 0..count {
                tokio::time::sleep(CANDIDATE_INTERVAL).await;
                let line = format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                    i + 1,
                    2_130_706_431u32 - i as u32,
                    50_000 + i
                );
                shared.emit(PeerConnectionEvent::IceCandidate(Some(IceCandidate::new(line, Some("0"), Some(0)))));
            }
            if stalls {
                return;
            }
            shared.state.lock().gathering = IceGatheringState::Complete;
            shared.emit(PeerConnectionEvent::IceGatheringStateChanged(IceGatheringState::Complete));
            shared.emit(PeerConnectionEvent::IceCandidate(None));
        });
    }

    fn maybe_start_connecting(&self) {
        {
            let state = self.shared.state.lock();
            let negotiated =
                state.signaling == SignalingState::Stable && state.local.is_some() && state.remote.is_some();
            if !negotiated || state.ice_connection != IceConnectionState::New {
                return;
            }
        }

        let shared = self.shared.clone();
        let connects = self.behavior.connects;
        let delay = self.behavior.connect_delay;
        shared.set_ice(IceConnectionState::Checking);
        shared.set_connection(PeerConnectionState::Connecting);
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.is_closed() {
                return;
            }
            if connects {
                shared.set_ice(IceConnectionState::Connected);
                shared.set_connection(PeerConnectionState::Connected);
            } else {
                shared.set_ice(IceConnectionState::Failed);
                shared.set_connection(PeerConnectionState::Failed);
            }
        });
    }

    fn sdp(&self, kind: &str, version: u32) -> String {
        format!(
            "v=0\r\no=loopback-{kind} {} {version} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\na=sendrecv\r\n\
             a=rtpmap:111 opus/48000/2\r\n",
            self.id
        )
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_offer(&self) -> SessionResult<SessionDescription> {
        if self.shared.is_closed() {
            return Err(SessionError::Closed);
        }
        let version = {
            let mut state = self.shared.state.lock();
            state.offers_created += 1;
            state.offers_created
        };
        Ok(SessionDescription::offer(self.sdp("offer", version)))
    }

    async fn create_answer(&self) -> SessionResult<SessionDescription> {
        let state = self.shared.state.lock().signaling;
        if state != SignalingState::HaveRemoteOffer {
            return Err(SessionError::SignalingOrder { operation: "create answer", state });
        }
        Ok(SessionDescription::answer(self.sdp("answer", 1)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> SessionResult<()> {
        let current = self.shared.state.lock().signaling;
        let next = match (description.sdp_type, current) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            _ => {
                return Err(SessionError::SignalingOrder { operation: "set local description", state: current });
            }
        };
        self.shared.state.lock().local = Some(description);
        self.shared.set_signaling(next);
        self.start_gathering();
        self.maybe_start_connecting();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> SessionResult<()> {
        let current = self.shared.state.lock().signaling;
        let next = match (description.sdp_type, current) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            _ => {
                return Err(SessionError::SignalingOrder { operation: "set remote description", state: current });
            }
        };
        {
            let mut state = self.shared.state.lock();
            state.remote = Some(description);
            state.remote_description_calls += 1;
        }
        self.shared.set_signaling(next);
        self.shared.emit(PeerConnectionEvent::Track(MediaStream::new(vec![MediaTrack::new(
            MediaKind::Audio,
        )])));
        self.maybe_start_connecting();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SessionResult<()> {
        if !candidate.is_usable() {
            return Err(SessionError::InvalidCandidate { reason: "missing candidate line".to_string() });
        }
        let mut state = self.shared.state.lock();
        if state.remote.is_none() {
            return Err(SessionError::InvalidCandidate { reason: "remote description not set".to_string() });
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.shared.state.lock().signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.shared.state.lock().connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.shared.state.lock().ice_connection
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.shared.state.lock().gathering
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.shared.state.lock().local.clone()
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        self.shared.state.lock().remote.clone()
    }

    fn senders(&self) -> Vec<RtpSender> {
        self.shared.state.lock().senders.clone()
    }

    async fn add_track(&self, track: MediaTrack) -> SessionResult<RtpSender> {
        let sender = RtpSender {
            id: Uuid::new_v4().to_string(),
            kind: track.kind,
            track: Some(track),
        };
        self.shared.state.lock().senders.push(sender.clone());
        Ok(sender)
    }

    async fn replace_track(&self, sender_id: &str, track: Option<MediaTrack>) -> SessionResult<()> {
        let mut state = self.shared.state.lock();
        let sender = state
            .senders
            .iter_mut()
            .find(|s| s.id == sender_id)
            .ok_or_else(|| SessionError::transport(format!("unknown sender {sender_id}")))?;
        sender.track = track;
        Ok(())
    }

    async fn restart_ice(&self) -> SessionResult<()> {
        if self.shared.is_closed() {
            return Err(SessionError::Closed);
        }
        self.shared.state.lock().ice_restarts += 1;

        let shared = self.shared.clone();
        let reconnects = self.behavior.reconnects;
        let delay = self.behavior.connect_delay;
        self.spawn(async move {
            shared.set_ice(IceConnectionState::Checking);
            tokio::time::sleep(delay).await;
            if reconnects {
                shared.set_ice(IceConnectionState::Connected);
                shared.set_connection(PeerConnectionState::Connected);
            } else {
                shared.set_ice(IceConnectionState::Failed);
            }
        });
        Ok(())
    }

    async fn get_stats(&self) -> SessionResult<Vec<RtcStats>> {
        if self.shared.is_closed() {
            return Err(SessionError::Closed);
        }
        let rtt_ms = self.shared.state.lock().rtt_ms;
        Ok(vec![
            RtcStats::InboundRtp { bytes_received: 16_000, packets_received: 100, packets_lost: 0, jitter: 0.002 },
            RtcStats::OutboundRtp { bytes_sent: 16_000, packets_sent: 100 },
            RtcStats::CandidatePair { nominated: true, current_round_trip_time: rtt_ms.map(|ms| ms / 1000.0) },
        ])
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerConnectionEvent> {
        self.shared.events.subscribe()
    }

    async fn close(&self) -> SessionResult<()> {
        if self.shared.is_closed() {
            return Ok(());
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.set_signaling(SignalingState::Closed);
        self.shared.set_ice(IceConnectionState::Closed);
        self.shared.set_connection(PeerConnectionState::Closed);
        Ok(())
    }
}

impl Drop for LoopbackPeerConnection {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Factory handing out [`LoopbackPeerConnection`]s and remembering them
pub struct LoopbackPeerConnectionFactory {
    behavior: Mutex<LoopbackBehavior>,
    supported: bool,
    created: Mutex<Vec<Arc<LoopbackPeerConnection>>>,
}

impl Default for LoopbackPeerConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackPeerConnectionFactory {
    pub fn new() -> Self {
        Self::with_behavior(LoopbackBehavior::default())
    }

    pub fn with_behavior(behavior: LoopbackBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            supported: true,
            created: Mutex::new(Vec::new()),
        }
    }

    /// A factory for a runtime without peer transport support
    pub fn unsupported() -> Self {
        Self { supported: false, ..Self::new() }
    }

    pub fn set_behavior(&self, behavior: LoopbackBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn last_created(&self) -> Option<Arc<LoopbackPeerConnection>> {
        self.created.lock().last().cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerConnectionFactory {
    async fn create(&self, _config: &RtcConfiguration) -> SessionResult<Arc<dyn PeerConnection>> {
        if !self.supported {
            return Err(SessionError::Unsupported);
        }
        let pc = Arc::new(LoopbackPeerConnection::new(self.behavior.lock().clone()));
        self.created.lock().push(pc.clone());
        Ok(pc)
    }

    fn is_supported(&self) -> bool {
        self.supported
    }
}

/// Media devices producing a single silent audio track, or a fixed failure
#[derive(Default)]
pub struct StaticMediaDevices {
    failure: Mutex<Option<MediaError>>,
    requests: AtomicUsize,
}

impl StaticMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: MediaError) -> Self {
        Self { failure: Mutex::new(Some(error)), requests: AtomicUsize::new(0) }
    }

    pub fn set_failure(&self, error: Option<MediaError>) {
        *self.failure.lock() = error;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for StaticMediaDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if !constraints.audio {
            return Err(MediaError::Other { reason: "audio capture was not requested".to_string() });
        }
        Ok(MediaStream::new(vec![MediaTrack::new(MediaKind::Audio)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_offer_answer_connects_both_sides() {
        let caller = LoopbackPeerConnection::new(LoopbackBehavior::default());
        let callee = LoopbackPeerConnection::new(LoopbackBehavior::default());

        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(caller.ice_connection_state(), IceConnectionState::Connected);
        assert_eq!(callee.connection_state(), PeerConnectionState::Connected);
        assert_eq!(caller.ice_gathering_state(), IceGatheringState::Complete);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_rejected() {
        let pc = LoopbackPeerConnection::new(LoopbackBehavior::default());
        assert!(matches!(
            pc.create_answer().await,
            Err(SessionError::SignalingOrder { state: SignalingState::Stable, .. })
        ));
    }

    #[tokio::test]
    async fn test_media_failure_is_typed() {
        let devices = StaticMediaDevices::failing(MediaError::DeviceBusy);
        let err = devices.get_user_media(&MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err, MediaError::DeviceBusy);
        assert_eq!(devices.requests(), 1);
    }
}
