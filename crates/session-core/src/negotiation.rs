//! Signaling-state preconditions for remote session descriptions
//!
//! Remote SDP is only handed to the peer connection when its signaling state
//! can accept it: an offer while `stable`, an answer while `have-local-offer`.
//! Redelivered descriptions are recognised by a prefix of their SDP and
//! reported as [`ApplyOutcome::Duplicate`] without touching the connection.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::transport::PeerConnection;
use crate::types::{SdpType, SessionDescription, SignalingState};

/// Number of leading SDP characters remembered per applied description
const SDP_PREFIX_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
}

#[derive(Default)]
struct Applied {
    offer: Option<String>,
    answer: Option<String>,
}

#[derive(Default)]
pub struct SessionManager {
    applied: Mutex<Applied>,
}

fn sdp_prefix(sdp: &str) -> String {
    sdp.chars().take(SDP_PREFIX_LEN).collect()
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_remote_offer(
        &self,
        pc: &Arc<dyn PeerConnection>,
        offer: SessionDescription,
    ) -> SessionResult<ApplyOutcome> {
        let prefix = sdp_prefix(&offer.sdp);
        if self.applied.lock().offer.as_deref() == Some(prefix.as_str()) {
            debug!("Remote offer already applied, ignoring redelivery");
            return Ok(ApplyOutcome::Duplicate);
        }

        let state = pc.signaling_state();
        if state != SignalingState::Stable {
            return Err(SessionError::SignalingOrder { operation: "apply offer", state });
        }

        pc.set_remote_description(offer).await?;
        self.applied.lock().offer = Some(prefix);
        Ok(ApplyOutcome::Applied)
    }

    pub async fn apply_remote_answer(
        &self,
        pc: &Arc<dyn PeerConnection>,
        answer: SessionDescription,
    ) -> SessionResult<ApplyOutcome> {
        let prefix = sdp_prefix(&answer.sdp);
        if self.applied.lock().answer.as_deref() == Some(prefix.as_str()) {
            debug!("Remote answer already applied, ignoring redelivery");
            return Ok(ApplyOutcome::Duplicate);
        }

        let state = pc.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            // The connection may have applied this answer before we recorded it
            let already_applied = state == SignalingState::Stable
                && pc
                    .remote_description()
                    .map(|remote| remote.sdp_type == SdpType::Answer && sdp_prefix(&remote.sdp) == prefix)
                    .unwrap_or(false);
            if already_applied {
                self.applied.lock().answer = Some(prefix);
                return Ok(ApplyOutcome::Duplicate);
            }
            return Err(SessionError::SignalingOrder { operation: "apply answer", state });
        }

        pc.set_remote_description(answer).await?;
        self.applied.lock().answer = Some(prefix);
        Ok(ApplyOutcome::Applied)
    }

    pub fn reset(&self) {
        *self.applied.lock() = Applied::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBehavior, LoopbackPeerConnection};

    fn loopback_pc() -> (Arc<LoopbackPeerConnection>, Arc<dyn PeerConnection>) {
        let raw = Arc::new(LoopbackPeerConnection::new(LoopbackBehavior::default()));
        let pc: Arc<dyn PeerConnection> = raw.clone();
        (raw, pc)
    }

    #[tokio::test]
    async fn test_answer_applied_once() {
        let sessions = SessionManager::new();
        let (raw, pc) = loopback_pc();
        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer).await.unwrap();

        let answer = SessionDescription::answer("v=0\r\no=remote 42 1 IN IP4 0.0.0.0\r\ns=-\r\n");
        assert_eq!(
            sessions.apply_remote_answer(&pc, answer.clone()).await.unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(pc.signaling_state(), SignalingState::Stable);

        assert_eq!(
            sessions.apply_remote_answer(&pc, answer).await.unwrap(),
            ApplyOutcome::Duplicate
        );
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(raw.remote_description_calls(), 1);
    }

    #[tokio::test]
    async fn test_answer_in_stable_is_rejected() {
        let sessions = SessionManager::new();
        let (_, pc) = loopback_pc();

        let err = sessions
            .apply_remote_answer(&pc, SessionDescription::answer("v=0\r\no=stray 1 1 IN IP4 0.0.0.0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::SignalingOrder { state: SignalingState::Stable, .. }
        ));
    }

    #[tokio::test]
    async fn test_offer_redelivery_is_duplicate() {
        let sessions = SessionManager::new();
        let (raw, pc) = loopback_pc();
        let offer = SessionDescription::offer("v=0\r\no=caller 7 1 IN IP4 0.0.0.0\r\n");

        assert_eq!(sessions.apply_remote_offer(&pc, offer.clone()).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(pc.signaling_state(), SignalingState::HaveRemoteOffer);
        assert_eq!(sessions.apply_remote_offer(&pc, offer).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(raw.remote_description_calls(), 1);

        let other = SessionDescription::offer("v=0\r\no=caller 8 1 IN IP4 0.0.0.0\r\n");
        assert!(matches!(
            sessions.apply_remote_offer(&pc, other).await,
            Err(SessionError::SignalingOrder { state: SignalingState::HaveRemoteOffer, .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_forgets_applied() {
        let sessions = SessionManager::new();
        let (_, pc) = loopback_pc();
        let offer = SessionDescription::offer("v=0\r\no=caller 9 1 IN IP4 0.0.0.0\r\n");
        sessions.apply_remote_offer(&pc, offer.clone()).await.unwrap();

        sessions.reset();
        let (_, fresh) = loopback_pc();
        assert_eq!(sessions.apply_remote_offer(&fresh, offer).await.unwrap(), ApplyOutcome::Applied);
    }
}
