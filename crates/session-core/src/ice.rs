//! ICE candidate bookkeeping and connectivity waits
//!
//! Local candidates are buffered as the peer connection produces them so they
//! can be forwarded once the offer or answer has gone out. Remote candidates
//! that arrive before the peer connection (or its remote description) exists
//! are queued and flushed later. The end-of-candidates marker and candidates
//! without a candidate line are dropped on both sides.
//!
//! The two waits observe the connection through its event stream and, as a
//! fallback, by polling its state on a short ticker.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::transport::{PeerConnection, PeerConnectionEvent};
use crate::types::{IceCandidate, IceConnectionState, IceGatheringState, PeerConnectionState};

/// How often connection state is re-read while waiting
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to a remote candidate handed to [`IceManager::add_remote_candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCandidateOutcome {
    Applied,
    Queued,
    Discarded,
}

/// Snapshot used to diagnose a stalled negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroubleshootingReport {
    pub gathering_state: Option<IceGatheringState>,
    pub ice_connection_state: Option<IceConnectionState>,
    pub connection_state: Option<PeerConnectionState>,
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub pending_remote_candidates: usize,
    pub last_round_trip_time_ms: Option<f64>,
}

#[derive(Default)]
struct Candidates {
    local: Vec<IceCandidate>,
    /// Number of local candidates already forwarded to the remote side
    local_sent: usize,
    remote: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
    last_rtt_ms: Option<f64>,
}

#[derive(Default)]
pub struct IceManager {
    inner: Mutex<Candidates>,
}

impl IceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a local candidate; returns false for markers and duplicates
    pub fn add_local_candidate(&self, candidate: IceCandidate) -> bool {
        if !candidate.is_usable() {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.local.contains(&candidate) {
            return false;
        }
        inner.local.push(candidate);
        true
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().local.clone()
    }

    /// Local candidates not yet forwarded, marking them as forwarded
    pub fn take_unsent_local(&self) -> Vec<IceCandidate> {
        let mut inner = self.inner.lock();
        let unsent = inner.local[inner.local_sent..].to_vec();
        inner.local_sent = inner.local.len();
        unsent
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().remote.clone()
    }

    pub fn pending_remote_count(&self) -> usize {
        self.inner.lock().pending_remote.len()
    }

    /// Apply a remote candidate now if possible, otherwise queue it
    pub async fn add_remote_candidate(
        &self,
        pc: Option<&Arc<dyn PeerConnection>>,
        candidate: IceCandidate,
    ) -> SessionResult<RemoteCandidateOutcome> {
        if !candidate.is_usable() {
            debug!("Discarding end-of-candidates marker or empty candidate");
            return Ok(RemoteCandidateOutcome::Discarded);
        }

        {
            let mut inner = self.inner.lock();
            if inner.remote.contains(&candidate) || inner.pending_remote.contains(&candidate) {
                return Ok(RemoteCandidateOutcome::Discarded);
            }

            let ready = pc.map(|pc| pc.remote_description().is_some()).unwrap_or(false);
            if !ready {
                inner.pending_remote.push(candidate);
                return Ok(RemoteCandidateOutcome::Queued);
            }
        }

        if let Some(pc) = pc {
            pc.add_ice_candidate(candidate.clone()).await?;
        }
        self.inner.lock().remote.push(candidate);
        Ok(RemoteCandidateOutcome::Applied)
    }

    /// Apply every queued remote candidate; returns how many were applied
    pub async fn flush_remote_candidates(&self, pc: &Arc<dyn PeerConnection>) -> SessionResult<usize> {
        if pc.remote_description().is_none() {
            return Ok(0);
        }

        let pending = std::mem::take(&mut self.inner.lock().pending_remote);
        let mut applied = 0;
        for candidate in pending {
            match pc.add_ice_candidate(candidate.clone()).await {
                Ok(()) => {
                    self.inner.lock().remote.push(candidate);
                    applied += 1;
                }
                Err(e) => warn!(error = %e, "Failed to apply queued remote candidate"),
            }
        }
        if applied > 0 {
            debug!(applied, "Flushed queued remote candidates");
        }
        Ok(applied)
    }

    /// Wait until local gathering completes or `timeout` elapses
    ///
    /// Never fails on timeout: whatever was collected is returned.
    pub async fn wait_for_gathering_complete(
        &self,
        pc: &Arc<dyn PeerConnection>,
        timeout: Duration,
    ) -> Vec<IceCandidate> {
        let mut rx = pc.subscribe();
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(STATE_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if pc.ice_gathering_state() == IceGatheringState::Complete {
                break;
            }

            tokio::select! {
                event = rx.recv() => match event {
                    Ok(PeerConnectionEvent::IceCandidate(Some(candidate))) => {
                        self.add_local_candidate(candidate);
                    }
                    Ok(PeerConnectionEvent::IceCandidate(None))
                    | Ok(PeerConnectionEvent::IceGatheringStateChanged(IceGatheringState::Complete)) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        collected = self.inner.lock().local.len(),
                        "ICE gathering timed out, continuing with collected candidates"
                    );
                    break;
                }
            }
        }

        self.local_candidates()
    }

    /// Wait until ICE reports connected or completed
    pub async fn wait_for_connection(&self, pc: &Arc<dyn PeerConnection>, timeout: Duration) -> SessionResult<()> {
        wait_for_ice_connection(pc, timeout, false).await
    }

    pub fn record_round_trip_time(&self, rtt_ms: Option<f64>) {
        if rtt_ms.is_some() {
            self.inner.lock().last_rtt_ms = rtt_ms;
        }
    }

    pub fn troubleshooting_report(&self, pc: Option<&Arc<dyn PeerConnection>>) -> TroubleshootingReport {
        let inner = self.inner.lock();
        TroubleshootingReport {
            gathering_state: pc.map(|pc| pc.ice_gathering_state()),
            ice_connection_state: pc.map(|pc| pc.ice_connection_state()),
            connection_state: pc.map(|pc| pc.connection_state()),
            local_candidates: inner.local.len(),
            remote_candidates: inner.remote.len(),
            pending_remote_candidates: inner.pending_remote.len(),
            last_round_trip_time_ms: inner.last_rtt_ms,
        }
    }

    /// Drop all buffered candidates at session end
    pub fn clear(&self) {
        *self.inner.lock() = Candidates::default();
    }
}

/// Wait for the ICE connection to come up
///
/// `failed` always ends the wait with an error. `disconnected` does too,
/// unless `tolerate_disconnected` is set, which an ICE restart needs since it
/// starts from the disconnected state.
pub(crate) async fn wait_for_ice_connection(
    pc: &Arc<dyn PeerConnection>,
    timeout: Duration,
    tolerate_disconnected: bool,
) -> SessionResult<()> {
    let mut rx = pc.subscribe();
    let deadline = Instant::now() + timeout;
    let mut ticker = interval(STATE_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let check = |state: IceConnectionState| -> Option<SessionResult<()>> {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => Some(Ok(())),
            IceConnectionState::Failed => Some(Err(SessionError::ConnectionFailed {
                reason: "ICE connection failed".to_string(),
            })),
            IceConnectionState::Disconnected if !tolerate_disconnected => Some(Err(SessionError::ConnectionFailed {
                reason: "ICE connection disconnected".to_string(),
            })),
            IceConnectionState::Closed => Some(Err(SessionError::Closed)),
            _ => None,
        }
    };

    loop {
        if let Some(result) = check(pc.ice_connection_state()) {
            return result;
        }

        tokio::select! {
            event = rx.recv() => match event {
                Ok(PeerConnectionEvent::IceConnectionStateChanged(state)) => {
                    if let Some(result) = check(state) {
                        return result;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(SessionError::Closed),
            },
            _ = ticker.tick() => {}
            _ = sleep_until(deadline) => {
                return Err(SessionError::ConnectionTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}
