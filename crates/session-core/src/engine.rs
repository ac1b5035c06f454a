//! The session negotiation engine
//!
//! [`NegotiationEngine`] runs one peer call at a time for a local identity:
//!
//! ```text
//! outbound: media -> peer connection -> local track -> offer -> gather
//!           -> send offer + candidates -> (answer) -> connect
//! inbound:  offer -> IncomingCall + auto-hangup timer
//!           -> accept: media -> peer connection -> apply offer
//!              -> answer -> gather -> send answer + candidates -> connect
//! ```
//!
//! An outbound call that gets no answer within `unanswered_call_timeout` is
//! hung up as missed; so is an inbound offer nobody accepts. An inbound
//! offer's timer is cancelled exactly once, by whichever of accept, reject
//! or expiry removes the pending offer first.
//!
//! All outcomes are published as [`SessionEvent`]s. Teardown is idempotent:
//! whichever path ends a session first wins, and `CallEnded` is emitted once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};
use crate::ice::{IceManager, TroubleshootingReport};
use crate::monitor::{ConnectionMonitor, MonitorEvent};
use crate::negotiation::{ApplyOutcome, SessionManager};
use crate::peer::PeerConnectionManager;
use crate::signaling::{SignalHandler, SignalingStore, SignalingTransport};
use crate::transport::{MediaDevices, PeerConnectionEvent, PeerConnectionFactory};
use crate::types::{
    CallSession, ConnectionQuality, EndReason, IceCandidate, IceConnectionState, MediaStream, NegotiationState,
    PeerConnectionState, SessionDescription,
};

/// Events published by the engine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    IncomingCall { call_id: String, from: String },
    CallAnswered { call_id: String },
    NegotiationStateChanged { call_id: String, state: NegotiationState },
    ConnectionStateChanged { call_id: String, state: PeerConnectionState },
    LocalStream { call_id: String, stream: MediaStream },
    RemoteStream { call_id: String, stream: MediaStream },
    QualityChanged { call_id: String, quality: ConnectionQuality },
    Troubleshooting { call_id: String, report: TroubleshootingReport },
    CallEnded { call_id: String, reason: EndReason },
    Error { call_id: Option<String>, error: SessionError },
}

struct Session {
    info: CallSession,
    peer: PeerConnectionManager,
    ice: IceManager,
    sdp: SessionManager,
    monitor: Arc<ConnectionMonitor>,
    state: Mutex<NegotiationState>,
    local_stream: Mutex<Option<MediaStream>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    answer_timer: Mutex<Option<JoinHandle<()>>>,
    /// The offer or answer is out; local candidates may now be trickled
    signals_sent: AtomicBool,
    ended: AtomicBool,
    reconnecting: AtomicBool,
}

impl Session {
    fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    fn call_id(&self) -> &str {
        &self.info.call_id
    }

    fn remote(&self) -> &str {
        &self.info.remote_identity
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

struct PendingOffer {
    from: String,
    offer: SessionDescription,
    candidates: Vec<IceCandidate>,
    timer: JoinHandle<()>,
}

pub struct NegotiationEngine {
    config: EngineConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    media: Arc<dyn MediaDevices>,
    store: Arc<dyn SignalingStore>,
    signaling: RwLock<Option<Arc<SignalingTransport>>>,
    active: Mutex<Option<Arc<Session>>>,
    pending: Mutex<HashMap<String, PendingOffer>>,
    events: broadcast::Sender<SessionEvent>,
}

impl NegotiationEngine {
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaDevices>,
        store: Arc<dyn SignalingStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            factory,
            media,
            store,
            signaling: RwLock::new(None),
            active: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the runtime can run peer calls at all
    pub fn is_supported(&self) -> bool {
        self.factory.is_supported()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn identity(&self) -> Option<String> {
        self.signaling.read().as_ref().map(|s| s.local_identity().to_string())
    }

    pub fn is_started(&self) -> bool {
        self.signaling.read().is_some()
    }

    pub fn active_call(&self) -> Option<CallSession> {
        self.active.lock().as_ref().map(|s| s.info.clone())
    }

    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        self.active.lock().as_ref().map(|s| s.state())
    }

    /// Inbound calls waiting for accept or reject, as `(call_id, from)`
    pub fn pending_calls(&self) -> Vec<(String, String)> {
        self.pending
            .lock()
            .iter()
            .map(|(call_id, pending)| (call_id.clone(), pending.from.clone()))
            .collect()
    }

    pub fn troubleshooting_report(&self) -> Option<TroubleshootingReport> {
        let session = self.active.lock().clone()?;
        let pc = session.peer.connection().ok();
        Some(session.ice.troubleshooting_report(pc.as_ref()))
    }

    /// Listen for signals addressed to `identity`
    pub fn start(self: &Arc<Self>, identity: &str) -> SessionResult<()> {
        if !self.factory.is_supported() {
            return Err(SessionError::Unsupported);
        }

        let transport = Arc::new(SignalingTransport::new(self.store.clone(), identity));
        transport.start_listening(Arc::new(EngineSignalHandler { engine: Arc::downgrade(self) }));

        let previous = self.signaling.write().replace(transport);
        if let Some(previous) = previous {
            previous.stop_listening();
        }
        info!(identity, "Negotiation engine started");
        Ok(())
    }

    /// End the active call, hang up pending offers and stop listening
    pub async fn stop(&self) {
        let _ = self.end_call().await;

        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (call_id, pending) in pending {
            pending.timer.abort();
            self.send_hangup(&pending.from, &call_id, EndReason::LocalHangup).await;
        }

        let transport = self.signaling.write().take();
        if let Some(transport) = transport {
            transport.stop_listening();
            info!(identity = transport.local_identity(), "Negotiation engine stopped");
        }
    }

    // ===== OUTBOUND =====

    /// Call `remote`; returns once the offer has been sent
    pub async fn start_call(self: &Arc<Self>, remote: &str) -> SessionResult<CallSession> {
        self.start_call_with_id(remote, &Uuid::new_v4().to_string()).await
    }

    /// Call `remote` under a caller-chosen call id
    pub async fn start_call_with_id(self: &Arc<Self>, remote: &str, call_id: &str) -> SessionResult<CallSession> {
        let signaling = self.signaling()?;
        let session = self.claim_session(&signaling, remote, true, call_id.to_string())?;
        info!(call_id = session.call_id(), remote, "Starting outbound call");

        match self.run_outbound(&session, &signaling).await {
            Ok(()) => Ok(session.info.clone()),
            Err(e) => {
                if !session.ended.load(Ordering::SeqCst) {
                    error!(call_id = session.call_id(), error = %e, "Outbound call setup failed");
                    self.emit(SessionEvent::Error { call_id: Some(session.info.call_id.clone()), error: e.clone() });
                    let notify = session.signals_sent.load(Ordering::SeqCst);
                    self.teardown(&session, EndReason::Failed, notify).await;
                }
                Err(e)
            }
        }
    }

    async fn run_outbound(self: &Arc<Self>, session: &Arc<Session>, signaling: &SignalingTransport) -> SessionResult<()> {
        let stream = self.media.get_user_media(&self.config.media).await?;
        self.attach_local_stream(session, stream.clone());

        self.spawn_session_loop(session);
        let pc = session.peer.create().await?;
        for track in stream.tracks {
            session.peer.add_local_track(track).await?;
        }

        self.advance_state(session, NegotiationState::Gathering);
        let offer = session.peer.create_offer().await?;
        let gathered = session
            .ice
            .wait_for_gathering_complete(&pc, self.config.ice_gathering_timeout)
            .await;
        if gathered.is_empty() {
            self.report_stall(session, "no local candidates gathered");
        }
        if session.ended.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        signaling.send_offer(session.remote(), session.call_id(), &offer).await?;
        session.signals_sent.store(true, Ordering::SeqCst);
        self.advance_state(session, NegotiationState::Offered);
        self.flush_local_candidates(session, signaling).await;
        self.arm_answer_timer(session);

        info!(call_id = session.call_id(), candidates = gathered.len(), "Offer sent");
        Ok(())
    }

    fn arm_answer_timer(self: &Arc<Self>, session: &Arc<Session>) {
        let engine = Arc::downgrade(self);
        let target = Arc::downgrade(session);
        let timeout = self.config.unanswered_call_timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(engine), Some(session)) = (engine.upgrade(), target.upgrade()) else {
                return;
            };
            // Detach ourselves so teardown does not abort this task
            session.answer_timer.lock().take();
            if session.state() == NegotiationState::Offered {
                info!(call_id = session.call_id(), "Outbound call unanswered");
                engine.teardown(&session, EndReason::Missed, true).await;
            }
        });

        if let Some(previous) = session.answer_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    // ===== INBOUND =====

    async fn on_offer(self: &Arc<Self>, call_id: &str, from: &str, offer: SessionDescription) {
        if self.pending.lock().contains_key(call_id) || self.session_for(call_id).is_some() {
            debug!(call_id, "Offer for a known call, ignoring");
            return;
        }

        let busy = self.active.lock().as_ref().map(|s| s.info.call_id.clone());
        if let Some(active) = busy {
            info!(call_id, from, active_call = %active, "Rejecting offer while busy");
            self.send_hangup(from, call_id, EndReason::Busy).await;
            return;
        }

        let engine = Arc::downgrade(self);
        let timeout = self.config.unanswered_call_timeout;
        let expiring = call_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(engine) = engine.upgrade() {
                engine.expire_offer(&expiring).await;
            }
        });

        self.pending.lock().insert(
            call_id.to_string(),
            PendingOffer { from: from.to_string(), offer, candidates: Vec::new(), timer },
        );
        info!(call_id, from, "Incoming call");
        self.emit(SessionEvent::IncomingCall { call_id: call_id.to_string(), from: from.to_string() });
    }

    async fn expire_offer(&self, call_id: &str) {
        let expired = self.pending.lock().remove(call_id);
        let Some(pending) = expired else { return };

        info!(call_id, from = %pending.from, "Incoming call not answered");
        self.send_hangup(&pending.from, call_id, EndReason::Missed).await;
        self.clear_inbox(call_id).await;
        self.emit(SessionEvent::CallEnded { call_id: call_id.to_string(), reason: EndReason::Missed });
    }

    /// Accept a pending inbound call; returns once the answer has been sent
    pub async fn accept_call(self: &Arc<Self>, call_id: &str) -> SessionResult<CallSession> {
        let signaling = self.signaling()?;
        let taken = self.pending.lock().remove(call_id);
        let pending = taken.ok_or_else(|| SessionError::UnknownCall { call_id: call_id.to_string() })?;
        pending.timer.abort();

        let session = match self.claim_session(&signaling, &pending.from, false, call_id.to_string()) {
            Ok(session) => session,
            Err(e) => {
                self.send_hangup(&pending.from, call_id, EndReason::Busy).await;
                self.emit(SessionEvent::CallEnded { call_id: call_id.to_string(), reason: EndReason::Busy });
                return Err(e);
            }
        };
        info!(call_id, from = %pending.from, "Accepting inbound call");

        match self.run_inbound(&session, &signaling, pending.offer, pending.candidates).await {
            Ok(()) => Ok(session.info.clone()),
            Err(e) => {
                if !session.ended.load(Ordering::SeqCst) {
                    error!(call_id, error = %e, "Inbound call setup failed");
                    self.emit(SessionEvent::Error { call_id: Some(call_id.to_string()), error: e.clone() });
                    self.teardown(&session, EndReason::Failed, true).await;
                }
                Err(e)
            }
        }
    }

    async fn run_inbound(
        self: &Arc<Self>,
        session: &Arc<Session>,
        signaling: &SignalingTransport,
        offer: SessionDescription,
        queued: Vec<IceCandidate>,
    ) -> SessionResult<()> {
        let stream = self.media.get_user_media(&self.config.media).await?;
        self.attach_local_stream(session, stream.clone());

        self.spawn_session_loop(session);
        let pc = session.peer.create().await?;
        for track in stream.tracks {
            session.peer.add_local_track(track).await?;
        }

        session.sdp.apply_remote_offer(&pc, offer).await?;
        for candidate in queued {
            if let Err(e) = session.ice.add_remote_candidate(Some(&pc), candidate).await {
                warn!(call_id = session.call_id(), error = %e, "Failed to apply early candidate");
            }
        }
        session.ice.flush_remote_candidates(&pc).await?;

        self.advance_state(session, NegotiationState::Gathering);
        let answer = session.peer.create_answer().await?;
        let gathered = session
            .ice
            .wait_for_gathering_complete(&pc, self.config.ice_gathering_timeout)
            .await;
        if gathered.is_empty() {
            self.report_stall(session, "no local candidates gathered");
        }
        if session.ended.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        signaling.send_answer(session.remote(), session.call_id(), &answer).await?;
        session.signals_sent.store(true, Ordering::SeqCst);
        self.advance_state(session, NegotiationState::Answered);
        self.flush_local_candidates(session, signaling).await;
        self.spawn_connection_wait(session);

        self.emit(SessionEvent::CallAnswered { call_id: session.info.call_id.clone() });
        Ok(())
    }

    /// Decline a pending inbound call
    pub async fn reject_call(&self, call_id: &str) -> SessionResult<()> {
        let taken = self.pending.lock().remove(call_id);
        let pending = taken.ok_or_else(|| SessionError::UnknownCall { call_id: call_id.to_string() })?;
        pending.timer.abort();

        info!(call_id, from = %pending.from, "Rejecting inbound call");
        self.send_hangup(&pending.from, call_id, EndReason::Rejected).await;
        self.clear_inbox(call_id).await;
        self.emit(SessionEvent::CallEnded { call_id: call_id.to_string(), reason: EndReason::Rejected });
        Ok(())
    }

    /// Hang up the active call
    pub async fn end_call(&self) -> SessionResult<()> {
        self.end_call_with(EndReason::LocalHangup).await
    }

    /// Hang up the active call, reporting `reason` locally and to the peer
    pub async fn end_call_with(&self, reason: EndReason) -> SessionResult<()> {
        let session = self.active.lock().clone().ok_or(SessionError::NoActiveSession)?;
        let notify = session.signals_sent.load(Ordering::SeqCst);
        self.teardown(&session, reason, notify).await;
        Ok(())
    }

    /// Enable or disable the local audio tracks of the active call
    pub fn set_muted(&self, muted: bool) -> SessionResult<()> {
        let session = self.active.lock().clone().ok_or(SessionError::NoActiveSession)?;
        if let Some(stream) = session.local_stream.lock().as_ref() {
            for track in stream.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
        debug!(call_id = session.call_id(), muted, "Local audio mute changed");
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        let session = self.active.lock().clone();
        session
            .and_then(|s| {
                s.local_stream
                    .lock()
                    .as_ref()
                    .map(|stream| stream.audio_tracks().all(|t| !t.is_enabled()))
            })
            .unwrap_or(false)
    }

    // ===== REMOTE SIGNALS FOR THE ACTIVE SESSION =====

    async fn on_answer(self: &Arc<Self>, call_id: &str, from: &str, answer: SessionDescription) {
        let Some(session) = self.session_for(call_id) else {
            debug!(call_id, "Answer for unknown call, ignoring");
            return;
        };
        if !session.info.is_initiator || session.remote() != from {
            warn!(call_id, from, "Unexpected answer, ignoring");
            return;
        }
        let Ok(pc) = session.peer.connection() else { return };

        match session.sdp.apply_remote_answer(&pc, answer).await {
            Ok(ApplyOutcome::Applied) => {
                if let Some(timer) = session.answer_timer.lock().take() {
                    timer.abort();
                }
                self.advance_state(&session, NegotiationState::Answered);
                if let Err(e) = session.ice.flush_remote_candidates(&pc).await {
                    warn!(call_id, error = %e, "Failed to flush queued candidates");
                }
                self.spawn_connection_wait(&session);
                info!(call_id, "Call answered");
                self.emit(SessionEvent::CallAnswered { call_id: call_id.to_string() });
            }
            Ok(ApplyOutcome::Duplicate) => debug!(call_id, "Duplicate answer absorbed"),
            Err(e @ SessionError::SignalingOrder { .. }) => {
                warn!(call_id, error = %e, "Dropping out-of-order answer");
            }
            Err(e) => {
                warn!(call_id, error = %e, "Failed to apply answer");
                self.emit(SessionEvent::Error { call_id: Some(call_id.to_string()), error: e });
            }
        }
    }

    async fn on_candidate(&self, call_id: &str, from: &str, candidate: IceCandidate) {
        {
            let mut pending = self.pending.lock();
            if let Some(offer) = pending.get_mut(call_id) {
                if candidate.is_usable() && !offer.candidates.contains(&candidate) {
                    offer.candidates.push(candidate);
                }
                return;
            }
        }

        let Some(session) = self.session_for(call_id) else {
            debug!(call_id, "Candidate for unknown call, ignoring");
            return;
        };
        if session.remote() != from {
            return;
        }

        let pc = session.peer.connection().ok();
        match session.ice.add_remote_candidate(pc.as_ref(), candidate).await {
            Ok(outcome) => debug!(call_id, ?outcome, "Remote candidate handled"),
            Err(e) => warn!(call_id, error = %e, "Failed to add remote candidate"),
        }
    }

    async fn on_hangup(&self, call_id: &str, from: &str, reason: String) {
        let reason = EndReason::from_remote(&reason);

        let pending = self.pending.lock().remove(call_id);
        if let Some(pending) = pending {
            pending.timer.abort();
            info!(call_id, from, %reason, "Caller hung up before answer");
            self.clear_inbox(call_id).await;
            self.emit(SessionEvent::CallEnded { call_id: call_id.to_string(), reason });
            return;
        }

        if let Some(session) = self.session_for(call_id) {
            if session.remote() == from {
                info!(call_id, from, %reason, "Remote hung up");
                self.teardown(&session, reason, false).await;
            }
        }
    }

    // ===== SESSION INTERNALS =====

    fn signaling(&self) -> SessionResult<Arc<SignalingTransport>> {
        self.signaling
            .read()
            .clone()
            .ok_or_else(|| SessionError::signaling("engine is not listening for signals"))
    }

    fn session_for(&self, call_id: &str) -> Option<Arc<Session>> {
        self.active
            .lock()
            .as_ref()
            .filter(|s| s.info.call_id == call_id)
            .cloned()
    }

    fn claim_session(
        &self,
        signaling: &SignalingTransport,
        remote: &str,
        is_initiator: bool,
        call_id: String,
    ) -> SessionResult<Arc<Session>> {
        let mut active = self.active.lock();
        if let Some(existing) = active.as_ref() {
            return Err(SessionError::SessionBusy { call_id: existing.info.call_id.clone() });
        }

        let session = Arc::new(Session {
            info: CallSession {
                session_id: Uuid::new_v4().to_string(),
                call_id,
                local_identity: signaling.local_identity().to_string(),
                remote_identity: remote.to_string(),
                is_initiator,
                started_at: Utc::now(),
            },
            peer: PeerConnectionManager::new(self.factory.clone(), self.config.rtc.clone()),
            ice: IceManager::new(),
            sdp: SessionManager::new(),
            monitor: Arc::new(ConnectionMonitor::new(
                self.config.monitor.clone(),
                self.config.connection_timeout,
            )),
            state: Mutex::new(NegotiationState::New),
            local_stream: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            answer_timer: Mutex::new(None),
            signals_sent: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        });
        *active = Some(session.clone());
        Ok(session)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, session: &Session, state: NegotiationState) {
        {
            let mut current = session.state.lock();
            if *current == state || (current.is_terminal() && !state.is_terminal()) {
                return;
            }
            *current = state;
        }
        debug!(call_id = session.call_id(), ?state, "Negotiation state changed");
        self.emit(SessionEvent::NegotiationStateChanged { call_id: session.info.call_id.clone(), state });
    }

    /// Move forward through the setup states; never steps back from a later one
    fn advance_state(&self, session: &Session, state: NegotiationState) {
        let rank = |s: NegotiationState| match s {
            NegotiationState::New => 0,
            NegotiationState::Gathering => 1,
            NegotiationState::Offered => 2,
            NegotiationState::Answered => 3,
            NegotiationState::IceChecking => 4,
            _ => 5,
        };
        if rank(session.state()) < rank(state) {
            self.set_state(session, state);
        }
    }

    fn attach_local_stream(&self, session: &Session, stream: MediaStream) {
        *session.local_stream.lock() = Some(stream.clone());
        self.emit(SessionEvent::LocalStream { call_id: session.info.call_id.clone(), stream });
    }

    fn report_stall(&self, session: &Session, what: &str) {
        let pc = session.peer.connection().ok();
        let report = session.ice.troubleshooting_report(pc.as_ref());
        warn!(call_id = session.call_id(), ?report, "Negotiation stalled: {what}");
        self.emit(SessionEvent::Troubleshooting { call_id: session.info.call_id.clone(), report });
    }

    async fn flush_local_candidates(&self, session: &Session, signaling: &SignalingTransport) {
        for candidate in session.ice.take_unsent_local() {
            if let Err(e) = signaling.send_candidate(session.remote(), session.call_id(), &candidate).await {
                warn!(call_id = session.call_id(), error = %e, "Failed to send local candidate");
            }
        }
    }

    async fn send_hangup(&self, recipient: &str, call_id: &str, reason: EndReason) {
        let Ok(signaling) = self.signaling() else { return };
        if let Err(e) = signaling.send_hangup(recipient, call_id, reason.as_str()).await {
            warn!(call_id, error = %e, "Failed to send hangup");
        }
    }

    async fn clear_inbox(&self, call_id: &str) {
        let Ok(signaling) = self.signaling() else { return };
        if let Err(e) = signaling.clear_inbox(call_id).await {
            debug!(call_id, error = %e, "Failed to clear signaling inbox");
        }
    }

    fn spawn_session_loop(self: &Arc<Self>, session: &Arc<Session>) {
        let mut pc_events = session.peer.subscribe();
        let mut monitor_events = session.monitor.subscribe();
        let engine = Arc::downgrade(self);
        let target = Arc::downgrade(session);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = pc_events.recv() => match event {
                        Ok(event) => {
                            let (Some(engine), Some(session)) = (engine.upgrade(), target.upgrade()) else { break };
                            engine.handle_peer_event(&session, event).await;
                        }
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Session event loop lagged"),
                        Err(RecvError::Closed) => break,
                    },
                    event = monitor_events.recv() => match event {
                        Ok(event) => {
                            let (Some(engine), Some(session)) = (engine.upgrade(), target.upgrade()) else { break };
                            engine.handle_monitor_event(&session, event);
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        session.track_task(task);
    }

    async fn handle_peer_event(self: &Arc<Self>, session: &Arc<Session>, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceCandidate(Some(candidate)) => {
                if session.ice.add_local_candidate(candidate) && session.signals_sent.load(Ordering::SeqCst) {
                    if let Ok(signaling) = self.signaling() {
                        self.flush_local_candidates(session, &signaling).await;
                    }
                }
            }
            PeerConnectionEvent::IceConnectionStateChanged(state) => match state {
                IceConnectionState::Checking => {
                    if session.signals_sent.load(Ordering::SeqCst) {
                        self.advance_state(session, NegotiationState::IceChecking);
                    }
                }
                IceConnectionState::Connected | IceConnectionState::Completed => self.on_connected(session),
                IceConnectionState::Disconnected | IceConnectionState::Failed => {
                    if session.state() == NegotiationState::Connected {
                        self.set_state(session, NegotiationState::Disconnected);
                        self.spawn_reconnection(session);
                    }
                }
                _ => {}
            },
            PeerConnectionEvent::ConnectionStateChanged(state) => {
                self.emit(SessionEvent::ConnectionStateChanged { call_id: session.info.call_id.clone(), state });
                if state == PeerConnectionState::Connected {
                    self.on_connected(session);
                }
            }
            PeerConnectionEvent::Track(stream) => {
                debug!(call_id = session.call_id(), "Remote stream arrived");
                self.emit(SessionEvent::RemoteStream { call_id: session.info.call_id.clone(), stream });
            }
            PeerConnectionEvent::IceCandidate(None)
            | PeerConnectionEvent::IceGatheringStateChanged(_)
            | PeerConnectionEvent::SignalingStateChanged(_) => {}
        }
    }

    fn handle_monitor_event(&self, session: &Session, event: MonitorEvent) {
        match event {
            MonitorEvent::Stats(stats) => session.ice.record_round_trip_time(stats.round_trip_time_ms),
            MonitorEvent::QualityChanged(quality) => {
                self.emit(SessionEvent::QualityChanged { call_id: session.info.call_id.clone(), quality });
            }
            other => debug!(call_id = session.call_id(), event = ?other, "Monitor event"),
        }
    }

    fn on_connected(&self, session: &Session) {
        if matches!(session.state(), NegotiationState::Connected) || session.state().is_terminal() {
            return;
        }
        self.set_state(session, NegotiationState::Connected);
        if !session.monitor.is_running() {
            if let Ok(pc) = session.peer.connection() {
                session.monitor.start(pc);
            }
        }
        info!(call_id = session.call_id(), "Peer connection established");
    }

    fn spawn_connection_wait(self: &Arc<Self>, session: &Arc<Session>) {
        let engine = self.clone();
        let target = session.clone();
        let timeout = self.config.connection_timeout;

        let task = tokio::spawn(async move {
            let Ok(pc) = target.peer.connection() else { return };
            match target.ice.wait_for_connection(&pc, timeout).await {
                Ok(()) => engine.on_connected(&target),
                Err(e) => {
                    engine.report_stall(&target, "peer connection not established");
                    engine.emit(SessionEvent::Error { call_id: Some(target.info.call_id.clone()), error: e.clone() });
                    let reason = if e.is_timeout() { EndReason::Timeout } else { EndReason::Failed };
                    engine.spawn_teardown(target, reason, true);
                }
            }
        });
        session.track_task(task);
    }

    fn spawn_reconnection(self: &Arc<Self>, session: &Arc<Session>) {
        if session.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let target = session.clone();

        let task = tokio::spawn(async move {
            let Ok(pc) = target.peer.connection() else { return };
            let result = target.monitor.attempt_reconnection(&pc).await;
            target.reconnecting.store(false, Ordering::SeqCst);
            match result {
                Ok(_) => engine.on_connected(&target),
                Err(e) => {
                    error!(call_id = target.call_id(), error = %e, "Giving up on connection");
                    engine.emit(SessionEvent::Error { call_id: Some(target.info.call_id.clone()), error: e });
                    engine.spawn_teardown(target, EndReason::Failed, true);
                }
            }
        });
        session.track_task(task);
    }

    /// Tear down from inside one of the session's own tasks
    fn spawn_teardown(self: &Arc<Self>, session: Arc<Session>, reason: EndReason, notify_remote: bool) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.teardown(&session, reason, notify_remote).await;
        });
    }

    async fn teardown(&self, session: &Arc<Session>, reason: EndReason, notify_remote: bool) {
        if session.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut active = self.active.lock();
            if active.as_ref().map(|a| Arc::ptr_eq(a, session)).unwrap_or(false) {
                *active = None;
            }
        }
        if let Some(timer) = session.answer_timer.lock().take() {
            timer.abort();
        }
        if notify_remote {
            self.send_hangup(session.remote(), session.call_id(), reason).await;
        }

        session.monitor.stop();
        let tasks: Vec<_> = session.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let stream = session.local_stream.lock().take();
        if let Some(stream) = stream {
            stream.stop_all();
        }
        session.peer.close().await;
        session.ice.clear();
        session.sdp.reset();
        self.set_state(session, NegotiationState::Closed);
        self.clear_inbox(session.call_id()).await;

        info!(call_id = session.call_id(), %reason, "Call ended");
        self.emit(SessionEvent::CallEnded { call_id: session.info.call_id.clone(), reason });
    }
}

/// Routes signals to an engine without keeping it alive
struct EngineSignalHandler {
    engine: Weak<NegotiationEngine>,
}

#[async_trait]
impl SignalHandler for EngineSignalHandler {
    async fn on_offer(&self, call_id: &str, from: &str, offer: SessionDescription) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_offer(call_id, from, offer).await;
        }
    }

    async fn on_answer(&self, call_id: &str, from: &str, answer: SessionDescription) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_answer(call_id, from, answer).await;
        }
    }

    async fn on_candidate(&self, call_id: &str, from: &str, candidate: IceCandidate) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_candidate(call_id, from, candidate).await;
        }
    }

    async fn on_hangup(&self, call_id: &str, from: &str, reason: String) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_hangup(call_id, from, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::loopback::{LoopbackPeerConnectionFactory, StaticMediaDevices};
    use crate::signaling::MemorySignalingStore;

    fn engine(store: Arc<MemorySignalingStore>, media: Arc<StaticMediaDevices>) -> Arc<NegotiationEngine> {
        NegotiationEngine::new(
            EngineConfig::default(),
            Arc::new(LoopbackPeerConnectionFactory::new()),
            media,
            store,
        )
    }

    #[tokio::test]
    async fn test_call_requires_start() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = engine(store, Arc::new(StaticMediaDevices::new()));
        assert!(matches!(alice.start_call("bob").await, Err(SessionError::Signaling { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_runtime_cannot_start() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = NegotiationEngine::new(
            EngineConfig::default(),
            Arc::new(LoopbackPeerConnectionFactory::unsupported()),
            Arc::new(StaticMediaDevices::new()),
            store,
        );
        assert!(!alice.is_supported());
        assert!(matches!(alice.start("alice"), Err(SessionError::Unsupported)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_failure_ends_call_without_signal() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = engine(store.clone(), Arc::new(StaticMediaDevices::failing(MediaError::PermissionDenied)));
        alice.start("alice").unwrap();
        let mut events = alice.subscribe();

        let err = alice.start_call("bob").await.unwrap_err();
        assert!(matches!(err, SessionError::Media(MediaError::PermissionDenied)));
        assert!(alice.active_call().is_none());
        assert!(store.paths("calls/bob/").is_empty());

        let mut ended = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::CallEnded { reason, .. } = event {
                ended = Some(reason);
            }
        }
        assert_eq!(ended, Some(EndReason::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_is_busy() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = engine(store, Arc::new(StaticMediaDevices::new()));
        alice.start("alice").unwrap();

        let first = alice.start_call("bob").await.unwrap();
        let err = alice.start_call("carol").await.unwrap_err();
        assert!(matches!(err, SessionError::SessionBusy { call_id } if call_id == first.call_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_toggles_local_tracks() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = engine(store, Arc::new(StaticMediaDevices::new()));
        alice.start("alice").unwrap();
        assert!(matches!(alice.set_muted(true), Err(SessionError::NoActiveSession)));

        alice.start_call("bob").await.unwrap();
        alice.set_muted(true).unwrap();
        assert!(alice.is_muted());
        alice.set_muted(false).unwrap();
        assert!(!alice.is_muted());
    }

    #[tokio::test]
    async fn test_unknown_pending_call() {
        let store = Arc::new(MemorySignalingStore::new());
        let bob = engine(store, Arc::new(StaticMediaDevices::new()));
        bob.start("bob").unwrap();
        assert!(matches!(bob.accept_call("nope").await, Err(SessionError::UnknownCall { .. })));
        assert!(matches!(bob.reject_call("nope").await, Err(SessionError::UnknownCall { .. })));
        assert!(matches!(bob.end_call().await, Err(SessionError::NoActiveSession)));
    }
}
