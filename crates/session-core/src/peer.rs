//! Ownership of the underlying peer connection
//!
//! [`PeerConnectionManager`] wraps the connection created by the injected
//! factory, relays its events on a broadcast channel that outlives any single
//! connection, and keeps the sender list free of duplicates.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::transport::{PeerConnection, PeerConnectionEvent, PeerConnectionFactory};
use crate::types::{MediaTrack, RtcConfiguration, RtpSender, SessionDescription, SignalingState};

const EVENT_CAPACITY: usize = 256;

pub struct PeerConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    rtc: RtcConfiguration,
    connection: RwLock<Option<Arc<dyn PeerConnection>>>,
    events: broadcast::Sender<PeerConnectionEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn PeerConnectionFactory>, rtc: RtcConfiguration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            factory,
            rtc,
            connection: RwLock::new(None),
            events,
            forwarder: Mutex::new(None),
        }
    }

    /// Create the peer connection, replacing (and closing) any previous one
    pub async fn create(&self) -> SessionResult<Arc<dyn PeerConnection>> {
        if !self.factory.is_supported() {
            return Err(SessionError::Unsupported);
        }

        let pc = self.factory.create(&self.rtc).await?;

        // Subscribe before the forwarder starts so no early event is missed
        let mut rx = pc.subscribe();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Peer connection event relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let previous = self.connection.write().replace(pc.clone());
        if let Some(old) = self.forwarder.lock().replace(forwarder) {
            old.abort();
        }
        if let Some(previous) = previous {
            debug!("Replacing existing peer connection");
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Failed to close replaced peer connection");
            }
        }

        Ok(pc)
    }

    pub fn connection(&self) -> SessionResult<Arc<dyn PeerConnection>> {
        self.connection.read().clone().ok_or(SessionError::NoPeerConnection)
    }

    pub fn has_connection(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Events from the current (and any future) peer connection
    pub fn subscribe(&self) -> broadcast::Receiver<PeerConnectionEvent> {
        self.events.subscribe()
    }

    pub fn signaling_state(&self) -> Option<SignalingState> {
        self.connection.read().as_ref().map(|pc| pc.signaling_state())
    }

    /// Attach a local track
    ///
    /// An empty sender of the same kind left over from an earlier track is
    /// reused through `replace_track` instead of adding a second sender.
    pub async fn add_local_track(&self, track: MediaTrack) -> SessionResult<RtpSender> {
        let pc = self.connection()?;
        let senders = pc.senders();

        if let Some(existing) = senders
            .iter()
            .find(|s| s.track.as_ref().map(|t| t.id == track.id).unwrap_or(false))
        {
            return Ok(existing.clone());
        }

        if let Some(empty) = senders.into_iter().find(|s| s.kind == track.kind && s.track.is_none()) {
            debug!(sender_id = %empty.id, "Reusing empty sender for local track");
            pc.replace_track(&empty.id, Some(track.clone())).await?;
            return Ok(RtpSender { track: Some(track), ..empty });
        }

        pc.add_track(track).await
    }

    /// Create an offer and set it as the local description
    pub async fn create_offer(&self) -> SessionResult<SessionDescription> {
        let pc = self.connection()?;
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Create an answer and set it as the local description
    pub async fn create_answer(&self) -> SessionResult<SessionDescription> {
        let pc = self.connection()?;
        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn close(&self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        let pc = self.connection.write().take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                warn!(error = %e, "Failed to close peer connection");
            }
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackPeerConnectionFactory;
    use crate::types::{MediaKind, PeerConnectionState};

    fn manager() -> (PeerConnectionManager, Arc<LoopbackPeerConnectionFactory>) {
        let factory = Arc::new(LoopbackPeerConnectionFactory::new());
        let manager = PeerConnectionManager::new(factory.clone(), RtcConfiguration::default());
        (manager, factory)
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (manager, _) = manager();
        assert!(matches!(manager.create_offer().await, Err(SessionError::NoPeerConnection)));
        assert!(manager.signaling_state().is_none());
    }

    #[tokio::test]
    async fn test_empty_sender_is_reused() {
        let (manager, _) = manager();
        let pc = manager.create().await.unwrap();

        let first = manager.add_local_track(MediaTrack::new(MediaKind::Audio)).await.unwrap();
        pc.replace_track(&first.id, None).await.unwrap();

        let second = manager.add_local_track(MediaTrack::new(MediaKind::Audio)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(pc.senders().len(), 1);
        assert!(pc.senders()[0].track.is_some());
    }

    #[tokio::test]
    async fn test_same_track_is_not_added_twice() {
        let (manager, _) = manager();
        let pc = manager.create().await.unwrap();
        let track = MediaTrack::new(MediaKind::Audio);

        manager.add_local_track(track.clone()).await.unwrap();
        manager.add_local_track(track).await.unwrap();
        assert_eq!(pc.senders().len(), 1);
    }

    #[tokio::test]
    async fn test_offer_sets_local_description() {
        let (manager, _) = manager();
        let pc = manager.create().await.unwrap();
        let offer = manager.create_offer().await.unwrap();

        assert_eq!(pc.local_description(), Some(offer));
        assert_eq!(manager.signaling_state(), Some(SignalingState::HaveLocalOffer));
    }

    #[tokio::test]
    async fn test_events_survive_close() {
        let (manager, factory) = manager();
        let mut rx = manager.subscribe();
        manager.create().await.unwrap();
        let pc = factory.last_created().unwrap();

        pc.set_connection_state(PeerConnectionState::Connecting);
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            PeerConnectionEvent::ConnectionStateChanged(PeerConnectionState::Connecting)
        ));

        manager.close().await;
        assert!(!manager.has_connection());
    }
}
