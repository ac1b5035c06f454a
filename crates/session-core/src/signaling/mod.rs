//! Signaling side-channel
//!
//! Offers, answers, candidates and hangups travel as [`SignalEnvelope`]s
//! through an injected pub/sub key-value store ([`SignalingStore`]). Paths
//! are namespaced by recipient identity and call id:
//!
//! ```text
//! calls/{recipient}/{callId}                      offer | answer | hangup
//! calls/{recipient}/{callId}/candidates/{autoId}  candidate
//! ```
//!
//! Candidates live in their own sub-collection so they never overwrite the
//! primary offer/answer entry.

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::types::{IceCandidate, SessionDescription};

pub use memory::MemorySignalingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Offer,
    Answer,
    Candidate,
    Hangup,
}

impl SignalType {
    fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::Candidate => "candidate",
            SignalType::Hangup => "hangup",
        }
    }
}

/// A single signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub from: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SignalEnvelope {
    pub fn new(signal_type: SignalType, from: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_type,
            from: from.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Stable fingerprint of type and payload, used to drop redeliveries
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signal_type.as_str().as_bytes());
        hasher.update(self.payload.to_string().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// An envelope delivered to a subscriber, with the path it was written to
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    pub path: String,
    pub envelope: SignalEnvelope,
}

impl SignalRecord {
    /// The call id segment of `calls/{recipient}/{callId}/...`
    pub fn call_id(&self) -> Option<&str> {
        let mut segments = self.path.split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some("calls"), Some(_), Some(call_id)) if !call_id.is_empty() => Some(call_id),
            _ => None,
        }
    }
}

/// Pub/sub key-value store carrying signaling envelopes
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Write (or overwrite) the envelope at `path`
    async fn set(&self, path: &str, envelope: SignalEnvelope) -> SessionResult<()>;

    /// Append the envelope under `parent` with a generated child id; returns the full path
    async fn push(&self, parent: &str, envelope: SignalEnvelope) -> SessionResult<String>;

    /// Remove `path` and everything below it
    async fn remove(&self, path: &str) -> SessionResult<()>;

    /// Receive every envelope written at or below `prefix`, starting with
    /// those already present. Dropping the receiver ends the subscription.
    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<SignalRecord>;
}

/// Callbacks invoked per signal type by [`SignalingTransport::start_listening`]
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_offer(&self, _call_id: &str, _from: &str, _offer: SessionDescription) {}

    async fn on_answer(&self, _call_id: &str, _from: &str, _answer: SessionDescription) {}

    async fn on_candidate(&self, _call_id: &str, _from: &str, _candidate: IceCandidate) {}

    async fn on_hangup(&self, _call_id: &str, _from: &str, _reason: String) {}
}

fn call_path(recipient: &str, call_id: &str) -> String {
    format!("calls/{recipient}/{call_id}")
}

/// Typed send/receive on top of a [`SignalingStore`] for one local identity
pub struct SignalingTransport {
    store: Arc<dyn SignalingStore>,
    local_identity: String,
    // Redelivery fingerprints, keyed by call id
    seen: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport {
    pub fn new(store: Arc<dyn SignalingStore>, local_identity: impl Into<String>) -> Self {
        Self {
            store,
            local_identity: local_identity.into(),
            seen: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    fn envelope<T: Serialize>(&self, signal_type: SignalType, payload: &T) -> SessionResult<SignalEnvelope> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| SessionError::signaling(format!("failed to encode {}: {e}", signal_type.as_str())))?;
        Ok(SignalEnvelope::new(signal_type, self.local_identity.clone(), payload))
    }

    pub async fn send_offer(&self, recipient: &str, call_id: &str, offer: &SessionDescription) -> SessionResult<()> {
        debug!(call_id, recipient, "Sending offer");
        let envelope = self.envelope(SignalType::Offer, offer)?;
        self.store.set(&call_path(recipient, call_id), envelope).await
    }

    pub async fn send_answer(&self, recipient: &str, call_id: &str, answer: &SessionDescription) -> SessionResult<()> {
        debug!(call_id, recipient, "Sending answer");
        let envelope = self.envelope(SignalType::Answer, answer)?;
        self.store.set(&call_path(recipient, call_id), envelope).await
    }

    pub async fn send_candidate(&self, recipient: &str, call_id: &str, candidate: &IceCandidate) -> SessionResult<()> {
        let envelope = self.envelope(SignalType::Candidate, candidate)?;
        let parent = format!("{}/candidates", call_path(recipient, call_id));
        self.store.push(&parent, envelope).await.map(|_| ())
    }

    pub async fn send_hangup(&self, recipient: &str, call_id: &str, reason: &str) -> SessionResult<()> {
        debug!(call_id, recipient, reason, "Sending hangup");
        let envelope = self.envelope(SignalType::Hangup, &serde_json::json!({ "reason": reason }))?;
        self.store.set(&call_path(recipient, call_id), envelope).await
    }

    /// Remove everything the remote side wrote for `call_id` into our inbox
    ///
    /// Also forgets the redelivery fingerprints recorded for the call.
    pub async fn clear_inbox(&self, call_id: &str) -> SessionResult<()> {
        let result = self.store.remove(&call_path(&self.local_identity, call_id)).await;
        self.seen.lock().remove(call_id);
        result
    }

    /// Number of calls with recorded redelivery fingerprints
    pub fn tracked_calls(&self) -> usize {
        self.seen.lock().len()
    }

    /// Start dispatching signals addressed to the local identity
    ///
    /// Self-originated signals and redeliveries (same call, sender and
    /// payload fingerprint) are dropped. Calling this again replaces the
    /// previous listener.
    pub fn start_listening(&self, handler: Arc<dyn SignalHandler>) {
        let prefix = format!("calls/{}/", self.local_identity);
        let mut rx = self.store.subscribe(&prefix);
        let local = self.local_identity.clone();
        let seen = self.seen.clone();

        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                dispatch(&local, &seen, handler.as_ref(), record).await;
            }
            debug!(identity = %local, "Signaling subscription closed");
        });

        if let Some(previous) = self.listener.lock().replace(task) {
            previous.abort();
        }
        debug!(identity = %self.local_identity, "Listening for signals");
    }

    pub fn stop_listening(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
            debug!(identity = %self.local_identity, "Stopped listening for signals");
        }
        self.seen.lock().clear();
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }
}

async fn dispatch(
    local: &str,
    seen: &Mutex<HashMap<String, HashSet<String>>>,
    handler: &dyn SignalHandler,
    record: SignalRecord,
) {
    let envelope = &record.envelope;
    if envelope.from == local {
        return;
    }
    let Some(call_id) = record.call_id() else {
        warn!(path = %record.path, "Ignoring signal outside a call path");
        return;
    };

    let key = format!("{}:{}", envelope.from, envelope.fingerprint());
    if !seen.lock().entry(call_id.to_string()).or_default().insert(key) {
        debug!(call_id, from = %envelope.from, "Dropping redelivered signal");
        return;
    }

    let from = envelope.from.as_str();
    match envelope.signal_type {
        SignalType::Offer | SignalType::Answer => {
            let description: SessionDescription = match serde_json::from_value(envelope.payload.clone()) {
                Ok(description) => description,
                Err(e) => {
                    warn!(call_id, error = %e, "Malformed session description in signal");
                    return;
                }
            };
            if envelope.signal_type == SignalType::Offer {
                handler.on_offer(call_id, from, description).await;
            } else {
                handler.on_answer(call_id, from, description).await;
            }
        }
        SignalType::Candidate => match serde_json::from_value::<IceCandidate>(envelope.payload.clone()) {
            Ok(candidate) => handler.on_candidate(call_id, from, candidate).await,
            Err(e) => warn!(call_id, error = %e, "Malformed candidate in signal"),
        },
        SignalType::Hangup => {
            let reason = envelope
                .payload
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("hangup")
                .to_string();
            handler.on_hangup(call_id, from, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SignalHandler for Recorder {
        async fn on_offer(&self, call_id: &str, from: &str, _offer: SessionDescription) {
            self.received.lock().push((format!("offer:{call_id}"), from.to_string()));
        }

        async fn on_candidate(&self, call_id: &str, from: &str, _candidate: IceCandidate) {
            self.received.lock().push((format!("candidate:{call_id}"), from.to_string()));
        }

        async fn on_hangup(&self, call_id: &str, _from: &str, reason: String) {
            self.received.lock().push((format!("hangup:{call_id}"), reason));
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_call_id_from_path() {
        let envelope = SignalEnvelope::new(SignalType::Hangup, "a", serde_json::json!({}));
        let record = SignalRecord { path: "calls/bob/c1/candidates/0001".into(), envelope: envelope.clone() };
        assert_eq!(record.call_id(), Some("c1"));

        let record = SignalRecord { path: "presence/bob".into(), envelope };
        assert_eq!(record.call_id(), None);
    }

    #[test]
    fn test_fingerprint_ignores_timestamp() {
        let a = SignalEnvelope::new(SignalType::Offer, "alice", serde_json::json!({"sdp": "x"}));
        let mut b = a.clone();
        b.timestamp = b.timestamp + chrono::Duration::seconds(5);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = SignalEnvelope::new(SignalType::Answer, "alice", serde_json::json!({"sdp": "x"}));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[tokio::test]
    async fn test_listener_filters_self_and_redelivery() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = SignalingTransport::new(store.clone(), "alice");
        let bob = SignalingTransport::new(store.clone(), "bob");

        let recorder = Arc::new(Recorder::default());
        bob.start_listening(recorder.clone());

        let offer = SessionDescription::offer("v=0\r\n");
        alice.send_offer("bob", "c1", &offer).await.unwrap();
        alice.send_offer("bob", "c1", &offer).await.unwrap();
        // Written into bob's inbox but claiming to come from bob
        bob.send_offer("bob", "c2", &offer).await.unwrap();

        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", Some("0"), Some(0));
        alice.send_candidate("bob", "c1", &candidate).await.unwrap();
        settle().await;

        let received = recorder.received.lock().clone();
        assert_eq!(
            received,
            vec![
                ("offer:c1".to_string(), "alice".to_string()),
                ("candidate:c1".to_string(), "alice".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_clearing_inbox_forgets_call_fingerprints() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = SignalingTransport::new(store.clone(), "alice");
        let bob = SignalingTransport::new(store.clone(), "bob");

        let recorder = Arc::new(Recorder::default());
        bob.start_listening(recorder.clone());

        let offer = SessionDescription::offer("v=0\r\n");
        alice.send_offer("bob", "c1", &offer).await.unwrap();
        alice.send_offer("bob", "c2", &offer).await.unwrap();
        alice.send_hangup("bob", "c1", "local-hangup").await.unwrap();
        settle().await;
        assert_eq!(bob.tracked_calls(), 2);

        bob.clear_inbox("c1").await.unwrap();
        assert_eq!(bob.tracked_calls(), 1);

        bob.stop_listening();
        assert_eq!(bob.tracked_calls(), 0);
    }

    #[tokio::test]
    async fn test_hangup_reason_and_stop_listening() {
        let store = Arc::new(MemorySignalingStore::new());
        let alice = SignalingTransport::new(store.clone(), "alice");
        let bob = SignalingTransport::new(store.clone(), "bob");

        let recorder = Arc::new(Recorder::default());
        bob.start_listening(recorder.clone());
        alice.send_hangup("bob", "c9", "missed").await.unwrap();
        settle().await;
        assert_eq!(recorder.received.lock()[0], ("hangup:c9".to_string(), "missed".to_string()));

        bob.stop_listening();
        assert!(!bob.is_listening());
        alice.send_hangup("bob", "c10", "rejected").await.unwrap();
        settle().await;
        assert_eq!(recorder.received.lock().len(), 1);
    }
}
