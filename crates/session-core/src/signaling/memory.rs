//! In-process signaling store
//!
//! Lets two engines in the same process call each other, and backs the
//! signaling tests. Subscribers get a replay of matching entries in write
//! order, then every later write.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{SignalEnvelope, SignalRecord, SignalingStore};
use crate::error::SessionResult;

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<SignalRecord>,
}

#[derive(Default)]
struct Inner {
    /// path -> (write sequence, envelope)
    entries: HashMap<String, (u64, SignalEnvelope)>,
    subscribers: Vec<Subscriber>,
    sequence: u64,
}

impl Inner {
    fn write(&mut self, path: String, envelope: SignalEnvelope) {
        self.sequence += 1;
        let record = SignalRecord { path: path.clone(), envelope: envelope.clone() };
        self.entries.insert(path, (self.sequence, envelope));

        // Closed receivers are pruned here
        self.subscribers.retain(|sub| {
            if record.path.starts_with(&sub.prefix) {
                sub.tx.send(record.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
    }
}

#[derive(Default)]
pub struct MemorySignalingStore {
    inner: Mutex<Inner>,
}

impl MemorySignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<SignalEnvelope> {
        self.inner.lock().entries.get(path).map(|(_, envelope)| envelope.clone())
    }

    /// Paths at or below `prefix`, in write order
    pub fn paths(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut matching: Vec<_> = inner
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, (seq, _))| (*seq, path.clone()))
            .collect();
        matching.sort();
        matching.into_iter().map(|(_, path)| path).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|sub| !sub.tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn set(&self, path: &str, envelope: SignalEnvelope) -> SessionResult<()> {
        self.inner.lock().write(path.to_string(), envelope);
        Ok(())
    }

    async fn push(&self, parent: &str, envelope: SignalEnvelope) -> SessionResult<String> {
        let mut inner = self.inner.lock();
        let path = format!("{parent}/{:012}", inner.sequence + 1);
        inner.write(path.clone(), envelope);
        Ok(path)
    }

    async fn remove(&self, path: &str) -> SessionResult<()> {
        let children = format!("{path}/");
        self.inner
            .lock()
            .entries
            .retain(|key, _| key != path && !key.starts_with(&children));
        Ok(())
    }

    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<SignalRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        let mut existing: Vec<_> = inner
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, (seq, envelope))| (*seq, path.clone(), envelope.clone()))
            .collect();
        existing.sort_by_key(|(seq, _, _)| *seq);
        for (_, path, envelope) in existing {
            let _ = tx.send(SignalRecord { path, envelope });
        }

        inner.subscribers.push(Subscriber { prefix: prefix.to_string(), tx });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalType;

    fn envelope(from: &str) -> SignalEnvelope {
        SignalEnvelope::new(SignalType::Candidate, from, serde_json::json!({"candidate": from}))
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_streams() {
        let store = MemorySignalingStore::new();
        store.set("calls/bob/c1", envelope("first")).await.unwrap();
        store.set("calls/carol/c2", envelope("other")).await.unwrap();

        let mut rx = store.subscribe("calls/bob/");
        let replayed = rx.recv().await.unwrap();
        assert_eq!(replayed.path, "calls/bob/c1");

        let pushed = store.push("calls/bob/c1/candidates", envelope("second")).await.unwrap();
        let live = rx.recv().await.unwrap();
        assert_eq!(live.path, pushed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_clears_children() {
        let store = MemorySignalingStore::new();
        store.set("calls/bob/c1", envelope("a")).await.unwrap();
        store.push("calls/bob/c1/candidates", envelope("b")).await.unwrap();
        store.set("calls/bob/c10", envelope("c")).await.unwrap();

        store.remove("calls/bob/c1").await.unwrap();
        assert_eq!(store.paths("calls/bob/"), vec!["calls/bob/c10".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_unsubscribes() {
        let store = MemorySignalingStore::new();
        let rx = store.subscribe("calls/bob/");
        assert_eq!(store.subscriber_count(), 1);
        drop(rx);
        store.set("calls/bob/c1", envelope("a")).await.unwrap();
        assert_eq!(store.subscriber_count(), 0);
    }
}
