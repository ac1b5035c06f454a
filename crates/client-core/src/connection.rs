//! Orchestrator connection state and its transition queue
//!
//! Connection state is never written directly. Producers call
//! [`TransitionQueue::request`], which enqueues and returns immediately; a
//! single consumer task applies requests in FIFO order and notifies the
//! observer after each applied change. Requests that would not change the
//! state are dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Initializing,
    Ready,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        })
    }
}

enum Command {
    Transition(ConnectionState),
    Flush(oneshot::Sender<()>),
}

/// Observer invoked by the consumer task with `(from, to)`
pub type TransitionObserver = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

pub struct TransitionQueue {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    consumer: JoinHandle<()>,
}

impl TransitionQueue {
    /// Spawn the consumer task; must be called within a Tokio runtime
    pub fn new(initial: ConnectionState, observer: TransitionObserver) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let (state_tx, state) = watch::channel(initial);

        let consumer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Transition(to) => {
                        let from = *state_tx.borrow();
                        if from == to {
                            trace!(state = %to, "Skipping no-op connection transition");
                            continue;
                        }
                        state_tx.send_replace(to);
                        debug!(%from, %to, "Connection state changed");
                        observer(from, to);
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, state, consumer }
    }

    /// Enqueue a transition; never blocks
    pub fn request(&self, to: ConnectionState) {
        if self.tx.send(Command::Transition(to)).is_err() {
            debug!(state = %to, "Transition queue closed, dropping request");
        }
    }

    /// Wait until every request enqueued before this call has been applied
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Most recently applied state
    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for TransitionQueue {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording() -> (Arc<Mutex<Vec<(ConnectionState, ConnectionState)>>>, TransitionObserver) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, Box::new(move |from, to| sink.lock().push((from, to))))
    }

    #[tokio::test]
    async fn test_transitions_apply_in_request_order() {
        use ConnectionState::*;
        let (log, observer) = recording();
        let queue = TransitionQueue::new(Idle, observer);

        queue.request(Initializing);
        queue.request(Ready);
        queue.request(Ready);
        queue.request(Connecting);
        queue.request(Connected);
        queue.flush().await;

        assert_eq!(
            *log.lock(),
            vec![(Idle, Initializing), (Initializing, Ready), (Ready, Connecting), (Connecting, Connected)]
        );
        assert_eq!(queue.current(), Connected);
    }

    #[tokio::test]
    async fn test_concurrent_producers_are_serialized() {
        let (log, observer) = recording();
        let queue = Arc::new(TransitionQueue::new(ConnectionState::Idle, observer));

        let mut producers = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                queue.request(ConnectionState::Connecting);
                queue.request(ConnectionState::Connected);
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        queue.flush().await;

        let log = log.lock();
        for pair in log.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "observer saw a gap: {log:?}");
        }
        assert_eq!(queue.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_watch_reflects_applied_state() {
        let (_log, observer) = recording();
        let queue = TransitionQueue::new(ConnectionState::Idle, observer);
        let mut watch = queue.watch();

        queue.request(ConnectionState::Failed);
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow(), ConnectionState::Failed);
    }
}
