//! Event handling for client-core operations
//!
//! Two pieces live here:
//!
//! - [`EventEmitter`], a typed publish/subscribe hub. Listeners are invoked
//!   synchronously, in emission order, and every registration returns a
//!   [`Subscription`] that can be individually revoked. Async consumers can
//!   take a broadcast receiver instead via [`EventEmitter::subscribe_channel`].
//! - [`ClientEvent`], the events the orchestrator raises for the UI layer.
//!
//! # Usage
//!
//! ```rust
//! use callbridge_client_core::events::EventEmitter;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let emitter: EventEmitter<u32> = EventEmitter::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//!
//! let counter = seen.clone();
//! let subscription = emitter.subscribe(move |value| {
//!     counter.fetch_add(*value as usize, Ordering::SeqCst);
//! });
//!
//! emitter.emit(2);
//! subscription.unsubscribe();
//! emitter.emit(5);
//!
//! assert_eq!(seen.load(Ordering::SeqCst), 2);
//! assert_eq!(emitter.listener_count(), 0);
//! ```

use std::sync::{Arc, Weak};

use callbridge_session_core::{ConnectionQuality, EndReason};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::client::types::{CallState, OrchestratorStatus};
use crate::connection::ConnectionState;
use crate::error::{ClientError, ErrorInfo, Service};
use crate::lifecycle::{BootStage, CallMode, LifecycleState};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerList<E> {
    listeners: RwLock<Vec<(Uuid, Listener<E>)>>,
}

/// Typed publish/subscribe hub with revocable subscriptions
pub struct EventEmitter<E> {
    shared: Arc<ListenerList<E>>,
    channel: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create an emitter whose broadcast channel buffers `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(ListenerList { listeners: RwLock::new(Vec::new()) }),
            channel,
        }
    }

    /// Register a synchronous listener
    ///
    /// The listener runs on the emitting task, so it must not block.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.shared.listeners.write().push((id, Arc::new(listener)));

        let weak: Weak<ListenerList<E>> = Arc::downgrade(&self.shared);
        Subscription::new(id, move || {
            if let Some(shared) = weak.upgrade() {
                shared.listeners.write().retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    /// Receive events through a broadcast channel
    pub fn subscribe_channel(&self) -> broadcast::Receiver<E> {
        self.channel.subscribe()
    }

    /// Deliver an event to every listener, then to channel subscribers
    pub fn emit(&self, event: E) {
        // Snapshot so a listener may unsubscribe itself during delivery
        let listeners: Vec<Listener<E>> =
            self.shared.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&event);
        }
        let _ = self.channel.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.read().len()
    }
}

impl<E: Clone + Send + 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle that revokes a listener registration
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: Uuid,
    revoke: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(id: Uuid, revoke: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { id, revoke: Some(Box::new(revoke)) }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unsubscribe(mut self) {
        if let Some(revoke) = self.revoke.take() {
            revoke();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Information about an incoming call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallInfo {
    pub call_id: String,
    /// Caller identity (peer mode) or caller number (carrier mode)
    pub from: String,
    pub mode: CallMode,
    pub received_at: DateTime<Utc>,
}

/// Events raised by the orchestrator for the UI layer
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Orchestrator status snapshot changed
    StatusChanged { status: OrchestratorStatus },

    /// The active call moved to a new state
    CallStateChanged { call_id: String, state: CallState, mode: CallMode },

    IncomingCall { info: IncomingCallInfo },

    CallEnded { call_id: String, reason: EndReason, mode: CallMode },

    /// An error surfaced by a transport or operation
    ///
    /// `non_fatal` errors are informational: the orchestrator kept running,
    /// for example when carrier boot failed but peer mode came up.
    Error {
        error: ClientError,
        info: ErrorInfo,
        service: Option<Service>,
        non_fatal: bool,
    },

    LocalStream { call_id: String, stream_id: String },

    RemoteStream { call_id: String, stream_id: String },

    RecordingStarted { call_id: String },

    RecordingStopped { call_id: String },

    RecordingError { call_id: String, reason: String },

    ConnectionStateChanged { from: ConnectionState, to: ConnectionState },

    ConnectionQuality { call_id: String, quality: ConnectionQuality },

    InitializationChanged { state: LifecycleState, stage: Option<BootStage> },
}

impl ClientEvent {
    /// Build an error event with its display info attached
    pub fn error(error: ClientError, service: Option<Service>, non_fatal: bool) -> Self {
        let info = error.user_info();
        ClientEvent::Error { error, info, service, non_fatal }
    }

    /// Call this event relates to, if any
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ClientEvent::CallStateChanged { call_id, .. }
            | ClientEvent::CallEnded { call_id, .. }
            | ClientEvent::LocalStream { call_id, .. }
            | ClientEvent::RemoteStream { call_id, .. }
            | ClientEvent::RecordingStarted { call_id }
            | ClientEvent::RecordingStopped { call_id }
            | ClientEvent::RecordingError { call_id, .. }
            | ClientEvent::ConnectionQuality { call_id, .. } => Some(call_id),
            ClientEvent::IncomingCall { info } => Some(&info.call_id),
            _ => None,
        }
    }
}
