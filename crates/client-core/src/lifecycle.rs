//! Initialization lifecycle
//!
//! [`InitLifecycleManager`] tracks the overall boot state
//! (`idle -> initializing -> initialized | error`) together with the
//! independent readiness of each transport, and derives the call mode from
//! the pair of transport states.
//!
//! A boot cycle is guarded by an [`AdvisoryLock`] and published through a
//! [`BootHandle`]: every caller that asks to boot while a cycle is running
//! gets a clone of the same handle and observes the same outcome. The handle
//! is resolved or rejected exactly once.
//!
//! Every state, stage, transport and mode change is emitted synchronously to
//! subscribers, in the order the changes were made.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, ClientResult};
use crate::events::{EventEmitter, Subscription};

/// Overall boot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Initializing,
    Initialized,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Error => "error",
        })
    }
}

/// Readiness of a single transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    Initializing,
    Ready,
    Failed,
    Disabled,
}

impl TransportState {
    pub fn is_ready(self) -> bool {
        self == TransportState::Ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Peer,
    Carrier,
}

/// Transport(s) available for calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Peer,
    Carrier,
    Dual,
    None,
}

impl CallMode {
    /// Mode implied by the pair of transport states
    pub fn from_states(peer: TransportState, carrier: TransportState) -> Self {
        match (peer.is_ready(), carrier.is_ready()) {
            (true, true) => CallMode::Dual,
            (false, true) => CallMode::Carrier,
            (true, false) => CallMode::Peer,
            (false, false) => CallMode::None,
        }
    }

    /// Individual transports this mode covers
    pub fn active_modes(self) -> Vec<CallMode> {
        match self {
            CallMode::Dual => vec![CallMode::Peer, CallMode::Carrier],
            CallMode::Peer => vec![CallMode::Peer],
            CallMode::Carrier => vec![CallMode::Carrier],
            CallMode::None => Vec::new(),
        }
    }

    pub fn has_peer(self) -> bool {
        matches!(self, CallMode::Peer | CallMode::Dual)
    }

    pub fn has_carrier(self) -> bool {
        matches!(self, CallMode::Carrier | CallMode::Dual)
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallMode::Peer => "peer",
            CallMode::Carrier => "carrier",
            CallMode::Dual => "dual",
            CallMode::None => "none",
        })
    }
}

/// Progress marker within a boot cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootStage {
    FetchingToken,
    InitializingPeer,
    InitializingCarrier,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub count: u32,
    pub max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }
}

/// Outcome of a successful boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootResult {
    pub mode: CallMode,
    pub identity: String,
    pub active_modes: Vec<CallMode>,
}

impl BootResult {
    pub fn new(mode: CallMode, identity: impl Into<String>) -> Self {
        Self { mode, identity: identity.into(), active_modes: mode.active_modes() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Single-owner, non-reentrant cooperative lock
#[derive(Debug, Default)]
pub struct AdvisoryLock {
    holder: Mutex<Option<LockInfo>>,
}

impl AdvisoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `owner`; fails with `LockBusy` if anyone holds it
    pub fn try_acquire(&self, owner: &str) -> ClientResult<()> {
        let mut holder = self.holder.lock();
        if let Some(current) = holder.as_ref() {
            return Err(ClientError::LockBusy { owner: current.owner.clone() });
        }
        *holder = Some(LockInfo { owner: owner.to_string(), acquired_at: Utc::now() });
        Ok(())
    }

    /// Release the lock if `owner` holds it
    pub fn release(&self, owner: &str) -> bool {
        let mut holder = self.holder.lock();
        match holder.as_ref() {
            Some(current) if current.owner == owner => {
                *holder = None;
                true
            }
            _ => false,
        }
    }

    pub fn holder(&self) -> Option<LockInfo> {
        self.holder.lock().clone()
    }

    pub fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }
}

type BootOutcome = Option<ClientResult<BootResult>>;

/// Shared view of a boot cycle's outcome
#[derive(Debug, Clone)]
pub struct BootHandle {
    rx: watch::Receiver<BootOutcome>,
}

impl BootHandle {
    fn pair() -> (watch::Sender<BootOutcome>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Wait for the boot cycle to resolve or reject
    pub async fn wait(&self) -> ClientResult<BootResult> {
        let mut rx = self.rx.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(outcome) = current.as_ref() {
                    return outcome.clone();
                }
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or(Err(ClientError::BootCancelled));
            }
        }
    }

    /// Outcome if the cycle already finished
    pub fn outcome(&self) -> Option<ClientResult<BootResult>> {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Result of asking the lifecycle to boot
#[derive(Debug, Clone)]
pub enum BootStart {
    /// A new cycle began; the caller drives it
    Started(BootHandle),
    /// A cycle is already running; wait on its handle
    InFlight(BootHandle),
    /// Boot already completed
    Completed(BootResult),
}

impl BootStart {
    pub fn handle(&self) -> Option<&BootHandle> {
        match self {
            BootStart::Started(handle) | BootStart::InFlight(handle) => Some(handle),
            BootStart::Completed(_) => None,
        }
    }

    /// Wait for the outcome regardless of variant
    pub async fn wait(&self) -> ClientResult<BootResult> {
        match self {
            BootStart::Started(handle) | BootStart::InFlight(handle) => handle.wait().await,
            BootStart::Completed(result) => Ok(result.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged { from: LifecycleState, to: LifecycleState },
    StageChanged { stage: BootStage },
    TransportChanged { kind: TransportKind, state: TransportState, error: Option<String> },
    ModeChanged { from: CallMode, to: CallMode },
    RetryScheduled { attempt: u32, max: u32 },
}

struct Inner {
    state: LifecycleState,
    stage: Option<BootStage>,
    peer: TransportState,
    carrier: TransportState,
    mode: CallMode,
    budget: RetryBudget,
    last_error: Option<ClientError>,
    boot: Option<(watch::Sender<BootOutcome>, BootHandle)>,
    boot_owner: Option<String>,
    result: Option<BootResult>,
}

impl Inner {
    fn set_state(&mut self, to: LifecycleState, events: &mut Vec<LifecycleEvent>) {
        let from = self.state;
        if from != to {
            self.state = to;
            events.push(LifecycleEvent::StateChanged { from, to });
        }
    }

    fn set_transport(
        &mut self,
        kind: TransportKind,
        state: TransportState,
        error: Option<String>,
        events: &mut Vec<LifecycleEvent>,
    ) {
        match kind {
            TransportKind::Peer => self.peer = state,
            TransportKind::Carrier => self.carrier = state,
        }
        events.push(LifecycleEvent::TransportChanged { kind, state, error });

        let mode = CallMode::from_states(self.peer, self.carrier);
        if mode != self.mode {
            events.push(LifecycleEvent::ModeChanged { from: self.mode, to: mode });
            self.mode = mode;
        }
    }

    fn finish_boot(&mut self, outcome: ClientResult<BootResult>) -> Option<String> {
        if let Some((tx, _)) = self.boot.take() {
            tx.send_replace(Some(outcome));
        }
        self.boot_owner.take()
    }

    /// Check that a failed cycle may be retried; returns whether the retry
    /// draws from the budget
    fn retry_charge(&self) -> ClientResult<bool> {
        if self.state != LifecycleState::Error {
            return Err(ClientError::NotRetryable {
                reason: format!("lifecycle is {}", self.state),
            });
        }
        let policy = match self.last_error.as_ref() {
            Some(error) if error.code().policy().retryable => error.code().policy(),
            Some(error) => {
                return Err(ClientError::NotRetryable {
                    reason: format!("{} is not retryable", error),
                })
            }
            None => return Err(ClientError::NotRetryable { reason: "no recorded failure".to_string() }),
        };
        if policy.counts_against_budget && self.budget.is_exhausted() {
            return Err(ClientError::NotRetryable {
                reason: format!("retry budget exhausted ({}/{})", self.budget.count, self.budget.max),
            });
        }
        Ok(policy.counts_against_budget)
    }
}

/// Process-wide boot state machine, constructed and owned by the orchestrator
pub struct InitLifecycleManager {
    inner: Mutex<Inner>,
    lock: AdvisoryLock,
    events: EventEmitter<LifecycleEvent>,
    // Held across mutation and emission so observers see changes in order
    emit_order: ReentrantMutex<()>,
}

impl InitLifecycleManager {
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Idle,
                stage: None,
                peer: TransportState::Idle,
                carrier: TransportState::Idle,
                mode: CallMode::None,
                budget: RetryBudget::new(max_retries),
                last_error: None,
                boot: None,
                boot_owner: None,
                result: None,
            }),
            lock: AdvisoryLock::new(),
            events: EventEmitter::new(),
            emit_order: ReentrantMutex::new(()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe_channel()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn stage(&self) -> Option<BootStage> {
        self.inner.lock().stage
    }

    pub fn mode(&self) -> CallMode {
        self.inner.lock().mode
    }

    pub fn transport_state(&self, kind: TransportKind) -> TransportState {
        let inner = self.inner.lock();
        match kind {
            TransportKind::Peer => inner.peer,
            TransportKind::Carrier => inner.carrier,
        }
    }

    pub fn retry_budget(&self) -> RetryBudget {
        self.inner.lock().budget
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.inner.lock().last_error.clone()
    }

    /// The boot lock; held for the duration of each boot cycle
    pub fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }

    /// Handle of the running cycle, if any
    pub fn current_handle(&self) -> Option<BootHandle> {
        self.inner.lock().boot.as_ref().map(|(_, handle)| handle.clone())
    }

    pub fn result(&self) -> Option<BootResult> {
        self.inner.lock().result.clone()
    }

    fn with_events<T>(&self, f: impl FnOnce(&mut Inner, &mut Vec<LifecycleEvent>) -> T) -> T {
        let _order = self.emit_order.lock();
        let mut events = Vec::new();
        let out = {
            let mut inner = self.inner.lock();
            f(&mut inner, &mut events)
        };
        for event in events {
            debug!(?event, "lifecycle event");
            self.events.emit(event);
        }
        out
    }

    /// Begin a boot cycle, or join the one already running
    ///
    /// A failed lifecycle refuses a fresh start with `InvalidState`; the
    /// next cycle after an error goes through [`retry`](Self::retry) so the
    /// error policy and retry budget apply.
    pub fn start_boot(&self) -> ClientResult<BootStart> {
        self.begin_cycle(false)
    }

    fn begin_cycle(&self, retrying: bool) -> ClientResult<BootStart> {
        self.with_events(|inner, events| {
            let charge = if retrying {
                Some(inner.retry_charge()?)
            } else {
                match inner.state {
                    LifecycleState::Initialized => {
                        let result = inner.result.clone().ok_or_else(|| {
                            ClientError::internal_error("initialized lifecycle has no boot result")
                        })?;
                        return Ok(BootStart::Completed(result));
                    }
                    LifecycleState::Initializing => {
                        if let Some((_, handle)) = inner.boot.as_ref() {
                            return Ok(BootStart::InFlight(handle.clone()));
                        }
                        return Err(ClientError::internal_error("boot in progress without a handle"));
                    }
                    LifecycleState::Error => {
                        return Err(ClientError::InvalidState {
                            operation: "start a boot cycle without retry".to_string(),
                            state: inner.state.to_string(),
                        });
                    }
                    LifecycleState::Idle => {}
                }
                None
            };

            let owner = format!("boot-{}", Uuid::new_v4());
            self.lock.try_acquire(&owner)?;

            if let Some(counts_against_budget) = charge {
                if counts_against_budget {
                    inner.budget.count += 1;
                }
                events.push(LifecycleEvent::RetryScheduled { attempt: inner.budget.count, max: inner.budget.max });
            }

            let (tx, handle) = BootHandle::pair();
            inner.boot = Some((tx, handle.clone()));
            inner.boot_owner = Some(owner.clone());
            inner.stage = None;
            inner.last_error = None;
            inner.result = None;
            for kind in [TransportKind::Peer, TransportKind::Carrier] {
                let current = match kind {
                    TransportKind::Peer => inner.peer,
                    TransportKind::Carrier => inner.carrier,
                };
                if current != TransportState::Idle {
                    inner.set_transport(kind, TransportState::Idle, None, events);
                }
            }
            inner.set_state(LifecycleState::Initializing, events);

            info!(owner = %owner, attempt = inner.budget.count, "boot cycle started");
            Ok(BootStart::Started(handle))
        })
    }

    /// Report progress within the running cycle
    pub fn update_stage(&self, stage: BootStage) -> ClientResult<()> {
        self.with_events(|inner, events| {
            if inner.state != LifecycleState::Initializing {
                return Err(ClientError::InvalidState {
                    operation: "update stage".to_string(),
                    state: inner.state.to_string(),
                });
            }
            inner.stage = Some(stage);
            events.push(LifecycleEvent::StageChanged { stage });
            Ok(())
        })
    }

    /// Record a transport's readiness and return the recomputed mode
    ///
    /// Accepted in any lifecycle state. Updates racing a terminal
    /// `complete_boot`/`fail_boot` still land, so callers should check the
    /// returned mode before relying on it.
    pub fn update_transport_state(
        &self,
        kind: TransportKind,
        state: TransportState,
        error: Option<String>,
    ) -> CallMode {
        if let Some(reason) = error.as_deref() {
            warn!(?kind, ?state, error = %reason, "transport state changed with error");
        }
        self.with_events(|inner, events| {
            inner.set_transport(kind, state, error, events);
            inner.mode
        })
    }

    /// Resolve the running cycle
    pub fn complete_boot(&self, result: BootResult) -> ClientResult<()> {
        self.with_events(|inner, events| {
            if inner.state != LifecycleState::Initializing {
                return Err(ClientError::InvalidState {
                    operation: "complete boot".to_string(),
                    state: inner.state.to_string(),
                });
            }
            inner.budget.count = 0;
            inner.last_error = None;
            inner.stage = None;
            inner.result = Some(result.clone());
            if let Some(owner) = inner.finish_boot(Ok(result.clone())) {
                self.lock.release(&owner);
            }
            inner.set_state(LifecycleState::Initialized, events);
            info!(mode = %result.mode, identity = %result.identity, "boot completed");
            Ok(())
        })
    }

    /// Reject the running cycle, leaving the retry budget evaluable
    pub fn fail_boot(&self, error: ClientError) -> ClientResult<()> {
        self.with_events(|inner, events| {
            if inner.state != LifecycleState::Initializing {
                return Err(ClientError::InvalidState {
                    operation: "fail boot".to_string(),
                    state: inner.state.to_string(),
                });
            }
            inner.last_error = Some(error.clone());
            inner.stage = None;
            if let Some(owner) = inner.finish_boot(Err(error.clone())) {
                self.lock.release(&owner);
            }
            inner.set_state(LifecycleState::Error, events);
            tracing::error!(error = %error, code = ?error.code(), "boot failed");
            Ok(())
        })
    }

    /// Start another cycle after a failure, if policy and budget allow
    pub fn retry(&self) -> ClientResult<BootStart> {
        self.begin_cycle(true)
    }

    /// Return to idle from any state
    ///
    /// Clears the retry count and both transport states. A running cycle's
    /// handle is rejected with `BootCancelled`.
    pub fn reset(&self) {
        self.with_events(|inner, events| {
            if let Some(owner) = inner.finish_boot(Err(ClientError::BootCancelled)) {
                self.lock.release(&owner);
            }
            inner.budget.count = 0;
            inner.stage = None;
            inner.last_error = None;
            inner.result = None;
            if inner.peer != TransportState::Idle {
                inner.set_transport(TransportKind::Peer, TransportState::Idle, None, events);
            }
            if inner.carrier != TransportState::Idle {
                inner.set_transport(TransportKind::Carrier, TransportState::Idle, None, events);
            }
            inner.set_state(LifecycleState::Idle, events);
        });
        debug!("lifecycle reset");
    }
}

impl fmt::Debug for InitLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InitLifecycleManager")
            .field("state", &inner.state)
            .field("mode", &inner.mode)
            .field("budget", &inner.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn started(start: ClientResult<BootStart>) -> BootHandle {
        match start {
            Ok(BootStart::Started(handle)) => handle,
            other => panic!("expected a new boot cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_mode_from_states() {
        use TransportState::*;
        assert_eq!(CallMode::from_states(Ready, Ready), CallMode::Dual);
        assert_eq!(CallMode::from_states(Failed, Ready), CallMode::Carrier);
        assert_eq!(CallMode::from_states(Ready, Disabled), CallMode::Peer);
        assert_eq!(CallMode::from_states(Initializing, Idle), CallMode::None);
        assert_eq!(CallMode::Dual.active_modes(), vec![CallMode::Peer, CallMode::Carrier]);
    }

    #[tokio::test]
    async fn test_concurrent_start_shares_handle() {
        let lifecycle = InitLifecycleManager::new(3);
        let handle = started(lifecycle.start_boot());

        let joined = match lifecycle.start_boot().unwrap() {
            BootStart::InFlight(handle) => handle,
            other => panic!("expected in-flight, got {other:?}"),
        };

        lifecycle.complete_boot(BootResult::new(CallMode::Peer, "alice")).unwrap();

        let a = handle.wait().await.unwrap();
        let b = joined.wait().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.active_modes, vec![CallMode::Peer]);
        assert!(!lifecycle.lock().is_held());

        match lifecycle.start_boot().unwrap() {
            BootStart::Completed(result) => assert_eq!(result.identity, "alice"),
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn test_start_fails_when_lock_is_held_externally() {
        let lifecycle = InitLifecycleManager::new(3);
        lifecycle.lock().try_acquire("shutdown").unwrap();

        let err = lifecycle.start_boot().unwrap_err();
        assert!(matches!(err, ClientError::LockBusy { ref owner } if owner == "shutdown"));
        assert_eq!(lifecycle.state(), LifecycleState::Idle);
    }

    #[test]
    fn test_lock_is_not_reentrant() {
        let lock = AdvisoryLock::new();
        lock.try_acquire("a").unwrap();
        assert!(lock.try_acquire("a").is_err());
        assert!(!lock.release("b"));
        assert!(lock.release("a"));
        assert!(lock.holder().is_none());
    }

    #[test]
    fn test_stage_only_while_initializing() {
        let lifecycle = InitLifecycleManager::new(3);
        assert!(matches!(
            lifecycle.update_stage(BootStage::FetchingToken),
            Err(ClientError::InvalidState { .. })
        ));
        started(lifecycle.start_boot());
        lifecycle.update_stage(BootStage::FetchingToken).unwrap();
        assert_eq!(lifecycle.stage(), Some(BootStage::FetchingToken));
    }

    #[tokio::test]
    async fn test_fail_boot_rejects_once_and_releases_lock() {
        let lifecycle = InitLifecycleManager::new(3);
        let handle = started(lifecycle.start_boot());

        lifecycle.fail_boot(ClientError::network_error("offline")).unwrap();
        assert!(lifecycle.fail_boot(ClientError::network_error("again")).is_err());
        assert!(lifecycle.complete_boot(BootResult::new(CallMode::Peer, "a")).is_err());

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ClientError::NetworkError { ref reason } if reason == "offline"));
        assert_eq!(lifecycle.state(), LifecycleState::Error);
        assert!(!lifecycle.lock().is_held());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_fail_boot_logs_error_code() {
        let lifecycle = InitLifecycleManager::new(3);
        started(lifecycle.start_boot());
        lifecycle.fail_boot(ClientError::network_error("offline")).unwrap();
        assert!(logs_contain("boot failed"));
        assert!(logs_contain("Network"));
    }

    #[test]
    fn test_retry_consumes_budget_until_exhausted() {
        let lifecycle = InitLifecycleManager::new(3);
        started(lifecycle.start_boot());
        lifecycle.fail_boot(ClientError::network_error("offline")).unwrap();

        for attempt in 1..=3 {
            started(lifecycle.retry());
            assert_eq!(lifecycle.retry_budget().count, attempt);
            lifecycle.fail_boot(ClientError::network_error("offline")).unwrap();
        }

        let err = lifecycle.retry().unwrap_err();
        assert!(matches!(err, ClientError::NotRetryable { .. }));
        assert_eq!(lifecycle.state(), LifecycleState::Error);
        assert!(lifecycle.current_handle().is_none());
    }

    #[test]
    fn test_retry_refuses_fatal_errors() {
        let lifecycle = InitLifecycleManager::new(3);
        started(lifecycle.start_boot());
        lifecycle.fail_boot(ClientError::Unauthorized { reason: "expired".into() }).unwrap();

        assert!(matches!(lifecycle.retry(), Err(ClientError::NotRetryable { .. })));
        assert_eq!(lifecycle.retry_budget().count, 0);
    }

    #[test]
    fn test_start_refuses_failed_lifecycle() {
        let lifecycle = InitLifecycleManager::new(3);
        started(lifecycle.start_boot());
        lifecycle.fail_boot(ClientError::Unauthorized { reason: "expired".into() }).unwrap();

        let err = lifecycle.start_boot().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { ref state, .. } if state == "error"));
        assert_eq!(lifecycle.state(), LifecycleState::Error);
        assert!(lifecycle.current_handle().is_none());
        assert!(!lifecycle.lock().is_held());
    }

    #[test]
    fn test_retry_blocked_by_lock_keeps_budget() {
        let lifecycle = InitLifecycleManager::new(3);
        started(lifecycle.start_boot());
        lifecycle.fail_boot(ClientError::network_error("offline")).unwrap();
        lifecycle.lock().try_acquire("shutdown").unwrap();

        let err = lifecycle.retry().unwrap_err();
        assert!(matches!(err, ClientError::LockBusy { ref owner } if owner == "shutdown"));
        assert_eq!(lifecycle.retry_budget().count, 0);
        assert_eq!(lifecycle.state(), LifecycleState::Error);

        assert!(lifecycle.lock().release("shutdown"));
        started(lifecycle.retry());
        assert_eq!(lifecycle.retry_budget().count, 1);
    }

    #[test]
    fn test_retry_requires_error_state() {
        let lifecycle = InitLifecycleManager::new(3);
        assert!(matches!(lifecycle.retry(), Err(ClientError::NotRetryable { .. })));
    }

    #[test]
    fn test_rate_limited_failure_does_not_consume_budget() {
        let lifecycle = InitLifecycleManager::new(3);
        started(lifecycle.start_boot());
        lifecycle
            .fail_boot(ClientError::RateLimited { retry_after: std::time::Duration::from_secs(1) })
            .unwrap();
        started(lifecycle.retry());
        assert_eq!(lifecycle.retry_budget().count, 0);
    }

    #[tokio::test]
    async fn test_reset_cancels_pending_handle() {
        let lifecycle = InitLifecycleManager::new(3);
        let handle = started(lifecycle.start_boot());
        lifecycle.update_transport_state(TransportKind::Peer, TransportState::Ready, None);

        lifecycle.reset();

        assert!(matches!(handle.wait().await, Err(ClientError::BootCancelled)));
        assert_eq!(lifecycle.state(), LifecycleState::Idle);
        assert_eq!(lifecycle.mode(), CallMode::None);
        assert_eq!(lifecycle.transport_state(TransportKind::Peer), TransportState::Idle);
        assert!(!lifecycle.lock().is_held());
    }

    #[test]
    fn test_events_are_ordered() {
        let lifecycle = InitLifecycleManager::new(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = lifecycle.subscribe(move |event| sink.lock().push(event.clone()));

        started(lifecycle.start_boot());
        lifecycle.update_stage(BootStage::InitializingPeer).unwrap();
        lifecycle.update_transport_state(TransportKind::Peer, TransportState::Ready, None);
        lifecycle.complete_boot(BootResult::new(CallMode::Peer, "alice")).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                LifecycleEvent::StateChanged { from: LifecycleState::Idle, to: LifecycleState::Initializing },
                LifecycleEvent::StageChanged { stage: BootStage::InitializingPeer },
                LifecycleEvent::TransportChanged {
                    kind: TransportKind::Peer,
                    state: TransportState::Ready,
                    error: None
                },
                LifecycleEvent::ModeChanged { from: CallMode::None, to: CallMode::Peer },
                LifecycleEvent::StateChanged {
                    from: LifecycleState::Initializing,
                    to: LifecycleState::Initialized
                },
            ]
        );
    }

    #[test]
    fn test_listener_may_reenter_manager() {
        let lifecycle = Arc::new(InitLifecycleManager::new(3));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&lifecycle);
        let sink = observed.clone();
        let _sub = lifecycle.subscribe(move |_| {
            if let Some(lifecycle) = weak.upgrade() {
                sink.lock().push(lifecycle.state());
            }
        });

        started(lifecycle.start_boot());
        assert_eq!(*observed.lock(), vec![LifecycleState::Initializing]);
    }
}
