//! In-process carrier transport
//!
//! [`ScriptedCarrierTransport`] registers, fails, connects and raises
//! incoming calls exactly as its [`ScriptedCarrierBehavior`] says, and records
//! every control action applied to its calls. No audio flows.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{CarrierCall, CarrierCallEvent, CarrierError, CarrierErrorCode, CarrierEvent, CarrierTransport};

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedCarrierBehavior {
    /// Registration fails with this code
    pub registration_error: Option<CarrierErrorCode>,
    pub registration_delay: Duration,
    /// Outbound calls are answered after `answer_delay`
    pub answers_outbound: bool,
    pub answer_delay: Duration,
}

impl Default for ScriptedCarrierBehavior {
    fn default() -> Self {
        Self {
            registration_error: None,
            registration_delay: Duration::from_millis(20),
            answers_outbound: true,
            answer_delay: Duration::from_millis(100),
        }
    }
}

impl ScriptedCarrierBehavior {
    pub fn failing(code: CarrierErrorCode) -> Self {
        Self { registration_error: Some(code), ..Default::default() }
    }

    pub fn with_registration_delay(mut self, delay: Duration) -> Self {
        self.registration_delay = delay;
        self
    }

    pub fn with_answer(mut self, answers: bool) -> Self {
        self.answers_outbound = answers;
        self
    }
}

pub struct ScriptedCarrierTransport {
    behavior: Mutex<ScriptedCarrierBehavior>,
    registered: AtomicBool,
    register_calls: AtomicUsize,
    events: broadcast::Sender<CarrierEvent>,
    calls: Mutex<Vec<Arc<ScriptedCarrierCall>>>,
}

impl ScriptedCarrierTransport {
    pub fn new() -> Self {
        Self::with_behavior(ScriptedCarrierBehavior::default())
    }

    pub fn with_behavior(behavior: ScriptedCarrierBehavior) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            behavior: Mutex::new(behavior),
            registered: AtomicBool::new(false),
            register_calls: AtomicUsize::new(0),
            events,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: ScriptedCarrierBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    /// Raise an inbound call from `from`
    pub fn simulate_incoming(&self, from: &str) -> Arc<ScriptedCarrierCall> {
        let call = Arc::new(ScriptedCarrierCall::new(from, true));
        self.calls.lock().push(call.clone());
        let _ = self.events.send(CarrierEvent::Incoming(call.clone()));
        call
    }

    /// Raise a transport-level error, as the SDK does on token expiry
    pub fn simulate_error(&self, code: CarrierErrorCode) {
        let _ = self.events.send(CarrierEvent::Error(CarrierError::new(code, "simulated")));
    }

    pub fn last_call(&self) -> Option<Arc<ScriptedCarrierCall>> {
        self.calls.lock().last().cloned()
    }
}

impl Default for ScriptedCarrierTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CarrierTransport for ScriptedCarrierTransport {
    async fn register(&self, _token: &str) -> Result<(), CarrierError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        tokio::time::sleep(behavior.registration_delay).await;

        if let Some(code) = behavior.registration_error {
            let error = CarrierError::new(code, "registration rejected");
            let _ = self.events.send(CarrierEvent::Error(error.clone()));
            return Err(error);
        }
        self.registered.store(true, Ordering::SeqCst);
        let _ = self.events.send(CarrierEvent::Registered);
        Ok(())
    }

    async fn unregister(&self) -> Result<(), CarrierError> {
        if self.registered.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(CarrierEvent::Unregistered);
        }
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    async fn connect(&self, target: &str) -> Result<Arc<dyn CarrierCall>, CarrierError> {
        if !self.is_registered() {
            return Err(CarrierError::new(CarrierErrorCode::Other("not-registered".into()), "device offline"));
        }
        let behavior = self.behavior.lock().clone();
        let call = Arc::new(ScriptedCarrierCall::new(target, false));
        self.calls.lock().push(call.clone());

        let _ = call.events.send(CarrierCallEvent::Ringing);
        if behavior.answers_outbound {
            let answering = call.clone();
            tokio::spawn(async move {
                tokio::time::sleep(behavior.answer_delay).await;
                answering.simulate_accepted();
            });
        }
        Ok(call)
    }

    fn subscribe(&self) -> broadcast::Receiver<CarrierEvent> {
        self.events.subscribe()
    }
}

pub struct ScriptedCarrierCall {
    id: String,
    remote: String,
    inbound: bool,
    muted: AtomicBool,
    held: AtomicBool,
    digits: Mutex<String>,
    actions: Mutex<Vec<String>>,
    events: broadcast::Sender<CarrierCallEvent>,
}

impl ScriptedCarrierCall {
    fn new(remote: &str, inbound: bool) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            id: format!("CA{}", Uuid::new_v4().simple()),
            remote: remote.to_string(),
            inbound,
            muted: AtomicBool::new(false),
            held: AtomicBool::new(false),
            digits: Mutex::new(String::new()),
            actions: Mutex::new(Vec::new()),
            events,
        }
    }

    fn record(&self, action: impl Into<String>) {
        self.actions.lock().push(action.into());
    }

    /// Control actions applied so far, in order
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    pub fn digits(&self) -> String {
        self.digits.lock().clone()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn simulate_accepted(&self) {
        let _ = self.events.send(CarrierCallEvent::Accepted);
    }

    pub fn simulate_remote_hangup(&self) {
        let _ = self.events.send(CarrierCallEvent::Disconnected);
    }

    pub fn simulate_cancel(&self) {
        let _ = self.events.send(CarrierCallEvent::Cancelled);
    }
}

#[async_trait]
impl CarrierCall for ScriptedCarrierCall {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }

    fn is_inbound(&self) -> bool {
        self.inbound
    }

    async fn accept(&self) -> Result<(), CarrierError> {
        self.record("accept");
        let _ = self.events.send(CarrierCallEvent::Accepted);
        Ok(())
    }

    async fn reject(&self) -> Result<(), CarrierError> {
        self.record("reject");
        let _ = self.events.send(CarrierCallEvent::Rejected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CarrierError> {
        self.record("disconnect");
        let _ = self.events.send(CarrierCallEvent::Disconnected);
        Ok(())
    }

    async fn mute(&self, muted: bool) -> Result<(), CarrierError> {
        self.record(if muted { "mute" } else { "unmute" });
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    async fn send_digits(&self, digits: &str) -> Result<(), CarrierError> {
        self.record(format!("digits:{digits}"));
        self.digits.lock().push_str(digits);
        Ok(())
    }

    async fn hold(&self, on_hold: bool) -> Result<(), CarrierError> {
        self.record(if on_hold { "hold" } else { "resume" });
        self.held.store(on_hold, Ordering::SeqCst);
        Ok(())
    }

    async fn transfer(&self, target: &str) -> Result<(), CarrierError> {
        self.record(format!("transfer:{target}"));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CarrierCallEvent> {
        self.events.subscribe()
    }
}
