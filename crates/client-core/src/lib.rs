//! # callbridge-client-core
//!
//! Dual-transport call orchestration. A client places and receives voice
//! calls over either a carrier-relayed telephony transport ("carrier mode")
//! or direct peer media negotiated by [`callbridge_session_core`] ("peer
//! mode"), and the orchestrator picks, boots and fails over between them.
//!
//! ```text
//! initialize ─> InitLifecycleManager ─> TokenService
//!                     │                      │
//!                     ├─ peer boot (mandatory)
//!                     └─ carrier boot (optional, non-fatal)
//!
//! place_call ─> RateLimiter ─> CallModeResolver ─> peer engine | carrier
//!                                   │
//!                                   └─ PhoneLookupService
//! ```
//!
//! [`CallOrchestrator`] is the facade; everything else is usable on its own.
//! Connection state changes are serialized through a
//! [`connection::TransitionQueue`] and every outcome is published as a
//! [`ClientEvent`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use callbridge_client_core::{ClientBuilder, ClientEvent};
//! use callbridge_session_core::loopback::{LoopbackPeerConnectionFactory, StaticMediaDevices};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = ClientBuilder::new()
//!     .api_base_url("https://api.example.com/v1/".parse()?)
//!     .peer_transport(
//!         Arc::new(LoopbackPeerConnectionFactory::new()),
//!         Arc::new(StaticMediaDevices::new()),
//!     )
//!     .build()
//!     .await?;
//!
//! let _subscription = orchestrator.subscribe(|event| {
//!     if let ClientEvent::IncomingCall { info } = event {
//!         println!("incoming call from {}", info.from);
//!     }
//! });
//!
//! let boot = orchestrator.initialize("session-credential", "alice").await?;
//! println!("ready in {} mode", boot.mode);
//!
//! orchestrator.place_call("bob").await?;
//! # Ok(())
//! # }
//! ```

pub mod carrier;
pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod lookup;
pub mod rate_limiter;
pub mod resolver;
pub mod single_flight;
pub mod token;

pub use carrier::{CarrierCall, CarrierCallEvent, CarrierError, CarrierErrorCode, CarrierEvent, CarrierTransport};
pub use client::{
    CallDirection, CallInfo, CallOrchestrator, CallRecorder, CallState, ClientBuilder, ClientConfig,
    OrchestratorStatus, RetryBudgetConfig, RetryConfig, TimeoutConfig,
};
pub use connection::{ConnectionState, TransitionQueue};
pub use error::{ClientError, ClientResult, ErrorCode, ErrorInfo, ErrorPolicy, Service};
pub use events::{ClientEvent, EventEmitter, IncomingCallInfo, Subscription};
pub use lifecycle::{
    BootHandle, BootResult, BootStage, BootStart, CallMode, InitLifecycleManager, LifecycleEvent, LifecycleState,
    RetryBudget, TransportKind, TransportState,
};
pub use logging::{setup_logging, LoggingConfig};
pub use lookup::{HttpLookupProvider, LookupConfig, LookupProvider, LookupResult, PhoneLookupService};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use resolver::{CallModeResolver, DestinationKind, TransportChoice, TransportSnapshot};
pub use single_flight::SingleFlight;
pub use token::{HttpTokenProvider, TokenProvider, TokenService, TransportToken};

/// Client-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
