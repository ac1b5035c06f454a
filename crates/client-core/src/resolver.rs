//! Per-destination transport selection
//!
//! [`CallModeResolver::resolve`] maps a destination and a snapshot of
//! transport readiness to the transport a call should use:
//!
//! | Destination | Decision order |
//! |-------------|----------------|
//! | peer identity | peer if ready, carrier if ready, one brief recheck while peer is initializing, then peer as a last resort if the runtime supports it |
//! | phone number | carrier if ready; with only peer ready, a reverse lookup decides between peer and `RecipientNotFound` |
//! | anything else | peer if the runtime supports it |
//!
//! Resolution reads transport state but never changes it. With
//! `strict` set, the last-resort peer attempt for peer identities is
//! disabled and resolution fails with `NoModeAvailable` instead.
//! Unrecognized destinations are unaffected.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::lifecycle::{CallMode, TransportState};
use crate::lookup::{normalize_phone, PhoneLookupService};

static PEER_IDENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]{0,63}$").expect("valid identity pattern"));

static PHONE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 ().-]*$").expect("valid phone pattern"));

/// Shape of a dialed destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    PeerIdentity,
    PhoneNumber,
    Unrecognized,
}

impl DestinationKind {
    pub fn classify(destination: &str) -> Self {
        let destination = destination.trim();
        if PEER_IDENTITY.is_match(destination) {
            return DestinationKind::PeerIdentity;
        }
        if PHONE_NUMBER.is_match(destination) {
            let digits = destination.chars().filter(|c| c.is_ascii_digit()).count();
            if (7..=15).contains(&digits) {
                return DestinationKind::PhoneNumber;
            }
        }
        DestinationKind::Unrecognized
    }
}

/// Transport readiness as seen by one resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub peer: TransportState,
    pub carrier: TransportState,
    /// The runtime can host peer media at all
    pub peer_supported: bool,
}

impl TransportSnapshot {
    pub fn peer_ready(&self) -> bool {
        self.peer.is_ready()
    }

    pub fn carrier_ready(&self) -> bool {
        self.carrier.is_ready()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportChoice {
    /// Call a peer identity; `resolved_from` holds the dialed number when a
    /// lookup produced the identity
    Peer { identity: String, resolved_from: Option<String> },
    Carrier { target: String },
}

impl TransportChoice {
    pub fn mode(&self) -> CallMode {
        match self {
            TransportChoice::Peer { .. } => CallMode::Peer,
            TransportChoice::Carrier { .. } => CallMode::Carrier,
        }
    }

    fn peer(identity: &str) -> Self {
        TransportChoice::Peer { identity: identity.to_string(), resolved_from: None }
    }
}

impl fmt::Display for TransportChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportChoice::Peer { identity, .. } => write!(f, "peer:{identity}"),
            TransportChoice::Carrier { target } => write!(f, "carrier:{target}"),
        }
    }
}

/// Source of a fresh snapshot for the one recheck after the grace wait
pub type SnapshotSource = Arc<dyn Fn() -> TransportSnapshot + Send + Sync>;

#[derive(Clone)]
pub struct CallModeResolver {
    lookup: Option<Arc<PhoneLookupService>>,
    recheck: Option<SnapshotSource>,
    grace: Duration,
    strict: bool,
}

impl CallModeResolver {
    pub fn new() -> Self {
        Self { lookup: None, recheck: None, grace: Duration::from_secs(1), strict: false }
    }

    pub fn with_lookup(mut self, lookup: Arc<PhoneLookupService>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_recheck(mut self, source: SnapshotSource) -> Self {
        self.recheck = Some(source);
        self
    }

    /// How long to wait once for an initializing peer transport
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub async fn resolve(&self, destination: &str, snapshot: &TransportSnapshot) -> ClientResult<TransportChoice> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(ClientError::MissingDestination);
        }

        let kind = DestinationKind::classify(destination);
        let choice = match kind {
            DestinationKind::PeerIdentity => self.resolve_identity(destination, snapshot).await,
            DestinationKind::PhoneNumber => self.resolve_phone(destination, snapshot).await,
            DestinationKind::Unrecognized => Self::resolve_unrecognized(destination, snapshot),
        };

        match &choice {
            Ok(choice) => debug!(destination, ?kind, %choice, "Resolved call mode"),
            Err(e) => debug!(destination, ?kind, error = %e, "No call mode for destination"),
        }
        choice
    }

    async fn resolve_identity(&self, identity: &str, snapshot: &TransportSnapshot) -> ClientResult<TransportChoice> {
        if let Some(choice) = Self::ready_choice(identity, snapshot) {
            return Ok(choice);
        }

        if snapshot.peer == TransportState::Initializing && !self.grace.is_zero() {
            tokio::time::sleep(self.grace).await;
            let rechecked = self.recheck.as_ref().map(|source| source()).unwrap_or(*snapshot);
            if let Some(choice) = Self::ready_choice(identity, &rechecked) {
                return Ok(choice);
            }
        }

        self.last_resort(identity, snapshot)
    }

    fn ready_choice(identity: &str, snapshot: &TransportSnapshot) -> Option<TransportChoice> {
        if snapshot.peer_ready() {
            Some(TransportChoice::peer(identity))
        } else if snapshot.carrier_ready() {
            Some(TransportChoice::Carrier { target: identity.to_string() })
        } else {
            None
        }
    }

    async fn resolve_phone(&self, phone: &str, snapshot: &TransportSnapshot) -> ClientResult<TransportChoice> {
        let number = normalize_phone(phone);
        if snapshot.carrier_ready() {
            return Ok(TransportChoice::Carrier { target: number });
        }
        if !snapshot.peer_ready() {
            return Err(ClientError::NoModeAvailable);
        }

        let Some(lookup) = self.lookup.as_ref() else {
            return Err(ClientError::CarrierRequired { destination: number });
        };
        match lookup.lookup(&number).await {
            Ok(result) => match result.peer_identity() {
                Some(identity) => Ok(TransportChoice::Peer {
                    identity: identity.to_string(),
                    resolved_from: Some(number),
                }),
                None => Err(ClientError::RecipientNotFound { destination: number }),
            },
            Err(e) => {
                warn!(phone = %number, error = %e, "Lookup unavailable, carrier required");
                Err(ClientError::CarrierRequired { destination: number })
            }
        }
    }

    // Strict mode does not apply here: a destination of unknown shape can only be dialed as a peer
    fn resolve_unrecognized(destination: &str, snapshot: &TransportSnapshot) -> ClientResult<TransportChoice> {
        if snapshot.peer_ready() || snapshot.peer_supported {
            return Ok(TransportChoice::peer(destination));
        }
        Err(ClientError::NoModeAvailable)
    }

    fn last_resort(&self, destination: &str, snapshot: &TransportSnapshot) -> ClientResult<TransportChoice> {
        if !self.strict && snapshot.peer_supported {
            debug!(destination, "No transport ready, attempting peer mode");
            return Ok(TransportChoice::peer(destination));
        }
        Err(ClientError::NoModeAvailable)
    }
}

impl Default for CallModeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallModeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallModeResolver")
            .field("lookup", &self.lookup.is_some())
            .field("grace", &self.grace)
            .field("strict", &self.strict)
            .finish()
    }
}
