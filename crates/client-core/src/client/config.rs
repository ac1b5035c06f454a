//! Orchestrator configuration
//!
//! ```text
//! ┌──────────────────────────────┐
//! │         ClientConfig         │
//! │  api_base_url                │  • credential + lookup endpoints
//! │  RateLimitConfig             │  • outbound call gate
//! │  TimeoutConfig               │  • boot, token, ICE, stuck/unanswered calls
//! │  LookupConfig                │  • reverse lookup cache TTL
//! │  RetryBudgetConfig           │  • boot retries
//! │  MonitorConfig               │  • peer quality polling + reconnection
//! │  strict_mode_resolution      │  • disable last-resort peer attempts
//! └──────────────────────────────┘
//! ```
//!
//! Every duration serializes as integer milliseconds.
//!
//! ```rust
//! use callbridge_client_core::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::new()
//!     .with_strict_mode_resolution(true)
//!     .with_stuck_call_timeout(Duration::from_secs(20));
//! assert_eq!(config.rate_limit.max_calls_per_window, 10);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use callbridge_session_core::config::duration_ms;
use callbridge_session_core::{EngineConfig, MediaConstraints, MonitorConfig, RtcConfiguration};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::lookup::LookupConfig;
use crate::rate_limiter::RateLimitConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Whole boot cycle, token fetch through transport registration
    #[serde(with = "duration_ms")]
    pub boot: Duration,
    #[serde(with = "duration_ms")]
    pub token_fetch: Duration,
    #[serde(with = "duration_ms")]
    pub ice_gathering: Duration,
    #[serde(with = "duration_ms")]
    pub connection: Duration,
    /// An answered call that has not connected after this long is torn down
    #[serde(with = "duration_ms")]
    pub stuck_call: Duration,
    #[serde(with = "duration_ms")]
    pub unanswered_call: Duration,
    /// One-time wait for an initializing peer transport during resolution
    #[serde(with = "duration_ms")]
    pub peer_ready_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            boot: Duration::from_secs(45),
            token_fetch: Duration::from_secs(30),
            ice_gathering: Duration::from_secs(5),
            connection: Duration::from_secs(30),
            stuck_call: Duration::from_secs(30),
            unanswered_call: Duration::from_secs(45),
            peer_ready_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudgetConfig {
    pub max_retries: u32,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the credential and lookup endpoints
    pub api_base_url: Option<Url>,
    pub rate_limit: RateLimitConfig,
    pub timeouts: TimeoutConfig,
    pub lookup: LookupConfig,
    pub retry_budget: RetryBudgetConfig,
    pub monitor: MonitorConfig,
    pub rtc: RtcConfiguration,
    pub media: MediaConstraints,
    /// Fail with `NoModeAvailable` instead of attempting peer mode when no
    /// transport reports ready for a peer identity
    pub strict_mode_resolution: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            rate_limit: RateLimitConfig::default(),
            timeouts: TimeoutConfig::default(),
            lookup: LookupConfig::default(),
            retry_budget: RetryBudgetConfig::default(),
            monitor: MonitorConfig::default(),
            rtc: RtcConfiguration::default(),
            media: MediaConstraints::default(),
            strict_mode_resolution: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_base_url(mut self, url: Url) -> Self {
        self.api_base_url = Some(url);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_stuck_call_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.stuck_call = timeout;
        self
    }

    pub fn with_lookup_cache_ttl(mut self, ttl: Duration) -> Self {
        self.lookup.cache_ttl = ttl;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry_budget.max_retries = max_retries;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_rtc(mut self, rtc: RtcConfiguration) -> Self {
        self.rtc = rtc;
        self
    }

    pub fn with_strict_mode_resolution(mut self, strict: bool) -> Self {
        self.strict_mode_resolution = strict;
        self
    }

    /// Negotiation engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            rtc: self.rtc.clone(),
            media: self.media.clone(),
            ice_gathering_timeout: self.timeouts.ice_gathering,
            connection_timeout: self.timeouts.connection,
            unanswered_call_timeout: self.timeouts.unanswered_call,
            monitor: self.monitor.clone(),
        }
    }

    pub fn validate(&self) -> ClientResult<()> {
        let invalid = |field: &str, reason: &str| {
            Err(ClientError::InvalidConfiguration { field: field.to_string(), reason: reason.to_string() })
        };

        if self.rate_limit.max_calls_per_window == 0 {
            return invalid("rate_limit.max_calls_per_window", "must be at least 1");
        }
        if self.rate_limit.window.is_zero() {
            return invalid("rate_limit.window", "must be non-zero");
        }
        for (field, value) in [
            ("timeouts.boot", self.timeouts.boot),
            ("timeouts.token_fetch", self.timeouts.token_fetch),
            ("timeouts.connection", self.timeouts.connection),
            ("timeouts.stuck_call", self.timeouts.stuck_call),
            ("timeouts.unanswered_call", self.timeouts.unanswered_call),
        ] {
            if value.is_zero() {
                return invalid(field, "must be non-zero");
            }
        }
        if self.monitor.max_reconnect_attempts == 0 {
            return invalid("monitor.max_reconnect_attempts", "must be at least 1");
        }
        if let Some(url) = &self.api_base_url {
            if !matches!(url.scheme(), "http" | "https") {
                return invalid("api_base_url", "must be an http or https URL");
            }
        }
        Ok(())
    }
}
