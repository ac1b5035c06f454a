//! Negotiation engine configuration
//!
//! All durations serialize as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{MediaConstraints, RtcConfiguration};

/// Connection monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often peer connection statistics are polled
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Delay before the first reconnection attempt; doubled per attempt
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 3,
        }
    }
}

/// Settings for [`crate::NegotiationEngine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub rtc: RtcConfiguration,
    pub media: MediaConstraints,
    /// Upper bound on waiting for local ICE gathering
    #[serde(with = "duration_ms")]
    pub ice_gathering_timeout: Duration,
    /// Upper bound on waiting for the ICE connection after SDP is exchanged
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Outbound calls with no answer, and inbound offers nobody accepts,
    /// end as missed after this long
    #[serde(with = "duration_ms")]
    pub unanswered_call_timeout: Duration,
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rtc: RtcConfiguration::default(),
            media: MediaConstraints::default(),
            ice_gathering_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
            unanswered_call_timeout: Duration::from_secs(45),
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_ice_gathering_timeout(mut self, timeout: Duration) -> Self {
        self.ice_gathering_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_unanswered_call_timeout(mut self, timeout: Duration) -> Self {
        self.unanswered_call_timeout = timeout;
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
}

/// Serde helper storing a [`Duration`] as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.ice_gathering_timeout, Duration::from_secs(5));
        assert_eq!(config.unanswered_call_timeout, Duration::from_secs(45));
        assert_eq!(config.monitor.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(MonitorConfig::default()).unwrap();
        assert_eq!(json["poll_interval"], 2000);
        assert_eq!(json["reconnect_base_delay"], 1000);

        let parsed: MonitorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, MonitorConfig::default());
    }
}
