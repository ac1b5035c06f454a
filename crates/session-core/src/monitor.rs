//! Connection quality monitoring and reconnection
//!
//! [`ConnectionMonitor`] polls peer connection statistics on a fixed
//! interval, folds them into [`ConnectionStats`], and labels quality by
//! round-trip time. When a connection drops, [`ConnectionMonitor::attempt_reconnection`]
//! restarts ICE with exponential backoff until it reconnects or the attempt
//! budget runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{SessionError, SessionResult};
use crate::ice::wait_for_ice_connection;
use crate::transport::PeerConnection;
use crate::types::{ConnectionQuality, ConnectionStats, IceConnectionState, RtcStats};

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Stats(ConnectionStats),
    QualityChanged(ConnectionQuality),
    ReconnectionAttempt { attempt: u32, delay: Duration },
    Reconnected { attempt: u32 },
    ReconnectionFailed { attempts: u32 },
}

pub struct ConnectionMonitor {
    config: MonitorConfig,
    /// Bound on each post-restart connectivity wait
    attempt_timeout: Duration,
    events: broadcast::Sender<MonitorEvent>,
    last_quality: Mutex<Option<ConnectionQuality>>,
    last_stats: Mutex<Option<ConnectionStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig, attempt_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            attempt_timeout,
            events,
            last_quality: Mutex::new(None),
            last_stats: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn last_quality(&self) -> Option<ConnectionQuality> {
        *self.last_quality.lock()
    }

    pub fn last_stats(&self) -> Option<ConnectionStats> {
        self.last_stats.lock().clone()
    }

    /// Quality label from round-trip time, overridden by a broken ICE state
    pub fn quality_for(rtt_ms: Option<f64>, ice_state: IceConnectionState) -> ConnectionQuality {
        match ice_state {
            IceConnectionState::Failed => return ConnectionQuality::Failed,
            IceConnectionState::Disconnected | IceConnectionState::Closed => return ConnectionQuality::Disconnected,
            _ => {}
        }
        match rtt_ms {
            None => ConnectionQuality::Good,
            Some(rtt) if rtt < 100.0 => ConnectionQuality::Excellent,
            Some(rtt) if rtt < 200.0 => ConnectionQuality::Good,
            Some(rtt) if rtt < 400.0 => ConnectionQuality::Fair,
            Some(_) => ConnectionQuality::Poor,
        }
    }

    /// Fold a statistics report into totals
    pub fn aggregate(report: &[RtcStats]) -> ConnectionStats {
        let mut stats = ConnectionStats {
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            jitter_ms: 0.0,
            round_trip_time_ms: None,
            measured_at: Utc::now(),
        };

        for entry in report {
            match entry {
                RtcStats::InboundRtp { bytes_received, packets_received, packets_lost, jitter } => {
                    stats.bytes_received += bytes_received;
                    stats.packets_received += packets_received;
                    stats.packets_lost += packets_lost;
                    stats.jitter_ms = stats.jitter_ms.max(jitter * 1000.0);
                }
                RtcStats::OutboundRtp { bytes_sent, packets_sent } => {
                    stats.bytes_sent += bytes_sent;
                    stats.packets_sent += packets_sent;
                }
                RtcStats::CandidatePair { nominated, current_round_trip_time } => {
                    if let Some(rtt) = current_round_trip_time {
                        // The nominated pair wins over any other pair
                        if *nominated || stats.round_trip_time_ms.is_none() {
                            stats.round_trip_time_ms = Some(rtt * 1000.0);
                        }
                    }
                }
            }
        }
        stats
    }

    /// `base * 2^(attempt - 1)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config.reconnect_base_delay * 2u32.pow(exponent)
    }

    /// Take one sample and publish it
    pub async fn poll_once(&self, pc: &Arc<dyn PeerConnection>) -> SessionResult<(ConnectionStats, ConnectionQuality)> {
        let report = pc.get_stats().await?;
        let stats = Self::aggregate(&report);
        let quality = Self::quality_for(stats.round_trip_time_ms, pc.ice_connection_state());

        *self.last_stats.lock() = Some(stats.clone());
        let changed = self.last_quality.lock().replace(quality) != Some(quality);
        let _ = self.events.send(MonitorEvent::Stats(stats.clone()));
        if changed {
            debug!(?quality, rtt_ms = ?stats.round_trip_time_ms, "Connection quality changed");
            let _ = self.events.send(MonitorEvent::QualityChanged(quality));
        }
        Ok((stats, quality))
    }

    /// Start polling `pc`; a running poller is replaced
    pub fn start(self: &Arc<Self>, pc: Arc<dyn PeerConnection>) {
        let monitor = Arc::downgrade(self);
        let period = self.config.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else { break };
                if let Err(e) = monitor.poll_once(&pc).await {
                    warn!(error = %e, "Failed to collect connection statistics");
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Restart ICE until the connection comes back
    ///
    /// Returns the attempt that succeeded. After `max_reconnect_attempts`
    /// failures a [`MonitorEvent::ReconnectionFailed`] is published and
    /// [`SessionError::ReconnectionFailed`] returned.
    pub async fn attempt_reconnection(&self, pc: &Arc<dyn PeerConnection>) -> SessionResult<u32> {
        let max = self.config.max_reconnect_attempts;

        for attempt in 1..=max {
            let delay = self.backoff_delay(attempt);
            info!(attempt, max, delay_ms = delay.as_millis() as u64, "Attempting reconnection");
            let _ = self.events.send(MonitorEvent::ReconnectionAttempt { attempt, delay });
            tokio::time::sleep(delay).await;

            if let Err(e) = pc.restart_ice().await {
                warn!(attempt, error = %e, "ICE restart failed");
                continue;
            }

            match wait_for_ice_connection(pc, self.attempt_timeout, true).await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    let _ = self.events.send(MonitorEvent::Reconnected { attempt });
                    return Ok(attempt);
                }
                Err(e) => warn!(attempt, error = %e, "Reconnection attempt failed"),
            }
        }

        let _ = self.events.send(MonitorEvent::ReconnectionFailed { attempts: max });
        Err(SessionError::ReconnectionFailed { attempts: max })
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBehavior, LoopbackPeerConnection};

    fn monitor() -> Arc<ConnectionMonitor> {
        Arc::new(ConnectionMonitor::new(MonitorConfig::default(), Duration::from_secs(5)))
    }

    #[test]
    fn test_quality_thresholds() {
        let connected = IceConnectionState::Connected;
        assert_eq!(ConnectionMonitor::quality_for(Some(50.0), connected), ConnectionQuality::Excellent);
        assert_eq!(ConnectionMonitor::quality_for(Some(100.0), connected), ConnectionQuality::Good);
        assert_eq!(ConnectionMonitor::quality_for(Some(250.0), connected), ConnectionQuality::Fair);
        assert_eq!(ConnectionMonitor::quality_for(Some(400.0), connected), ConnectionQuality::Poor);
        assert_eq!(ConnectionMonitor::quality_for(None, connected), ConnectionQuality::Good);
        assert_eq!(
            ConnectionMonitor::quality_for(Some(10.0), IceConnectionState::Failed),
            ConnectionQuality::Failed
        );
        assert_eq!(
            ConnectionMonitor::quality_for(Some(10.0), IceConnectionState::Disconnected),
            ConnectionQuality::Disconnected
        );
    }

    #[test]
    fn test_aggregate_prefers_nominated_pair() {
        let report = vec![
            RtcStats::InboundRtp { bytes_received: 1000, packets_received: 10, packets_lost: 1, jitter: 0.004 },
            RtcStats::OutboundRtp { bytes_sent: 800, packets_sent: 8 },
            RtcStats::CandidatePair { nominated: false, current_round_trip_time: Some(0.5) },
            RtcStats::CandidatePair { nominated: true, current_round_trip_time: Some(0.08) },
        ];
        let stats = ConnectionMonitor::aggregate(&report);
        assert_eq!(stats.bytes_received, 1000);
        assert_eq!(stats.packets_sent, 8);
        assert_eq!(stats.round_trip_time_ms, Some(80.0));
        assert!((stats.jitter_ms - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_doubles() {
        let monitor = monitor();
        assert_eq!(monitor.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(monitor.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(monitor.backoff_delay(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_publishes_quality_once() {
        let monitor = monitor();
        let raw = Arc::new(LoopbackPeerConnection::new(LoopbackBehavior::default().with_round_trip_time_ms(250.0)));
        raw.set_ice_connection_state(IceConnectionState::Connected);
        let pc: Arc<dyn PeerConnection> = raw.clone();
        let mut rx = monitor.subscribe();

        let (_, quality) = monitor.poll_once(&pc).await.unwrap();
        assert_eq!(quality, ConnectionQuality::Fair);
        monitor.poll_once(&pc).await.unwrap();

        let mut quality_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, MonitorEvent::QualityChanged(_)) {
                quality_events += 1;
            }
        }
        assert_eq!(quality_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_succeeds_on_restart() {
        let monitor = monitor();
        let raw = Arc::new(LoopbackPeerConnection::new(LoopbackBehavior::default()));
        raw.set_ice_connection_state(IceConnectionState::Disconnected);
        let pc: Arc<dyn PeerConnection> = raw.clone();

        assert_eq!(monitor.attempt_reconnection(&pc).await.unwrap(), 1);
        assert_eq!(raw.ice_restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_gives_up() {
        let monitor = monitor();
        let raw = Arc::new(LoopbackPeerConnection::new(LoopbackBehavior::default().with_reconnect(false)));
        raw.set_ice_connection_state(IceConnectionState::Disconnected);
        let pc: Arc<dyn PeerConnection> = raw.clone();
        let mut rx = monitor.subscribe();

        let start = tokio::time::Instant::now();
        let err = monitor.attempt_reconnection(&pc).await.unwrap_err();
        assert!(matches!(err, SessionError::ReconnectionFailed { attempts: 3 }));
        // 1s + 2s + 4s of backoff
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(raw.ice_restarts(), 3);

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            failed |= matches!(event, MonitorEvent::ReconnectionFailed { attempts: 3 });
        }
        assert!(failed);
    }
}
