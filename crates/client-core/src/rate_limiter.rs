//! Outbound call rate limiting
//!
//! A fixed window counts call attempts; independently, consecutive attempts
//! must be at least `min_interval` apart. The window restarts once it has
//! fully elapsed.

use std::time::Duration;

use callbridge_session_core::config::duration_ms;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_calls_per_window: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls_per_window: 10,
            window: Duration::from_secs(60),
            min_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u32,
    pub last_call_at: Option<Instant>,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self { window_start: now, count: 0, last_call_at: None }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<Option<RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, window: Mutex::new(None) }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether a call may be placed now, without recording it
    pub fn check(&self) -> ClientResult<()> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> ClientResult<()> {
        let mut window = self.window.lock();
        self.evaluate(&mut window, now)
    }

    /// Check and record an attempt in one step
    pub fn record(&self) -> ClientResult<()> {
        self.record_at(Instant::now())
    }

    pub fn record_at(&self, now: Instant) -> ClientResult<()> {
        let mut window = self.window.lock();
        self.evaluate(&mut window, now)?;
        let current = window.get_or_insert_with(|| RateWindow::new(now));
        current.count += 1;
        current.last_call_at = Some(now);
        debug!(count = current.count, max = self.config.max_calls_per_window, "call attempt recorded");
        Ok(())
    }

    /// Current window, if any attempt has been recorded
    pub fn window(&self) -> Option<RateWindow> {
        *self.window.lock()
    }

    pub fn reset(&self) {
        *self.window.lock() = None;
    }

    fn evaluate(&self, window: &mut Option<RateWindow>, now: Instant) -> ClientResult<()> {
        let Some(current) = window.as_mut() else {
            *window = Some(RateWindow::new(now));
            return Ok(());
        };

        if now.saturating_duration_since(current.window_start) >= self.config.window {
            *current = RateWindow { last_call_at: current.last_call_at, ..RateWindow::new(now) };
        }

        if let Some(last) = current.last_call_at {
            let since_last = now.saturating_duration_since(last);
            if since_last < self.config.min_interval {
                return Err(ClientError::RateLimited { retry_after: self.config.min_interval - since_last });
            }
        }

        if current.count >= self.config.max_calls_per_window {
            let window_end = current.window_start + self.config.window;
            return Err(ClientError::RateLimited { retry_after: window_end.saturating_duration_since(now) });
        }

        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (RateLimiter, Instant) {
        (RateLimiter::default(), Instant::now())
    }

    #[test]
    fn test_eleventh_call_in_window_is_rejected() {
        let (limiter, start) = limiter();
        for i in 0..10 {
            limiter.record_at(start + Duration::from_secs(i * 5)).unwrap();
        }

        let err = limiter.record_at(start + Duration::from_secs(50)).unwrap_err();
        match err {
            ClientError::RateLimited { retry_after } => assert_eq!(retry_after, Duration::from_secs(10)),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(limiter.window().unwrap().count, 10);
    }

    #[test]
    fn test_min_interval_applies_regardless_of_count() {
        let (limiter, start) = limiter();
        limiter.record_at(start).unwrap();

        let err = limiter.record_at(start + Duration::from_millis(1000)).unwrap_err();
        match err {
            ClientError::RateLimited { retry_after } => assert_eq!(retry_after, Duration::from_millis(4000)),
            other => panic!("unexpected error {other:?}"),
        }
        limiter.record_at(start + Duration::from_millis(5000)).unwrap();
    }

    #[test]
    fn test_window_resets_after_elapsing() {
        let (limiter, start) = limiter();
        for i in 0..10 {
            limiter.record_at(start + Duration::from_secs(i * 5)).unwrap();
        }
        limiter.record_at(start + Duration::from_secs(60)).unwrap();
        let window = limiter.window().unwrap();
        assert_eq!(window.count, 1);
        assert_eq!(window.window_start, start + Duration::from_secs(60));
    }

    #[test]
    fn test_check_does_not_record() {
        let (limiter, start) = limiter();
        limiter.check_at(start).unwrap();
        limiter.check_at(start + Duration::from_millis(10)).unwrap();
        assert_eq!(limiter.window().unwrap().count, 0);
    }
}
