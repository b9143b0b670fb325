//! Exponentially-weighted receive-rate monitor.
//!
//! Bytes are accumulated into fixed sample periods. When a period closes, the
//! sample rate `bytes / t` is folded into a moving average with weight
//! `exp(-t / window)`, so longer gaps between samples carry more weight.
//! Samples are taken lazily, on the next [`RateMonitor::update`] or
//! [`RateMonitor::current_rate`] call after the period has elapsed.
//!
//! Time comes from [`tokio::time::Instant`], which follows the paused clock in
//! tests.

use std::time::Duration;
use tokio::time::Instant;

/// Default sample period.
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Default averaging window.
pub const WINDOW: Duration = Duration::from_secs(40);

/// Receive-rate monitor for one peer.
#[derive(Debug, Clone)]
pub struct RateMonitor {
    sample_period: Duration,
    window: Duration,
    sample_start: Instant,
    sample_bytes: u64,
    total_bytes: u64,
    /// Smoothed rate in bytes per second; `None` until the first sample or seed.
    rema: Option<f64>,
}

impl RateMonitor {
    /// Monitor with the default 1 s sample period and 40 s window.
    pub fn new() -> Self {
        Self::with_periods(SAMPLE_PERIOD, WINDOW)
    }

    pub fn with_periods(sample_period: Duration, window: Duration) -> Self {
        Self {
            sample_period,
            window,
            sample_start: Instant::now(),
            sample_bytes: 0,
            total_bytes: 0,
            rema: None,
        }
    }

    /// Record `n` received bytes.
    pub fn update(&mut self, n: u64) {
        self.update_at(n, Instant::now());
    }

    /// Overwrite the smoothed rate, counting it as an existing sample.
    pub fn set_rema(&mut self, rate: f64) {
        self.rema = Some(rate);
    }

    /// Smoothed rate in bytes per second, closing the current sample period
    /// first if it has elapsed.
    pub fn current_rate(&mut self) -> Option<f64> {
        self.update_at(0, Instant::now());
        self.rema
    }

    /// Bytes recorded since the monitor was created.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn update_at(&mut self, n: u64, now: Instant) {
        self.sample_bytes += n;
        self.total_bytes += n;

        let elapsed = now.saturating_duration_since(self.sample_start);
        if elapsed < self.sample_period {
            return;
        }
        let t = elapsed.as_secs_f64();
        let sample = self.sample_bytes as f64 / t;
        self.rema = Some(match self.rema {
            Some(prev) => {
                let w = (-t / self.window.as_secs_f64()).exp();
                sample + w * (prev - sample)
            }
            None => sample,
        });
        self.sample_bytes = 0;
        self.sample_start = now;
    }
}

impl Default for RateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn no_rate_before_first_sample() {
        let mut m = RateMonitor::new();
        m.update(5_000);
        assert_eq!(m.current_rate(), None);
        assert_eq!(m.total_bytes(), 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn first_sample_sets_rate_directly() {
        let mut m = RateMonitor::new();
        m.update(4_000);
        tokio::time::advance(Duration::from_secs(2)).await;
        let rate = m.current_rate().unwrap();
        assert!((rate - 2_000.0).abs() < 1e-6, "rate = {rate}");
    }

    #[tokio::test(start_paused = true)]
    async fn later_samples_are_smoothed() {
        let mut m = RateMonitor::new();
        m.set_rema(10_000.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        // Zero bytes in the period pulls the average down, but only by the
        // weight of one second out of forty.
        let rate = m.current_rate().unwrap();
        let expected = 10_000.0 * (-1.0f64 / 40.0).exp();
        assert!((rate - expected).abs() < 1e-6, "rate = {rate}");
        assert!(rate > 9_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn long_silence_decays_toward_zero() {
        let mut m = RateMonitor::new();
        m.set_rema(10_240.0 * std::f64::consts::E);
        tokio::time::advance(Duration::from_secs(120)).await;
        let rate = m.current_rate().unwrap();
        assert!(rate < 10_240.0, "rate = {rate}");
        assert!(rate > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bytes_within_period_are_accumulated() {
        let mut m = RateMonitor::new();
        m.update(1_000);
        tokio::time::advance(Duration::from_millis(500)).await;
        m.update(1_000);
        tokio::time::advance(Duration::from_millis(500)).await;
        let rate = m.current_rate().unwrap();
        assert!((rate - 2_000.0).abs() < 1e-6, "rate = {rate}");
    }
}
