//! Per-peer bookkeeping held by the block pool.
//!
//! A [`PoolPeer`] is only ever touched under the pool's lock. It tracks the
//! height the peer claims, how many requests it is serving, its receive rate
//! and a liveness timer that runs as a detached tokio task.

use std::future::Future;
use std::time::Duration;

use fastsync_core::types::PeerId;
use tokio::task::AbortHandle;

use crate::flowrate::RateMonitor;

/// Registry entry for one remote peer.
#[derive(Debug)]
pub struct PoolPeer {
    id: PeerId,
    height: u64,
    num_pending: u32,
    monitor: RateMonitor,
    timer: Option<AbortHandle>,
    /// Bumped whenever the timer is re-armed or stopped, so a timer that
    /// already fired but lost the race for the pool lock can tell it is stale.
    timer_epoch: u64,
    timed_out: bool,
}

impl PoolPeer {
    pub fn new(id: PeerId, height: u64) -> Self {
        Self {
            id,
            height,
            num_pending: 0,
            monitor: RateMonitor::new(),
            timer: None,
            timer_epoch: 0,
            timed_out: false,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn set_height(&mut self, height: u64) {
        self.height = height;
    }

    pub fn num_pending(&self) -> u32 {
        self.num_pending
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    #[cfg(test)]
    pub(crate) fn timer_epoch(&self) -> u64 {
        self.timer_epoch
    }

    /// Smoothed receive rate in bytes per second, if any sample exists.
    pub fn current_rate(&mut self) -> Option<f64> {
        self.monitor.current_rate()
    }

    /// Count one more outstanding request.
    ///
    /// Returns `true` on the 0 → 1 transition. The rate monitor is then
    /// restarted and seeded at `min_recv_rate * e`, and the caller must arm
    /// the liveness timer.
    pub(crate) fn incr_pending(&mut self, min_recv_rate: f64) -> bool {
        let first = self.num_pending == 0;
        if first {
            self.monitor = RateMonitor::new();
            self.monitor.set_rema(min_recv_rate * std::f64::consts::E);
        }
        self.num_pending += 1;
        first
    }

    /// Count one delivered response of `recv_size` bytes.
    ///
    /// Returns `true` while requests remain outstanding, in which case the
    /// caller must re-arm the liveness timer. On reaching zero the timer is
    /// stopped here.
    pub(crate) fn decr_pending(&mut self, recv_size: u64) -> bool {
        self.num_pending = self.num_pending.saturating_sub(1);
        if self.num_pending == 0 {
            self.stop_timeout();
            false
        } else {
            self.monitor.update(recv_size);
            true
        }
    }

    /// Drop one outstanding request that will never be answered, without
    /// counting it as received.
    pub(crate) fn cancel_pending(&mut self) {
        self.num_pending = self.num_pending.saturating_sub(1);
        if self.num_pending == 0 {
            self.stop_timeout();
        }
    }

    /// Mark the peer as timed out if `epoch` still names the armed timer.
    pub(crate) fn mark_timed_out(&mut self, epoch: u64) -> bool {
        if self.timer_epoch != epoch || self.timer.is_none() {
            return false;
        }
        self.timer = None;
        self.timed_out = true;
        true
    }

    /// Flag the peer for eviction without a timer firing.
    pub(crate) fn force_timed_out(&mut self) {
        self.timed_out = true;
    }

    /// (Re)arm the liveness timer. After `timeout` elapses, `on_timeout` is
    /// called with the peer id and the epoch of this arming.
    pub(crate) fn reset_timeout<F, Fut>(&mut self, timeout: Duration, on_timeout: F)
    where
        F: FnOnce(PeerId, u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop_timeout();
        let epoch = self.timer_epoch;
        let id = self.id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_timeout(id, epoch).await;
        });
        self.timer = Some(task.abort_handle());
    }

    pub(crate) fn stop_timeout(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_epoch += 1;
    }
}

impl Drop for PoolPeer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_pending_request_seeds_the_monitor() {
        let mut peer = PoolPeer::new(PeerId::from("a"), 10);
        assert!(peer.incr_pending(10_240.0));
        assert!(!peer.incr_pending(10_240.0));
        assert_eq!(peer.num_pending(), 2);
    }

    #[test]
    fn decrement_reports_remaining_work() {
        let mut peer = PoolPeer::new(PeerId::from("a"), 10);
        peer.incr_pending(0.0);
        peer.incr_pending(0.0);
        assert!(peer.decr_pending(100));
        assert!(!peer.decr_pending(100));
        assert_eq!(peer.num_pending(), 0);
        // Never underflows.
        assert!(!peer.decr_pending(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_stops_timer_without_a_sample() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut peer = PoolPeer::new(PeerId::from("a"), 10);
        peer.incr_pending(10_240.0);
        let f = fired.clone();
        peer.reset_timeout(Duration::from_secs(1), move |_, _| async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        peer.cancel_pending();
        assert_eq!(peer.num_pending(), 0);
        let rate = peer.current_rate().unwrap();
        assert!((rate - 10_240.0 * std::f64::consts::E).abs() < 1e-6);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_rate_is_reported_before_any_sample() {
        let mut peer = PoolPeer::new(PeerId::from("a"), 10);
        peer.incr_pending(10_240.0);
        let rate = peer.current_rate().unwrap();
        assert!((rate - 10_240.0 * std::f64::consts::E).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut peer = PoolPeer::new(PeerId::from("a"), 10);
        let f = fired.clone();
        peer.reset_timeout(Duration::from_secs(15), move |id, _| async move {
            assert_eq!(id.as_str(), "a");
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut peer = PoolPeer::new(PeerId::from("a"), 10);
        let f = fired.clone();
        peer.reset_timeout(Duration::from_secs(1), move |_, _| async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        peer.stop_timeout();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_epoch_does_not_mark_timed_out() {
        let mut peer = PoolPeer::new(PeerId::from("a"), 10);
        peer.reset_timeout(Duration::from_secs(60), |_, _| async {});
        let old = peer.timer_epoch();
        peer.reset_timeout(Duration::from_secs(60), |_, _| async {});
        assert!(!peer.mark_timed_out(old));
        assert!(!peer.timed_out());
        assert!(peer.mark_timed_out(peer.timer_epoch()));
        assert!(peer.timed_out());
    }
}
