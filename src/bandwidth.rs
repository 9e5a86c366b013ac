//! Transfer-rate measurement.
//!
//! Every byte moved over the wire or the disk is recorded into a
//! [`RateMonitor`]: one per peer direction, one per torrent direction and
//! one pair for the whole client. Monitors measure; they never throttle.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sliding-window byte-rate meter.
///
/// Samples are kept for one window (default one second); the current rate
/// is the windowed byte count scaled to bytes/second. The cumulative total
/// survives `reset()` of the window.
pub struct RateMonitor {
    inner: Mutex<Window>,
}

struct Window {
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
    total: u64,
    span: Duration,
}

impl RateMonitor {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(span: Duration) -> Self {
        Self {
            inner: Mutex::new(Window {
                samples: VecDeque::new(),
                window_bytes: 0,
                total: 0,
                span,
            }),
        }
    }

    /// Records `n` transferred bytes at the current instant.
    pub fn record(&self, n: usize) {
        let now = Instant::now();
        let mut w = self.inner.lock();
        w.prune(now);
        w.samples.push_back((now, n as u64));
        w.window_bytes += n as u64;
        w.total += n as u64;
    }

    /// Current rate in bytes per second.
    pub fn rate(&self) -> u64 {
        let now = Instant::now();
        let mut w = self.inner.lock();
        w.prune(now);
        (w.window_bytes as f64 / w.span.as_secs_f64()) as u64
    }

    /// Cumulative bytes since creation.
    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    /// Drops the rate window; the cumulative total is kept.
    pub fn reset(&self) {
        let mut w = self.inner.lock();
        w.samples.clear();
        w.window_bytes = 0;
    }
}

impl Default for RateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&(at, n)) = self.samples.front() {
            if now.duration_since(at) <= self.span {
                break;
            }
            self.window_bytes -= n;
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_accumulates() {
        let m = RateMonitor::new();
        m.record(100);
        m.record(50);
        assert_eq!(m.total(), 150);
    }

    #[test]
    fn test_reset_keeps_total() {
        let m = RateMonitor::new();
        m.record(4096);
        m.reset();
        assert_eq!(m.total(), 4096);
        assert_eq!(m.rate(), 0);
    }

    #[test]
    fn test_rate_reflects_window() {
        let m = RateMonitor::with_window(Duration::from_secs(10));
        m.record(10_000);
        // 10k bytes over a 10s window reads as ~1000 B/s.
        let rate = m.rate();
        assert!(rate >= 900 && rate <= 1100, "rate {rate}");
    }
}
