//! Capture statistics with windowed rate derivation.

use super::Statistics;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(1);

struct Inner {
    stats: Statistics,
    window_start: Instant,
    window_packets: u64,
}

/// Mutex-protected statistics shared between the capture thread (writer)
/// and consumers (readers). Updates are infrequent relative to per-packet
/// work, so a plain lock is enough.
pub struct StatsRecorder {
    inner: Mutex<Inner>,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                stats: Statistics::default(),
                window_start: Instant::now(),
                window_packets: 0,
            }),
        }
    }

    pub fn record_captured(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.packets_captured += 1;
        inner.stats.bytes_captured += bytes as u64;
        inner.stats.last_update = Some(Instant::now());
        inner.window_packets += 1;
        refresh_rates(&mut inner, false);
    }

    pub fn record_dropped(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.packets_dropped += 1;
        inner.stats.bytes_dropped += bytes as u64;
        inner.stats.last_update = Some(Instant::now());
        refresh_rates(&mut inner, false);
    }

    pub fn snapshot(&self) -> Statistics {
        let mut inner = self.inner.lock().unwrap();
        refresh_rates(&mut inner, false);
        inner.stats.clone()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats = Statistics::default();
        inner.window_start = Instant::now();
        inner.window_packets = 0;
    }

    /// Forces the rate window shut, for tests.
    #[cfg(test)]
    fn flush_window(&self) {
        let mut inner = self.inner.lock().unwrap();
        refresh_rates(&mut inner, true);
    }
}

fn refresh_rates(inner: &mut Inner, force: bool) {
    let elapsed = inner.window_start.elapsed();
    if !force && elapsed < RATE_WINDOW {
        return;
    }
    let secs = elapsed.as_secs_f64().max(1e-9);
    inner.stats.capture_rate = inner.window_packets as f64 / secs;
    let seen = inner.stats.packets_captured + inner.stats.packets_dropped;
    inner.stats.drop_rate = if seen == 0 {
        0.0
    } else {
        inner.stats.packets_dropped as f64 / seen as f64 * 100.0
    };
    inner.window_start = Instant::now();
    inner.window_packets = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_monotonically() {
        let recorder = StatsRecorder::new();
        recorder.record_captured(100);
        recorder.record_captured(50);
        recorder.record_dropped(10);

        let snap = recorder.snapshot();
        assert_eq!(snap.packets_captured, 2);
        assert_eq!(snap.bytes_captured, 150);
        assert_eq!(snap.packets_dropped, 1);
        assert_eq!(snap.bytes_dropped, 10);
        assert!(snap.last_update.is_some());

        recorder.record_captured(1);
        let later = recorder.snapshot();
        assert!(later.packets_captured >= snap.packets_captured);
        assert!(later.bytes_captured >= snap.bytes_captured);
    }

    #[test]
    fn test_rates_after_window() {
        let recorder = StatsRecorder::new();
        for _ in 0..10 {
            recorder.record_captured(64);
        }
        for _ in 0..10 {
            recorder.record_dropped(64);
        }
        recorder.flush_window();
        let snap = recorder.snapshot();
        assert!(snap.capture_rate > 0.0);
        assert!((snap.drop_rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let recorder = StatsRecorder::new();
        recorder.record_captured(10);
        recorder.reset();
        let snap = recorder.snapshot();
        assert_eq!(snap.packets_captured, 0);
        assert_eq!(snap.bytes_captured, 0);
        assert!(snap.last_update.is_none());
    }
}
