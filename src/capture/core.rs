//! Delivery plumbing shared by every backend: the bounded queue, the
//! push-callback slot, statistics, the running flag and the last-error
//! record.

use super::queue::PacketQueue;
use super::stats::StatsRecorder;
use super::{PacketCallback, Statistics};
use crate::packet::Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::error;

pub(crate) struct CaptureCore {
    queue: PacketQueue,
    callback: Mutex<Option<PacketCallback>>,
    pub stats: StatsRecorder,
    running: AtomicBool,
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl CaptureCore {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue: PacketQueue::new(queue_capacity),
            callback: Mutex::new(None),
            stats: StatsRecorder::new(),
            running: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Delivers one packet from the capture thread: statistics, bounded
    /// queue (drop-newest on overflow, counted), then the push callback.
    pub fn publish(&self, packet: Packet) {
        let bytes = packet.len();
        let callback = self.callback.lock().unwrap();
        let queued = self.queue.push(packet.clone());
        if queued {
            self.stats.record_captured(bytes);
        } else {
            self.stats.record_dropped(bytes);
        }
        if let Some(ref callback) = *callback {
            callback(packet);
        }
    }

    pub fn next_packet(&self, timeout: Duration) -> Option<Packet> {
        self.queue.pop(timeout)
    }

    pub fn get_packets(&self, max: usize, timeout: Duration) -> Vec<Packet> {
        self.queue.drain(max, timeout)
    }

    pub fn set_callback(&self, callback: PacketCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    pub fn remove_callback(&self) {
        *self.callback.lock().unwrap() = None;
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Marks the loop runnable and reopens the queue.
    pub fn begin(&self) {
        self.queue.reopen();
        self.running.store(true, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
    }

    /// Signals the capture thread to wind down and wakes all waiters.
    pub fn end(&self) {
        self.running.store(false, Ordering::Release);
        self.queue.close();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Records a terminal capture-thread error: sets `last_error`, marks
    /// the backend unhealthy and stops the loop. Resources stay acquired
    /// until `stop`.
    pub fn fail(&self, message: String) {
        error!("capture thread terminal error: {message}");
        *self.last_error.lock().unwrap() = Some(message);
        self.healthy.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.queue.close();
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear_queue(&self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_publish_feeds_queue_and_callback() {
        let core = CaptureCore::new(8);
        core.begin();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        core.set_callback(Box::new(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        core.publish(Packet::from_bytes(&[1; 64], "t0"));
        core.publish(Packet::from_bytes(&[2; 64], "t0"));

        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(core.queue_len(), 2);
        assert_eq!(core.statistics().packets_captured, 2);
        assert_eq!(core.statistics().bytes_captured, 128);
    }

    #[test]
    fn test_overflow_counts_drops_but_still_calls_back() {
        let core = CaptureCore::new(1);
        core.begin();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        core.set_callback(Box::new(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        core.publish(Packet::from_bytes(&[1; 10], "t0"));
        core.publish(Packet::from_bytes(&[2; 10], "t0"));

        let stats = core.statistics();
        assert_eq!(stats.packets_captured, 1);
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_fail_marks_unhealthy_and_keeps_queue_drainable() {
        let core = CaptureCore::new(8);
        core.begin();
        core.publish(Packet::from_bytes(&[9; 10], "t0"));
        core.fail("device vanished".to_string());

        assert!(!core.is_running());
        assert!(!core.is_healthy());
        assert_eq!(core.last_error().unwrap(), "device vanished");
        // Whatever was queued before the failure is still served.
        assert!(core.next_packet(Duration::ZERO).is_some());
        assert!(core.next_packet(Duration::ZERO).is_none());
    }
}
