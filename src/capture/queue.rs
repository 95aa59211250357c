//! Bounded packet queue between the capture thread and consumers.
//!
//! A mutex-guarded deque with a condition variable. The capture thread is
//! the only producer; any number of consumers may pull. When the queue is
//! full the newest packet is rejected and accounted as a drop by the
//! caller. `close` wakes all waiters; queued packets remain drainable
//! after close.

use crate::packet::Packet;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner {
    deque: VecDeque<Packet>,
    closed: bool,
}

pub struct PacketQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                deque: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues a packet. Returns false when the queue is full or closed.
    pub fn push(&self, packet: Packet) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.deque.len() >= self.capacity {
            return false;
        }
        inner.deque.push_back(packet);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Blocks up to `timeout` for one packet. A zero timeout on an empty
    /// queue returns immediately.
    pub fn pop(&self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(packet) = inner.deque.pop_front() {
                return Some(packet);
            }
            if inner.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(inner, remaining).unwrap();
            inner = guard;
            if result.timed_out() && inner.deque.is_empty() {
                return None;
            }
        }
    }

    /// Drains up to `max` packets, waiting until `timeout` to fill the
    /// batch.
    pub fn drain(&self, max: usize, timeout: Duration) -> Vec<Packet> {
        let deadline = Instant::now() + timeout;
        let mut packets = Vec::with_capacity(max.min(256));
        while packets.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // Keep pulling without waiting once the deadline has passed.
            match self.pop(remaining) {
                Some(packet) => packets.push(packet),
                None => break,
            }
        }
        packets
    }

    /// Wakes every waiter. Remaining packets stay drainable.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_empty.notify_all();
    }

    /// Reopens a closed queue (start after stop).
    pub fn reopen(&self) {
        self.inner.lock().unwrap().closed = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().deque.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn packet(tag: u8) -> Packet {
        Packet::from_bytes(&[tag; 16], "test0")
    }

    #[test]
    fn test_pop_zero_timeout_on_empty_returns_immediately() {
        let queue = PacketQueue::new(4);
        let started = Instant::now();
        assert!(queue.pop(Duration::ZERO).is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_fifo_order_preserved() {
        let queue = PacketQueue::new(8);
        for tag in 0..5u8 {
            assert!(queue.push(packet(tag)));
        }
        for tag in 0..5u8 {
            let got = queue.pop(Duration::ZERO).unwrap();
            assert_eq!(got.data()[0], tag);
        }
    }

    #[test]
    fn test_push_full_queue_rejected() {
        let queue = PacketQueue::new(2);
        assert!(queue.push(packet(0)));
        assert!(queue.push(packet(1)));
        assert!(!queue.push(packet(2)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_respects_max() {
        let queue = PacketQueue::new(16);
        for tag in 0..10u8 {
            queue.push(packet(tag));
        }
        let batch = queue.drain(4, Duration::ZERO);
        assert_eq!(batch.len(), 4);
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(PacketQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_queued_packets_survive_close() {
        let queue = PacketQueue::new(4);
        queue.push(packet(7));
        queue.close();
        assert!(!queue.push(packet(8)));
        assert_eq!(queue.pop(Duration::ZERO).unwrap().data()[0], 7);
        assert!(queue.pop(Duration::ZERO).is_none());
    }

    #[test]
    fn test_cross_thread_delivery_in_order() {
        let queue = Arc::new(PacketQueue::new(64));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for tag in 0..32u8 {
                    while !queue.push(packet(tag)) {
                        thread::yield_now();
                    }
                }
            })
        };
        let mut seen = Vec::new();
        while seen.len() < 32 {
            if let Some(p) = queue.pop(Duration::from_secs(1)) {
                seen.push(p.data()[0]);
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..32u8).collect::<Vec<_>>());
    }
}
