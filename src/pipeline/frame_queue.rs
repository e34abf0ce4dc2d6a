//! Bounded frame queue between the render producer and the encode worker
//!
//! Drop-newest-on-full: a full queue discards the incoming frame rather than
//! an already-queued one, preserving temporal ordering and turning
//! backpressure into an observable drop counter instead of a producer stall.

use std::sync::Mutex;

use crate::pipeline::types::Frame;

/// Fixed-capacity ring buffer of frames, safe to share across threads.
///
/// All operations are O(1) under a single mutex; no long-running work ever
/// happens inside the lock, so the render-side producer is never stalled
/// beyond the push itself.
pub struct FrameQueue {
    inner: Mutex<Ring>,
    capacity: usize,
}

struct Ring {
    slots: Vec<Option<Frame>>,
    head: usize,
    tail: usize,
    count: usize,
    dropped: u64,
}

impl FrameQueue {
    pub const DEFAULT_CAPACITY: usize = 120;

    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                count: 0,
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Push a frame, returning `false` (and counting a drop) when full.
    ///
    /// Never blocks and never overwrites a queued frame.
    pub fn enqueue(&self, frame: Frame) -> bool {
        let mut ring = self.inner.lock().unwrap();
        if ring.count == self.capacity {
            ring.dropped += 1;
            return false;
        }

        let head = ring.head;
        ring.slots[head] = Some(frame);
        ring.head = (head + 1) % self.capacity;
        ring.count += 1;
        true
    }

    /// Pop the oldest frame, or `None` when empty.
    pub fn dequeue(&self) -> Option<Frame> {
        let mut ring = self.inner.lock().unwrap();
        if ring.count == 0 {
            return None;
        }

        let tail = ring.tail;
        let frame = ring.slots[tail].take();
        ring.tail = (tail + 1) % self.capacity;
        ring.count -= 1;
        frame
    }

    /// Clear all slots and counters. Used between capture sessions.
    pub fn reset(&self) {
        let mut ring = self.inner.lock().unwrap();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.head = 0;
        ring.tail = 0;
        ring.count = 0;
        ring.dropped = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames dropped since the last `reset`.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// Occupancy over capacity, 0-1.
    pub fn fill_ratio(&self) -> f32 {
        self.len() as f32 / self.capacity as f32
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Eye, Resolution};

    fn frame(ts: f64) -> Frame {
        Frame::new(ts, Eye::Left, Resolution::new(8, 4))
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(4);
        assert!(queue.enqueue(frame(0.0)));
        assert!(queue.enqueue(frame(0.1)));
        assert!(queue.enqueue(frame(0.2)));

        assert_eq!(queue.dequeue().unwrap().timestamp_seconds, 0.0);
        assert_eq!(queue.dequeue().unwrap().timestamp_seconds, 0.1);
        assert_eq!(queue.dequeue().unwrap().timestamp_seconds, 0.2);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_drop_newest_on_full() {
        let capacity = 8;
        let extra = 3;
        let queue = FrameQueue::new(capacity);

        for i in 0..capacity + extra {
            let accepted = queue.enqueue(frame(i as f64 * 0.1));
            assert_eq!(accepted, i < capacity);
        }

        // Exactly `capacity` stored, in original order; the overflow counted.
        assert_eq!(queue.len(), capacity);
        assert_eq!(queue.dropped(), extra as u64);
        for i in 0..capacity {
            let got = queue.dequeue().unwrap().timestamp_seconds;
            assert!((got - i as f64 * 0.1).abs() < 1e-9);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reset_clears_counters() {
        let queue = FrameQueue::new(2);
        queue.enqueue(frame(0.0));
        queue.enqueue(frame(0.1));
        queue.enqueue(frame(0.2));
        assert_eq!(queue.dropped(), 1);

        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
        assert_eq!(queue.fill_ratio(), 0.0);

        // Usable again after reset.
        assert!(queue.enqueue(frame(1.0)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_wrap_around() {
        let queue = FrameQueue::new(3);
        for round in 0..5 {
            assert!(queue.enqueue(frame(round as f64)));
            assert!(queue.enqueue(frame(round as f64 + 0.5)));
            assert_eq!(queue.dequeue().unwrap().timestamp_seconds, round as f64);
            assert_eq!(
                queue.dequeue().unwrap().timestamp_seconds,
                round as f64 + 0.5
            );
        }
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(FrameQueue::new(64));
        let mut handles = Vec::new();
        for t in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    queue.enqueue(frame((t * 100 + i) as f64));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Stored + dropped must account for every push.
        assert_eq!(queue.len() as u64 + queue.dropped(), 400);
        assert_eq!(queue.len(), 64);
    }
}
