//! Bounded capture queue
//!
//! The capture callback pushes frames here and the drain worker pulls them
//! out. When the consumer falls behind, the oldest frame is dropped and
//! counted, so `push` never waits on the consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::AudioFrame;

/// Drop-oldest ring of captured frames, shared between capture and drain
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    dropped: AtomicU64,
    pushed: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Append a frame, evicting the oldest one when full
    ///
    /// Returns `true` if a frame was evicted.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let evicted = {
            let mut frames = match self.frames.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front().is_some()
            } else {
                false
            };
            frames.push_back(frame);
            evicted
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // Log the first drop and then every 100th, the callback runs hot
            if total == 1 || total % 100 == 0 {
                tracing::warn!(dropped = total, "capture queue full, dropping oldest frame");
            }
        }
        self.notify.notify_one();
        evicted
    }

    /// Take the oldest frame without waiting
    pub fn try_pop(&self) -> Option<AudioFrame> {
        match self.frames.lock() {
            Ok(mut frames) => frames.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Wait for the next frame
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Wake any waiting consumer and refuse to block again
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Reopen after [`close`](Self::close), keeping the counters
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discard everything queued, returning how many frames were removed
    pub fn clear(&self) -> usize {
        match self.frames.lock() {
            Ok(mut frames) => std::mem::take(&mut *frames).len(),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()).len(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().map_or(0, |frames| frames.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted since creation, never decreases
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames pushed since creation
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; 4])
    }

    #[test]
    fn test_push_pop_order() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.try_pop(), Some(frame(1)));
        assert_eq!(queue.try_pop(), Some(frame(2)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let queue = FrameQueue::new(2);
        assert!(!queue.push(frame(1)));
        assert!(!queue.push(frame(2)));
        assert!(queue.push(frame(3)));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(frame(2)));
        assert_eq!(queue.try_pop(), Some(frame(3)));
    }

    #[test]
    fn test_clear() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = FrameQueue::new(4);
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            producer.push(frame(7));
        });
        assert_eq!(queue.recv().await, Some(frame(7)));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1));
        queue.close();
        assert_eq!(queue.recv().await, Some(frame(1)));
        assert_eq!(queue.recv().await, None);
    }
}
