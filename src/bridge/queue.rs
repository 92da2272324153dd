//! # Frame Queue
//!
//! Bounded queue sitting between the leg that receives a frame and the pump
//! that writes it to the other leg. Live audio favors recency: when the queue
//! is full the oldest media frame is evicted so the producer never waits on a
//! slow consumer.
//!
//! ## Key Features:
//! - **Drop-oldest**: the newest frame is always accepted
//! - **Control events are kept**: only items that report themselves
//!   evictable are evicted, so a `stop` can't be lost to media backpressure
//! - **Hard bound**: a queue already full of control events refuses the new
//!   item instead of growing past its capacity
//! - **Close-then-drain**: after `close()` no new items are accepted, but
//!   items already queued are still handed out before `pop()` returns `None`
//! - **No lock across await**: the mutex guards only the `VecDeque` itself

use crate::codec::AudioFrame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Items that may be evicted under backpressure.
pub trait Evictable {
    fn evictable(&self) -> bool {
        true
    }
}

impl Evictable for AudioFrame {}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without displacing anything.
    Queued,
    /// Queued; the oldest evictable item was dropped to make room.
    DroppedOldest,
    /// Full of control events with nothing evictable; the item was discarded.
    Rejected,
    /// The queue is closed and the item was discarded.
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Single-consumer, drop-oldest frame queue.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T: Evictable> FrameQueue<T> {
    /// A zero capacity is bumped to one so the newest frame always fits.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, evicting the oldest evictable one if full.
    ///
    /// The queue never holds more than `capacity` items.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            if state.items.len() >= self.capacity {
                match state.items.iter().position(|queued| queued.evictable()) {
                    Some(index) => {
                        state.items.remove(index);
                        outcome = PushOutcome::DroppedOldest;
                    }
                    None => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return PushOutcome::Rejected;
                    }
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.items.push_back(item);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next item. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting items. Already queued items remain poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted by backpressure since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        // A panic while holding the guard leaves the deque itself consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Item {
        Frame(u32),
        Control(&'static str),
    }

    impl Evictable for Item {
        fn evictable(&self) -> bool {
            matches!(self, Item::Frame(_))
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = FrameQueue::new(8);
        for i in 0..5 {
            assert_eq!(queue.push(Item::Frame(i)), PushOutcome::Queued);
        }
        for i in 0..5 {
            assert_eq!(queue.pop().await, Some(Item::Frame(i)));
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_keeps_newest() {
        let queue = FrameQueue::new(3);
        for i in 0..10 {
            queue.push(Item::Frame(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 7);

        queue.close();
        let mut drained = Vec::new();
        while let Some(item) = queue.pop().await {
            drained.push(item);
        }
        assert_eq!(drained, vec![Item::Frame(7), Item::Frame(8), Item::Frame(9)]);
    }

    #[tokio::test]
    async fn test_control_items_survive_backpressure() {
        let queue = FrameQueue::new(2);
        queue.push(Item::Frame(1));
        queue.push(Item::Control("stop"));
        assert_eq!(queue.push(Item::Frame(2)), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(Item::Frame(3)), PushOutcome::DroppedOldest);

        queue.close();
        assert_eq!(queue.pop().await, Some(Item::Control("stop")));
        assert_eq!(queue.pop().await, Some(Item::Frame(3)));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_rejects_new_items_but_drains_old() {
        let queue = FrameQueue::new(4);
        queue.push(Item::Frame(1));
        queue.close();

        assert_eq!(queue.push(Item::Frame(2)), PushOutcome::Closed);
        assert_eq!(queue.pop().await, Some(Item::Frame(1)));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_and_close() {
        let queue = Arc::new(FrameQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop().await {
                    seen.push(item);
                }
                seen
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(Item::Frame(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(Item::Frame(2));
        queue.close();

        let seen = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should finish after close")
            .unwrap();
        assert_eq!(seen, vec![Item::Frame(1), Item::Frame(2)]);
    }

    #[tokio::test]
    async fn test_newest_frame_is_delivered_to_slow_consumer() {
        let queue = Arc::new(FrameQueue::new(2));

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    queue.push(Item::Frame(i));
                }
                queue.close();
            })
        };
        producer.await.unwrap();

        let mut last = None;
        while let Some(item) = queue.pop().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
            last = Some(item);
        }
        assert_eq!(last, Some(Item::Frame(99)));
        assert_eq!(queue.dropped(), 98);
    }

    #[tokio::test]
    async fn test_queue_full_of_control_items_stays_bounded() {
        let queue = FrameQueue::new(3);
        queue.push(Item::Control("start"));
        queue.push(Item::Control("mark"));
        queue.push(Item::Control("mark"));

        assert_eq!(queue.push(Item::Control("mark")), PushOutcome::Rejected);
        assert_eq!(queue.push(Item::Frame(1)), PushOutcome::Rejected);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);

        // Once a slot frees up, items are accepted again.
        assert_eq!(queue.pop().await, Some(Item::Control("start")));
        assert_eq!(queue.push(Item::Control("stop")), PushOutcome::Queued);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_zero_capacity_still_holds_newest() {
        let queue: FrameQueue<Item> = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(Item::Frame(1));
        assert_eq!(queue.push(Item::Frame(2)), PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 1);
    }
}
