//! Bounded drop-oldest channel
//!
//! The single buffering policy used between the capture loop and the relay:
//! a full channel evicts its oldest element instead of blocking the producer.
//! Live viewers care about freshness, not completeness.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Fixed-capacity FIFO queue that evicts the oldest entry on overflow
///
/// `put` never blocks and never fails. Readers either poll with
/// [`try_get`](Self::try_get) or wait a bounded time with
/// [`recv_timeout`](Self::recv_timeout). A capacity of 1 behaves as a
/// latest-value cell.
pub struct BoundedChannel<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> BoundedChannel<T> {
    /// Create a channel. A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Insert an item, evicting the oldest one if the channel is full.
    ///
    /// Returns `true` if an item was evicted.
    pub fn put(&self, item: T) -> bool {
        let evicted = {
            let mut queue = self.queue.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(item);
            evicted
        };

        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Take the oldest retained item without waiting
    pub fn try_get(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Take the oldest item, waiting at most `timeout` for one to arrive
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a put between the check
            // and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_get() {
                return Some(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_get();
            }
        }
    }

    /// Remove every retained item
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted by overflow since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain<T>(channel: &BoundedChannel<T>) -> Vec<T> {
        std::iter::from_fn(|| channel.try_get()).collect()
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let channel = BoundedChannel::new(4);
        for i in 1..=6 {
            channel.put(i);
            assert!(channel.len() <= 4);
        }
        assert_eq!(channel.dropped_count(), 2);
        assert_eq!(drain(&channel), vec![3, 4, 5, 6]);
        assert!(channel.try_get().is_none());
    }

    #[test]
    fn test_fifo_and_length_bound() {
        // Interleave puts and gets with a simple model of the expected queue
        let capacity = 5;
        let channel = BoundedChannel::new(capacity);
        let mut model = VecDeque::new();

        for step in 0u32..500 {
            if step % 7 == 3 || step % 11 == 0 {
                assert_eq!(channel.try_get(), model.pop_front());
            } else {
                if model.len() == capacity {
                    model.pop_front();
                }
                model.push_back(step);
                channel.put(step);
            }
            assert!(channel.len() <= capacity);
            assert_eq!(channel.len(), model.len());
        }
        assert_eq!(drain(&channel), model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_capacity_one_is_latest_value() {
        let channel = BoundedChannel::new(0);
        assert_eq!(channel.capacity(), 1);
        channel.put("a");
        channel.put("b");
        channel.put("c");
        assert_eq!(channel.try_get(), Some("c"));
        assert_eq!(channel.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_recv_timeout_empty() {
        let channel: BoundedChannel<u8> = BoundedChannel::new(2);
        let started = std::time::Instant::now();
        assert!(channel.recv_timeout(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_recv_timeout_wakes_on_put() {
        let channel = Arc::new(BoundedChannel::new(2));
        let producer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.put(42u32);
        });

        let item = channel.recv_timeout(Duration::from_secs(2)).await;
        assert_eq!(item, Some(42));
    }

    #[test]
    fn test_clear() {
        let channel = BoundedChannel::new(3);
        channel.put(1);
        channel.put(2);
        channel.clear();
        assert!(channel.is_empty());
        assert_eq!(channel.dropped_count(), 0);
    }

    #[test]
    fn test_recv_timeout_returns_buffered_item() {
        let channel = BoundedChannel::new(2);
        channel.put("a");
        assert_eq!(
            tokio_test::block_on(channel.recv_timeout(Duration::from_millis(5))),
            Some("a")
        );
        assert_eq!(
            tokio_test::block_on(channel.recv_timeout(Duration::from_millis(5))),
            None
        );
    }
}
