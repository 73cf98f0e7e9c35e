//! Bounded blocking FIFO queue.
//!
//! Backs both the `queue` capability (sized by the caller) and the named
//! `pipe` capability (fixed capacity, shared by name).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::sync::lock;

/// An item owned by the queue between `put` and `poll`/`drain`.
#[derive(Debug)]
struct QueueItem<T> {
    value: T,
    enqueued_at: Instant,
}

/// Fixed-capacity FIFO channel with deadline-bounded blocking.
///
/// `put` waits for space, `poll` and `drain` wait for items. A timed-out
/// `put` never enqueues; a timed-out `poll` returns `None`.
#[derive(Debug)]
pub struct BoundedBlockingQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<QueueItem<T>>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedBlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Age of the item at the head of the queue.
    pub fn oldest_age(&self) -> Option<Duration> {
        lock(&self.items).front().map(|item| item.enqueued_at.elapsed())
    }

    /// Enqueue `value`, waiting for space until `deadline`.
    pub fn put(&self, value: T, deadline: &Deadline) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::exhausted("queue has zero capacity"));
        }

        let capacity = self.capacity;
        let (mut items, ready) =
            deadline.wait_while(&self.not_full, lock(&self.items), |items| {
                items.len() >= capacity
            });
        if !ready {
            return Err(Error::timeout("put into queue"));
        }

        items.push_back(QueueItem {
            value,
            enqueued_at: Instant::now(),
        });
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the oldest item, waiting until `deadline` for one to arrive.
    pub fn poll(&self, deadline: &Deadline) -> Option<T> {
        let (mut items, ready) =
            deadline.wait_while(&self.not_empty, lock(&self.items), |items| items.is_empty());
        if !ready {
            return None;
        }

        let item = items.pop_front();
        drop(items);
        self.not_full.notify_one();
        item.map(|item| item.value)
    }

    /// Wait until at least one item is available, then take up to `max`
    /// items that are already queued without waiting for more.
    pub fn drain(&self, max: usize, deadline: &Deadline) -> Vec<T> {
        if max == 0 {
            return Vec::new();
        }

        let (mut items, ready) =
            deadline.wait_while(&self.not_empty, lock(&self.items), |items| items.is_empty());
        if !ready {
            return Vec::new();
        }

        let count = max.min(items.len());
        let batch: Vec<T> = items.drain(..count).map(|item| item.value).collect();
        drop(items);
        self.not_full.notify_all();
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ms(millis: i64) -> Deadline {
        Deadline::from_timeout_ms(millis)
    }

    #[test]
    fn fifo_across_put_poll_drain() {
        let queue = BoundedBlockingQueue::new(8);
        for i in 0..6 {
            queue.put(i, &ms(0)).unwrap();
        }
        assert_eq!(queue.poll(&ms(0)), Some(0));
        assert_eq!(queue.drain(3, &ms(0)), vec![1, 2, 3]);
        queue.put(6, &ms(0)).unwrap();
        assert_eq!(queue.drain(10, &ms(0)), vec![4, 5, 6]);
        assert!(queue.is_empty());
    }

    #[test]
    fn capacity_two_scenario() {
        let queue = BoundedBlockingQueue::new(2);
        queue.put("A", &ms(1000)).unwrap();
        queue.put("B", &ms(1000)).unwrap();

        let start = Instant::now();
        let err = queue.put("C", &ms(100)).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.poll(&ms(0)), Some("A"));
        assert_eq!(queue.poll(&ms(0)), Some("B"));
        assert_eq!(queue.poll(&ms(0)), None);
    }

    #[test]
    fn poll_timeout_returns_none() {
        let queue: BoundedBlockingQueue<i32> = BoundedBlockingQueue::new(1);
        let start = Instant::now();
        assert_eq!(queue.poll(&ms(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn drain_zero_and_timeout_return_empty() {
        let queue: BoundedBlockingQueue<i32> = BoundedBlockingQueue::new(4);
        queue.put(1, &ms(0)).unwrap();
        assert!(queue.drain(0, &ms(0)).is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(5, &ms(0)), vec![1]);
        assert!(queue.drain(5, &ms(20)).is_empty());
    }

    #[test]
    fn zero_capacity_is_exhausted() {
        let queue = BoundedBlockingQueue::new(0);
        let err = queue.put(1, &Deadline::never()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));
    }

    #[test]
    fn blocked_put_proceeds_after_poll() {
        let queue = Arc::new(BoundedBlockingQueue::new(1));
        queue.put(1, &ms(0)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(2, &ms(5_000)))
        };

        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.poll(&ms(0)), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.poll(&ms(1_000)), Some(2));
    }

    #[test]
    fn blocked_poll_wakes_on_put() {
        let queue = Arc::new(BoundedBlockingQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.drain(4, &ms(5_000)))
        };

        thread::sleep(Duration::from_millis(30));
        queue.put("job", &ms(0)).unwrap();
        assert_eq!(consumer.join().unwrap(), vec!["job"]);
    }

    #[test]
    fn unbounded_wait_respects_cancel() {
        let queue: Arc<BoundedBlockingQueue<i32>> = Arc::new(BoundedBlockingQueue::new(1));
        let token = crate::deadline::CancelToken::new();
        let deadline = Deadline::never().with_cancel(token.clone());

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.poll(&deadline))
        };
        thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn oldest_age_tracks_head() {
        let queue = BoundedBlockingQueue::new(2);
        assert!(queue.oldest_age().is_none());
        queue.put(1, &ms(0)).unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(queue.oldest_age().unwrap() >= Duration::from_millis(10));
    }
}
