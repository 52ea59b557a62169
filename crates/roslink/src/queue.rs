// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded circular blocking queue.
//!
//! FIFO with a runtime-adjustable capacity and a drop-oldest overwrite
//! policy: `put` never blocks and never fails - a full queue discards its
//! oldest element, so the producer never waits on a slow consumer. `take`
//! blocks until an element arrives or the queue is closed.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Single-consumer FIFO with capacity and drop-oldest overwrite.
pub struct CircularBlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    limit: usize,
    closed: bool,
    overwrites: u64,
}

impl<T> CircularBlockingQueue<T> {
    /// Create a queue holding at most `limit` elements. `limit` must be
    /// non-zero.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "queue limit must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(limit.min(64)),
                limit,
                closed: false,
                overwrites: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an element, discarding the oldest one when full.
    ///
    /// Never blocks. After [`close`](Self::close) the element is dropped.
    pub fn put(&self, value: T) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        while inner.items.len() >= inner.limit {
            inner.items.pop_front();
            inner.overwrites += 1;
        }
        inner.items.push_back(value);
        drop(inner);
        self.available.notify_one();
    }

    /// Remove and return the oldest element, blocking until one is available.
    ///
    /// Returns `None` once the queue is closed. A close discards buffered
    /// elements so shutdown is prompt.
    pub fn take(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(value) = inner.items.pop_front() {
                return Some(value);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Remove and return the oldest element without blocking.
    pub fn try_take(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.items.pop_front()
    }

    /// Adjust the capacity; if shrinking below the current size, oldest
    /// elements are dropped to fit. `limit` must be non-zero.
    pub fn set_limit(&self, limit: usize) {
        assert!(limit > 0, "queue limit must be non-zero");
        let mut inner = self.inner.lock();
        inner.limit = limit;
        while inner.items.len() > limit {
            inner.items.pop_front();
            inner.overwrites += 1;
        }
    }

    /// The current capacity.
    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }

    /// Number of buffered elements.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Number of elements discarded by the overwrite policy.
    pub fn overwrites(&self) -> u64 {
        self.inner.lock().overwrites
    }

    /// Close the queue: discard buffered elements and wake blocked takers,
    /// which observe `None`. Subsequent puts are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.items.clear();
        drop(inner);
        self.available.notify_all();
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Drain everything currently buffered, without blocking.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = CircularBlockingQueue::new(8);
        for i in 0..5 {
            queue.put(i);
        }
        for i in 0..5 {
            assert_eq!(queue.take(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overwrite_keeps_newest() {
        // Capacity k with n > k producers and no consumer leaves exactly the
        // last k elements.
        let queue = CircularBlockingQueue::new(3);
        for i in 0..10 {
            queue.put(i);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), vec![7, 8, 9]);
        assert_eq!(queue.overwrites(), 7);
    }

    #[test]
    fn test_set_limit_shrinks_from_oldest() {
        let queue = CircularBlockingQueue::new(8);
        for i in 0..6 {
            queue.put(i);
        }
        queue.set_limit(2);
        assert_eq!(queue.limit(), 2);
        assert_eq!(queue.drain(), vec![4, 5]);
    }

    #[test]
    fn test_take_blocks_until_put() {
        let queue = Arc::new(CircularBlockingQueue::new(4));
        let taker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };
        thread::sleep(Duration::from_millis(50));
        queue.put(99);
        assert_eq!(taker.join().unwrap(), Some(99));
    }

    #[test]
    fn test_close_wakes_blocked_taker() {
        let queue: Arc<CircularBlockingQueue<u32>> = Arc::new(CircularBlockingQueue::new(4));
        let taker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(taker.join().unwrap(), None);
        queue.put(1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_is_exactly_once() {
        let queue = Arc::new(CircularBlockingQueue::new(1024));
        for i in 0..1000u32 {
            queue.put(i);
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(v) = queue.try_take() {
                    seen.push(v);
                }
                seen
            }));
        }
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }
}
