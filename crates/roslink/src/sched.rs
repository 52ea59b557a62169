// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared worker pool and listener fan-out.
//!
//! The node owns one [`Scheduler`]; every short-lived unit of asynchronous
//! work (listener callbacks, connect tasks, registration events) runs on its
//! workers. Long-lived per-connection reader/writer loops get dedicated
//! threads instead - parking them on a fixed pool would starve it.
//!
//! [`ListenerSet`] implements the fan-out rule used throughout the runtime:
//! a signal captures a snapshot of the current listeners, then schedules one
//! unit of work per (listener, event). Per-listener delivery is serialized
//! FIFO, so a slow listener delays only itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

// ============================================================================
// Scheduler
// ============================================================================

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the node's shared worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a pool with `threads` workers.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Task>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("graph-worker-{}", index))
                .spawn(move || {
                    // Exits when every sender is dropped.
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            inner: Arc::new(SchedulerInner {
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
            }),
        }
    }

    /// Queue a unit of work. After shutdown the task is silently dropped;
    /// cancellation is not an error.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = self.inner.sender.lock().as_ref() {
            let _ = sender.send(Box::new(task));
        }
    }

    /// True until [`shutdown`](Self::shutdown) runs.
    pub fn is_running(&self) -> bool {
        self.inner.sender.lock().is_some()
    }

    /// Stop accepting work, let queued tasks finish, and join the workers.
    ///
    /// Safe to call more than once; callers on worker threads must not join
    /// themselves, so the join is skipped there.
    pub fn shutdown(&self) {
        let sender = self.inner.sender.lock().take();
        drop(sender);

        let current = thread::current().id();
        let mut workers = self.inner.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

// ============================================================================
// Listener fan-out
// ============================================================================

/// Copy-on-write collection of listeners with serialized per-listener
/// delivery.
///
/// `signal` snapshots the membership, so a listener removed mid-dispatch
/// never races with its own teardown, and enqueues one job per listener.
pub struct ListenerSet<L: ?Sized> {
    slots: ArcSwap<Vec<Arc<ListenerSlot<L>>>>,
    scheduler: Scheduler,
    next_id: AtomicUsize,
}

struct ListenerSlot<L: ?Sized> {
    id: usize,
    draining: AtomicBool,
    jobs: Mutex<VecDeque<Box<dyn FnOnce(&L) + Send>>>,
    listener: Arc<L>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    /// Create an empty set dispatching onto `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            slots: ArcSwap::from_pointee(Vec::new()),
            scheduler,
            next_id: AtomicUsize::new(1),
        }
    }

    /// Add a listener; the returned id removes it again.
    pub fn add(&self, listener: Arc<L>) -> usize {
        self.add_slot(listener, None)
    }

    /// Add a listener and deliver `initial` to it before any event signaled
    /// after this call - the latched-delivery primitive.
    pub fn add_with_initial(
        &self,
        listener: Arc<L>,
        initial: Box<dyn FnOnce(&L) + Send>,
    ) -> usize {
        self.add_slot(listener, Some(initial))
    }

    fn add_slot(&self, listener: Arc<L>, initial: Option<Box<dyn FnOnce(&L) + Send>>) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ListenerSlot {
            id,
            draining: AtomicBool::new(false),
            jobs: Mutex::new(VecDeque::new()),
            listener,
        });
        if let Some(job) = initial {
            slot.jobs.lock().push_back(job);
        }

        self.slots.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&slot));
            next
        });

        // The initial job must not wait for the next signal.
        if !slot.jobs.lock().is_empty() {
            slot.schedule(&self.scheduler);
        }
        id
    }

    /// Remove a listener by id. Jobs already queued for it still run.
    pub fn remove(&self, id: usize) {
        self.slots.rcu(|current| {
            current
                .iter()
                .filter(|slot| slot.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Deliver one event to every current listener.
    pub fn signal<F>(&self, event: F)
    where
        F: Fn(&L) + Send + Sync + 'static,
    {
        let event = Arc::new(event);
        let snapshot = self.slots.load_full();
        for slot in snapshot.iter() {
            let event = Arc::clone(&event);
            slot.jobs.lock().push_back(Box::new(move |l: &L| event(l)));
            slot.schedule(&self.scheduler);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    /// True when no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.slots.load().is_empty()
    }
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSlot<L> {
    fn schedule(self: &Arc<Self>, scheduler: &Scheduler) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            let slot = Arc::clone(self);
            scheduler.spawn(move || slot.drain());
        }
    }

    fn drain(&self) {
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(&self.listener),
                None => {
                    self.draining.store(false, Ordering::Release);
                    // A concurrent enqueue may have seen `draining` still set
                    // and skipped scheduling; reclaim the drain if so.
                    if self.jobs.lock().is_empty()
                        || self.draining.swap(true, Ordering::AcqRel)
                    {
                        return;
                    }
                }
            }
        }
    }
}
