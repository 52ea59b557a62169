// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incoming message pipeline.
//!
//! One [`IncomingQueue`] per subscriber connection. A receiver thread reads
//! wire frames, deserializes them, and feeds a bounded circular queue
//! (capacity [`INCOMING_QUEUE_CAPACITY`], drop-oldest); a dispatcher thread
//! drains the queue, records the latched value, and signals the listener set.
//! Per-connection delivery order matches wire order; listeners never run on
//! the dispatcher thread, so a slow listener only delays itself.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::{INCOMING_QUEUE_CAPACITY, MAX_FRAME_SIZE};
use crate::message::Message;
use crate::queue::CircularBlockingQueue;
use crate::sched::ListenerSet;
use crate::transport::frame;

/// Receives messages dispatched from a subscriber connection.
pub trait MessageListener<M>: Send + Sync {
    /// Called once per dispatched message, serialized per listener.
    fn on_message(&self, message: M);
}

impl<M, F> MessageListener<M> for F
where
    F: Fn(M) + Send + Sync,
{
    fn on_message(&self, message: M) {
        self(message)
    }
}

/// Per-connection receive/dispatch pipeline.
pub struct IncomingQueue<M: Message> {
    queue: Arc<CircularBlockingQueue<M>>,
    latched: Arc<Mutex<Option<M>>>,
    latch_enabled: AtomicBool,
    /// Clone kept to unblock the receiver on shutdown.
    stream: TcpStream,
    receiver: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Message> IncomingQueue<M> {
    /// Start the pipeline on an established, handshaken connection.
    ///
    /// `listeners` is the subscriber-level set shared across connections;
    /// `latch_enabled` reflects the publisher's `latching` header flag, and
    /// `label` names the connection in thread names and logs.
    pub fn start(
        stream: TcpStream,
        listeners: Arc<ListenerSet<dyn MessageListener<M>>>,
        latch_enabled: bool,
        label: impl Into<String>,
    ) -> std::io::Result<Self> {
        let label = label.into();
        // Handshake timeouts must not bleed into steady-state reads.
        stream.set_read_timeout(None)?;

        let queue = Arc::new(CircularBlockingQueue::new(INCOMING_QUEUE_CAPACITY));
        let latched = Arc::new(Mutex::new(None));

        let receiver = {
            let mut stream = stream.try_clone()?;
            let queue = Arc::clone(&queue);
            let label = label.clone();
            thread::Builder::new()
                .name(format!("sub-reader-{}", label))
                .spawn(move || loop {
                    let body = match frame::read_frame(&mut stream, MAX_FRAME_SIZE) {
                        Ok(body) => body,
                        Err(e) => {
                            debug!("[{}] connection closed: {}", label, e);
                            queue.close();
                            return;
                        }
                    };
                    match M::decode(&body) {
                        Ok(message) => queue.put(message),
                        Err(e) => {
                            // Undecodable peer data is a transport fault.
                            warn!("[{}] dropping connection, decode failed: {}", label, e);
                            queue.close();
                            return;
                        }
                    }
                })?
        };

        let dispatcher = {
            let queue = Arc::clone(&queue);
            let latched = Arc::clone(&latched);
            thread::Builder::new()
                .name(format!("sub-dispatch-{}", label))
                .spawn(move || {
                    while let Some(message) = queue.take() {
                        *latched.lock() = Some(message.clone());
                        listeners.signal(move |listener| listener.on_message(message.clone()));
                    }
                })?
        };

        Ok(Self {
            queue,
            latched,
            latch_enabled: AtomicBool::new(latch_enabled),
            stream,
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// True when the publisher latches this connection.
    pub fn latch_enabled(&self) -> bool {
        self.latch_enabled.load(Ordering::Relaxed)
    }

    /// Most recent dispatched message, if any.
    pub fn latched_message(&self) -> Option<M> {
        self.latched.lock().clone()
    }

    /// Adjust the buffer capacity (oldest elements dropped to fit).
    pub fn set_limit(&self, limit: usize) {
        self.queue.set_limit(limit);
    }

    /// Current buffer capacity.
    pub fn limit(&self) -> usize {
        self.queue.limit()
    }

    /// True once the connection has terminated.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Cancel the pipeline: close the socket, discard undelivered messages,
    /// and join both threads.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.queue.close();
        for handle in [
            self.receiver.lock().take(),
            self.dispatcher.lock().take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }
    }
}

impl<M: Message> Drop for IncomingQueue<M> {
    fn drop(&mut self) {
        // Threads detach if shutdown was never called; closing the socket
        // and queue makes both exit promptly.
        let _ = self.stream.shutdown(Shutdown::Both);
        self.queue.close();
    }
}
