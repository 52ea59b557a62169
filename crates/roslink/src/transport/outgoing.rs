// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outgoing message fan-out.
//!
//! One [`OutgoingQueue`] per publisher. A `put` serializes the message once,
//! updates the latched slot when latching is enabled, and enqueues the framed
//! bytes into every attached peer's outbound ring (drop-oldest, capacity
//! [`OUTGOING_RING_CAPACITY`]). A dedicated writer thread per peer drains its
//! ring onto the socket; a write failure silently detaches that peer.
//!
//! The channel set and the latched slot live under one mutex, held only for
//! set updates and ring hand-off, never across socket I/O. Attaching a peer
//! and fanning out a message are therefore atomic with respect to each other:
//! a peer attached before a `put` returns sees that message exactly once,
//! either via the latched enqueue or via the fan-out, never both.

use std::marker::PhantomData;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;

use crate::config::OUTGOING_RING_CAPACITY;
use crate::message::{CodecError, Message};
use crate::queue::CircularBlockingQueue;
use crate::transport::frame;

/// Fan-out queue feeding every subscriber connection of one publisher.
pub struct OutgoingQueue<M: Message> {
    shared: Arc<Shared>,
    _marker: PhantomData<fn(&M)>,
}

struct Shared {
    /// Short label for thread names and logs (the topic name).
    label: String,
    state: Mutex<State>,
}

struct State {
    channels: Vec<Arc<SenderChannel>>,
    latched: Option<Arc<Vec<u8>>>,
    latch_enabled: bool,
    closed: bool,
}

struct SenderChannel {
    id: String,
    ring: CircularBlockingQueue<Arc<Vec<u8>>>,
    /// Clone kept for shutdown; the writer thread owns the other clone.
    stream: TcpStream,
}

impl SenderChannel {
    fn close(&self) {
        self.ring.close();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl<M: Message> OutgoingQueue<M> {
    /// Create a fan-out queue. `label` names the topic in logs and thread
    /// names; `latch_enabled` sets the initial latch mode.
    pub fn new(label: impl Into<String>, latch_enabled: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                state: Mutex::new(State {
                    channels: Vec::new(),
                    latched: None,
                    latch_enabled,
                    closed: false,
                }),
            }),
            _marker: PhantomData,
        }
    }

    /// Serialize `message` once and fan it out to every attached peer.
    pub fn put(&self, message: &M) -> Result<(), CodecError> {
        let mut body = Vec::new();
        message.encode(&mut body)?;
        let framed = Arc::new(frame::encode(&body));

        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(());
        }
        if state.latch_enabled {
            state.latched = Some(Arc::clone(&framed));
        }
        for channel in &state.channels {
            channel.ring.put(Arc::clone(&framed));
        }
        Ok(())
    }

    /// Attach a peer connection under `id` and start its writer thread.
    ///
    /// Idempotent per id: a second attach with the same id is ignored and
    /// reported as `false`. When latching is enabled and a latched value
    /// exists it is enqueued to the new peer ahead of any future `put`.
    pub fn add_channel(&self, id: impl Into<String>, stream: TcpStream) -> std::io::Result<bool> {
        let id = id.into();
        let writer_stream = stream.try_clone()?;

        let channel = {
            let mut state = self.shared.state.lock();
            if state.closed {
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(false);
            }
            if state.channels.iter().any(|c| c.id == id) {
                return Ok(false);
            }

            let channel = Arc::new(SenderChannel {
                id,
                ring: CircularBlockingQueue::new(OUTGOING_RING_CAPACITY),
                stream,
            });
            if state.latch_enabled {
                if let Some(latched) = &state.latched {
                    channel.ring.put(Arc::clone(latched));
                }
            }
            state.channels.push(Arc::clone(&channel));
            channel
        };

        let shared = Arc::downgrade(&self.shared);
        let name = format!("pub-writer-{}", self.shared.label);
        thread::Builder::new()
            .name(name)
            .spawn(move || writer_loop(writer_stream, channel, shared))?;
        Ok(true)
    }

    /// Detach and close the peer attached under `id`.
    pub fn remove_channel(&self, id: &str) {
        if let Some(channel) = Shared::take_channel(&self.shared, id) {
            channel.close();
        }
    }

    /// Enable or disable latch mode. Disabling clears the latched value.
    pub fn set_latch_mode(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        state.latch_enabled = enabled;
        if !enabled {
            state.latched = None;
        }
    }

    /// Current latch mode.
    pub fn latch_mode(&self) -> bool {
        self.shared.state.lock().latch_enabled
    }

    /// True when a latched value is held.
    pub fn has_latched_message(&self) -> bool {
        self.shared.state.lock().latched.is_some()
    }

    /// Number of attached peers.
    pub fn channel_count(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    /// Detach every peer and reject future attaches.
    pub fn close(&self) {
        let channels = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.latched = None;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.close();
        }
    }
}

impl<M: Message> Drop for OutgoingQueue<M> {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn take_channel(shared: &Arc<Self>, id: &str) -> Option<Arc<SenderChannel>> {
        let mut state = shared.state.lock();
        let index = state.channels.iter().position(|c| c.id == id)?;
        Some(state.channels.swap_remove(index))
    }
}

/// Drains one peer's ring onto its socket until the ring closes or a write
/// fails. Failure detaches the peer from the owning queue, if it still
/// exists.
fn writer_loop(mut stream: TcpStream, channel: Arc<SenderChannel>, shared: Weak<Shared>) {
    use std::io::Write;

    while let Some(framed) = channel.ring.take() {
        if let Err(e) = stream.write_all(&framed) {
            if let Some(shared) = shared.upgrade() {
                debug!(
                    "[{}] peer {} write failed, detaching: {}",
                    shared.label, channel.id, e
                );
                if let Some(channel) = Shared::take_channel(&shared, &channel.id) {
                    channel.close();
                }
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, TypeDescriptor};
    use crate::transport::frame::read_frame;
    use std::net::TcpListener;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample(String);

    impl Message for Sample {
        fn descriptor() -> &'static TypeDescriptor {
            static DESC: TypeDescriptor = TypeDescriptor {
                type_name: "test_msgs/Sample",
                definition: "string data\n",
                md5sum: "992ce8a1687cec8c8bd883ec73ca41d1",
            };
            &DESC
        }

        fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
            message::encode_string(&self.0, buf);
            Ok(())
        }

        fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
            let mut pos = 0;
            Ok(Self(message::decode_string(bytes, &mut pos)?))
        }
    }

    fn decode_sample(framed: &[u8]) -> Sample {
        Sample::decode(framed).unwrap()
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_attached_peer_receives_in_order() {
        let queue = OutgoingQueue::<Sample>::new("/chatter", false);
        let (tx_side, mut rx_side) = loopback_pair();
        assert!(queue.add_channel("peer-1", tx_side).unwrap());

        for i in 0..5 {
            queue.put(&Sample(format!("msg-{}", i))).unwrap();
        }

        rx_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for i in 0..5 {
            let body = read_frame(&mut rx_side, 1024).unwrap();
            assert_eq!(decode_sample(&body), Sample(format!("msg-{}", i)));
        }
    }

    #[test]
    fn test_add_channel_is_idempotent() {
        let queue = OutgoingQueue::<Sample>::new("/chatter", false);
        let (a, _keep_a) = loopback_pair();
        let (b, _keep_b) = loopback_pair();

        assert!(queue.add_channel("peer-1", a).unwrap());
        assert!(!queue.add_channel("peer-1", b).unwrap());
        assert_eq!(queue.channel_count(), 1);
    }

    #[test]
    fn test_latched_value_reaches_late_peer() {
        let queue = OutgoingQueue::<Sample>::new("/map", true);
        queue.put(&Sample("the map".into())).unwrap();
        assert!(queue.has_latched_message());

        let (tx_side, mut rx_side) = loopback_pair();
        queue.add_channel("late-peer", tx_side).unwrap();

        rx_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let body = read_frame(&mut rx_side, 1024).unwrap();
        assert_eq!(decode_sample(&body), Sample("the map".into()));
    }

    #[test]
    fn test_latch_keeps_most_recent_only() {
        let queue = OutgoingQueue::<Sample>::new("/map", true);
        queue.put(&Sample("old".into())).unwrap();
        queue.put(&Sample("new".into())).unwrap();

        let (tx_side, mut rx_side) = loopback_pair();
        queue.add_channel("late-peer", tx_side).unwrap();

        rx_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let body = read_frame(&mut rx_side, 1024).unwrap();
        assert_eq!(decode_sample(&body), Sample("new".into()));
    }

    #[test]
    fn test_disable_latch_clears_value() {
        let queue = OutgoingQueue::<Sample>::new("/map", true);
        queue.put(&Sample("cached".into())).unwrap();
        queue.set_latch_mode(false);
        assert!(!queue.has_latched_message());
        assert!(!queue.latch_mode());
    }

    #[test]
    fn test_remove_channel_stops_delivery() {
        let queue = OutgoingQueue::<Sample>::new("/chatter", false);
        let (tx_side, mut rx_side) = loopback_pair();
        queue.add_channel("peer-1", tx_side).unwrap();

        queue.put(&Sample("before".into())).unwrap();
        rx_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        read_frame(&mut rx_side, 1024).unwrap();

        queue.remove_channel("peer-1");
        assert_eq!(queue.channel_count(), 0);
        queue.put(&Sample("after".into())).unwrap();

        // The socket was shut down; the peer observes EOF, not a message.
        let result = read_frame(&mut rx_side, 1024);
        assert!(result.is_err());
    }

    #[test]
    fn test_close_rejects_future_attaches() {
        let queue = OutgoingQueue::<Sample>::new("/chatter", false);
        queue.close();
        let (stream, _keep) = loopback_pair();
        assert!(!queue.add_channel("peer-1", stream).unwrap());
    }
}
