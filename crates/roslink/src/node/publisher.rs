// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher endpoint.
//!
//! The node's shared listener hands an inbound subscriber connection to the
//! topic's [`PublisherCore`], which validates the handshake, replies with the
//! topic declaration, and attaches the socket to the outgoing fan-out queue.
//! The reply is written before the attach, so a peer is never fanned out to
//! until it has the full declaration in hand.

use std::any::Any;
use std::net::TcpStream;
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::graph::{GraphName, TopicDeclaration};
use crate::message::Message;
use crate::sched::ListenerSet;
use crate::transport::header::{digests_compatible, fields, ConnectionHeader, HeaderError};
use crate::transport::OutgoingQueue;

use super::registration::RegistrationListener;
use super::{NodeInner, TopicEndpoint};

pub(crate) struct PublisherCore<M: Message> {
    declaration: TopicDeclaration,
    caller_id: GraphName,
    queue: OutgoingQueue<M>,
    registration_listeners: Arc<ListenerSet<dyn RegistrationListener>>,
}

impl<M: Message> PublisherCore<M> {
    pub fn new(
        declaration: TopicDeclaration,
        caller_id: GraphName,
        latch: bool,
        registration_listeners: Arc<ListenerSet<dyn RegistrationListener>>,
    ) -> Self {
        let queue = OutgoingQueue::new(declaration.name().to_string(), latch);
        Self {
            declaration,
            caller_id,
            queue,
            registration_listeners,
        }
    }

    fn reply_header(&self) -> ConnectionHeader {
        let mut header = ConnectionHeader::new();
        header.put(fields::CALLER_ID, self.caller_id.as_str());
        header.put(fields::TYPE, self.declaration.type_name());
        header.put(fields::MD5_CHECKSUM, self.declaration.md5sum());
        header.put(fields::MESSAGE_DEFINITION, self.declaration.definition());
        header.put(
            fields::LATCHING,
            if self.queue.latch_mode() { "1" } else { "0" },
        );
        header
    }
}

impl<M: Message> TopicEndpoint for PublisherCore<M> {
    fn declaration(&self) -> &TopicDeclaration {
        &self.declaration
    }

    fn attach(&self, stream: TcpStream, header: &ConnectionHeader) -> Result<()> {
        let theirs = header
            .get(fields::MD5_CHECKSUM)
            .ok_or(Error::MalformedHeader(HeaderError::MissingField(
                fields::MD5_CHECKSUM,
            )))?;

        if !digests_compatible(self.declaration.md5sum(), theirs) {
            // The rejection carries our digest so the peer can tell a schema
            // mismatch apart from a transport fault.
            let mut reply = ConnectionHeader::new();
            reply.put(
                fields::ERROR,
                format!(
                    "digest mismatch for {}: expected {}, got {}",
                    self.declaration.name(),
                    self.declaration.md5sum(),
                    theirs
                ),
            );
            reply.put(fields::MD5_CHECKSUM, self.declaration.md5sum());
            let mut stream = stream;
            let _ = reply.write_to(&mut stream);
            return Err(Error::HandshakeMismatch {
                expected: self.declaration.md5sum().to_string(),
                actual: theirs.to_string(),
            });
        }

        if header.flag(fields::TCP_NODELAY) {
            let _ = stream.set_nodelay(true);
        }

        let mut stream = stream;
        self.reply_header().write_to(&mut stream)?;

        // Steady-state writes must not inherit the handshake timeout.
        stream.set_write_timeout(None)?;
        stream.set_read_timeout(None)?;

        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let id = format!(
            "{}@{}",
            header.get(fields::CALLER_ID).unwrap_or("anonymous"),
            peer
        );
        info!("[{}] subscriber attached: {}", self.declaration.name(), id);
        self.queue.add_channel(id, stream)?;
        Ok(())
    }

    fn registration_listeners(&self) -> &Arc<ListenerSet<dyn RegistrationListener>> {
        &self.registration_listeners
    }

    fn close(&self) {
        self.queue.close();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle to a topic publication.
///
/// Cheap to clone; all clones publish through the same fan-out queue. The
/// publication stays registered until [`shutdown`](Publisher::shutdown) or
/// node shutdown.
pub struct Publisher<M: Message> {
    pub(crate) core: Arc<PublisherCore<M>>,
    pub(crate) node: Weak<NodeInner>,
}

impl<M: Message> std::fmt::Debug for Publisher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

impl<M: Message> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            node: Weak::clone(&self.node),
        }
    }
}

impl<M: Message> Publisher<M> {
    /// The published topic's name.
    pub fn topic_name(&self) -> &GraphName {
        self.core.declaration.name()
    }

    /// The topic declaration this publication advertises.
    pub fn declaration(&self) -> &TopicDeclaration {
        &self.core.declaration
    }

    /// Serialize `message` once and fan it out to every connected
    /// subscriber.
    pub fn publish(&self, message: &M) -> Result<()> {
        self.core.queue.put(message)?;
        Ok(())
    }

    /// Enable or disable latch mode.
    pub fn set_latch_mode(&self, enabled: bool) {
        self.core.queue.set_latch_mode(enabled);
    }

    /// Current latch mode.
    pub fn latch_mode(&self) -> bool {
        self.core.queue.latch_mode()
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.core.queue.channel_count()
    }

    /// Observe master registration lifecycle events.
    pub fn add_registration_listener(&self, listener: Arc<dyn RegistrationListener>) -> usize {
        self.core.registration_listeners.add(listener)
    }

    /// Remove a registration listener by id.
    pub fn remove_registration_listener(&self, id: usize) {
        self.core.registration_listeners.remove(id);
    }

    /// Tear the publication down: close every subscriber connection and
    /// enqueue the master unregistration.
    pub fn shutdown(&self) {
        if let Some(node) = self.node.upgrade() {
            node.unadvertise(self.core.declaration.name());
        } else {
            self.core.queue.close();
        }
    }
}
