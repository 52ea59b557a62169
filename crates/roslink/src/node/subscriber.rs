// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber endpoint and publisher-connection manager.
//!
//! The manager reconciles the set of open connections against the
//! authoritative publisher list: the initial master registration response
//! first, then every `publisherUpdate` pushed through the node's directory
//! endpoint. Publishers are keyed by their slave URI; at most one connection
//! and at most one in-flight connect task exist per publisher, and updates
//! replace the target set atomically.
//!
//! A connect task walks the handshake: `requestTopic` over the publisher's
//! directory endpoint, TCP dial, header exchange, digest check (exact or
//! wildcard `*` on either side), then hands the socket to a fresh
//! [`IncomingQueue`]. Failures tear down only that connection; the publisher
//! returns when the next master update re-adds it.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::config::{CONNECT_TIMEOUT, DIRECTORY_RPC_TIMEOUT, HANDSHAKE_TIMEOUT, MAX_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::graph::{GraphName, TopicDeclaration};
use crate::master::unwrap_triple;
use crate::message::Message;
use crate::sched::{ListenerSet, Scheduler};
use crate::transport::header::{digests_compatible, fields, ConnectionHeader};
use crate::transport::{IncomingQueue, MessageListener};
use crate::xmlrpc::{self, Value};

use super::registration::RegistrationListener;
use super::{NodeInner, SubscriptionEndpoint};

/// Observes connection-level events on a subscription.
pub trait ConnectionEventListener: Send + Sync {
    /// A publisher connection completed its handshake.
    fn on_publisher_connected(&self, _publisher_uri: &str) {}
    /// A connect attempt or live connection failed.
    fn on_connection_error(&self, _publisher_uri: &str, _error: &Error) {}
}

pub(crate) struct SubscriberCore<M: Message> {
    declaration: TopicDeclaration,
    caller_id: GraphName,
    scheduler: Scheduler,
    listeners: Arc<ListenerSet<dyn MessageListener<M>>>,
    event_listeners: Arc<ListenerSet<dyn ConnectionEventListener>>,
    registration_listeners: Arc<ListenerSet<dyn RegistrationListener>>,
    state: Mutex<ManagerState<M>>,
    /// Authoritative publisher set, replaced wholesale per update.
    target: ArcSwap<Vec<String>>,
    closed: AtomicBool,
}

struct ManagerState<M: Message> {
    connections: HashMap<String, Arc<IncomingQueue<M>>>,
    /// Publisher URIs with a connect task in flight; duplicates coalesce.
    pending: HashSet<String>,
}

impl<M: Message> SubscriberCore<M> {
    pub fn new(declaration: TopicDeclaration, caller_id: GraphName, scheduler: Scheduler) -> Self {
        Self {
            declaration,
            caller_id,
            listeners: Arc::new(ListenerSet::new(scheduler.clone())),
            event_listeners: Arc::new(ListenerSet::new(scheduler.clone())),
            registration_listeners: Arc::new(ListenerSet::new(scheduler.clone())),
            scheduler,
            state: Mutex::new(ManagerState {
                connections: HashMap::new(),
                pending: HashSet::new(),
            }),
            target: ArcSwap::from_pointee(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Reconcile open connections against `target`.
    pub fn reconcile(self: &Arc<Self>, target: Vec<String>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut deduped: Vec<String> = Vec::with_capacity(target.len());
        for uri in target {
            if !deduped.contains(&uri) {
                deduped.push(uri);
            }
        }

        let (to_add, removed) = {
            let mut state = self.state.lock();

            let stale: Vec<String> = state
                .connections
                .keys()
                .filter(|uri| !deduped.contains(*uri))
                .cloned()
                .collect();
            let removed: Vec<Arc<IncomingQueue<M>>> = stale
                .iter()
                .filter_map(|uri| state.connections.remove(uri))
                .collect();

            let to_add: Vec<String> = deduped
                .iter()
                .filter(|uri| {
                    !state.connections.contains_key(*uri) && !state.pending.contains(*uri)
                })
                .cloned()
                .collect();
            for uri in &to_add {
                state.pending.insert(uri.clone());
            }

            self.target.store(Arc::new(deduped));
            (to_add, removed)
        };

        debug!(
            "[{}] reconcile: +{} -{}",
            self.declaration.name(),
            to_add.len(),
            removed.len()
        );

        // Socket teardown happens outside the state lock.
        for connection in removed {
            connection.shutdown();
        }
        for uri in to_add {
            let core = Arc::clone(self);
            self.scheduler.spawn(move || core.connect(uri));
        }
    }

    /// One connect task per publisher URI.
    fn connect(self: Arc<Self>, uri: String) {
        let outcome = self.dial(&uri);

        let mut state = self.state.lock();
        state.pending.remove(&uri);

        match outcome {
            Ok((stream, latching)) => {
                let wanted = !self.closed.load(Ordering::Acquire)
                    && self.target.load().contains(&uri)
                    && !state.connections.contains_key(&uri);
                if !wanted {
                    drop(state);
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
                let label = self.declaration.name().to_string();
                match IncomingQueue::start(stream, Arc::clone(&self.listeners), latching, label) {
                    Ok(queue) => {
                        state.connections.insert(uri.clone(), Arc::new(queue));
                        drop(state);
                        info!("[{}] connected to publisher {}", self.declaration.name(), uri);
                        self.event_listeners
                            .signal(move |l| l.on_publisher_connected(&uri));
                    }
                    Err(e) => {
                        drop(state);
                        let error = Arc::new(Error::Transport(e));
                        warn!(
                            "[{}] failed to start pipeline for {}: {}",
                            self.declaration.name(),
                            uri,
                            error
                        );
                        self.event_listeners
                            .signal(move |l| l.on_connection_error(&uri, &error));
                    }
                }
            }
            Err(e) => {
                drop(state);
                let error = Arc::new(e);
                warn!(
                    "[{}] connect to publisher {} failed: {}",
                    self.declaration.name(),
                    uri,
                    error
                );
                self.event_listeners
                    .signal(move |l| l.on_connection_error(&uri, &error));
            }
        }
    }

    /// `requestTopic` negotiation, TCP dial, and header exchange.
    fn dial(&self, publisher_uri: &str) -> Result<(TcpStream, bool)> {
        let (host, port) = self.request_topic(publisher_uri)?;

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(Error::Transport)?
            .next()
            .ok_or_else(|| Error::InvalidUri(format!("{}:{}", host, port)))?;
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut header = self.declaration.to_connection_header();
        header.put(fields::CALLER_ID, self.caller_id.as_str());
        header.write_to(&mut stream)?;

        let reply = ConnectionHeader::read_from(&mut stream, MAX_HEADER_SIZE)??;

        // Digest first: a rejection caused by schema disagreement must
        // surface as a handshake mismatch, not a generic transport fault.
        if let Some(theirs) = reply.get(fields::MD5_CHECKSUM) {
            if !digests_compatible(self.declaration.md5sum(), theirs) {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(Error::HandshakeMismatch {
                    expected: self.declaration.md5sum().to_string(),
                    actual: theirs.to_string(),
                });
            }
        }
        if let Some(message) = reply.get(fields::ERROR) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(Error::Transport(std::io::Error::other(format!(
                "publisher rejected handshake: {}",
                message
            ))));
        }
        if !reply.contains(fields::MD5_CHECKSUM) {
            return Err(Error::MalformedHeader(
                crate::transport::HeaderError::MissingField(fields::MD5_CHECKSUM),
            ));
        }

        Ok((stream, reply.flag(fields::LATCHING)))
    }

    /// Ask the publisher's directory endpoint where the topic is served.
    fn request_topic(&self, publisher_uri: &str) -> Result<(String, u16)> {
        let params = [
            Value::string(self.caller_id.as_str()),
            Value::string(self.declaration.name().as_str()),
            Value::Array(vec![Value::Array(vec![Value::string("TCPROS")])]),
        ];
        let response = xmlrpc::call(
            publisher_uri,
            "requestTopic",
            &params,
            DIRECTORY_RPC_TIMEOUT,
        )
        .map_err(|e| match e {
            // A peer that refuses or drops TCP is a transport fault, not a
            // directory failure.
            xmlrpc::XmlRpcError::Io(io) => Error::Transport(io),
            other => Error::Master(other.into()),
        })?;
        let value = unwrap_triple(response).map_err(Error::Master)?;

        match value.as_array() {
            Some([protocol, host, port])
                if protocol.as_str() == Some("TCPROS") =>
            {
                let host = host
                    .as_str()
                    .ok_or_else(|| Error::InvalidUri("non-string host".to_string()))?;
                let port = port
                    .as_i32()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| Error::InvalidUri("bad port".to_string()))?;
                Ok((host.to_string(), port))
            }
            _ => Err(Error::InvalidUri(format!(
                "unusable requestTopic result: {:?}",
                value
            ))),
        }
    }

    /// Register a listener, delivering latched values from already-open
    /// connections ahead of future messages.
    pub fn add_listener(&self, listener: Arc<dyn MessageListener<M>>) -> usize {
        let latched: Vec<M> = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .filter(|queue| queue.latch_enabled())
                .filter_map(|queue| queue.latched_message())
                .collect()
        };

        if latched.is_empty() {
            self.listeners.add(listener)
        } else {
            self.listeners.add_with_initial(
                listener,
                Box::new(move |l| {
                    for message in latched {
                        l.on_message(message);
                    }
                }),
            )
        }
    }

    pub fn remove_listener(&self, id: usize) {
        self.listeners.remove(id);
    }

    pub fn connected_publishers(&self) -> Vec<String> {
        self.state.lock().connections.keys().cloned().collect()
    }
}

impl<M: Message> SubscriptionEndpoint for SubscriberCore<M> {
    fn declaration(&self) -> &TopicDeclaration {
        &self.declaration
    }

    fn update_publishers(self: Arc<Self>, uris: Vec<String>) {
        self.reconcile(uris);
    }

    fn registration_listeners(&self) -> &Arc<ListenerSet<dyn RegistrationListener>> {
        &self.registration_listeners
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let connections: Vec<Arc<IncomingQueue<M>>> = {
            let mut state = self.state.lock();
            state.pending.clear();
            state.connections.drain().map(|(_, q)| q).collect()
        };
        self.target.store(Arc::new(Vec::new()));
        for connection in connections {
            connection.shutdown();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle to a topic subscription.
///
/// Cheap to clone; all clones share the connection manager and listener set.
pub struct Subscriber<M: Message> {
    pub(crate) core: Arc<SubscriberCore<M>>,
    pub(crate) node: Weak<NodeInner>,
}

impl<M: Message> Clone for Subscriber<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            node: Weak::clone(&self.node),
        }
    }
}

impl<M: Message> Subscriber<M> {
    /// The subscribed topic's name.
    pub fn topic_name(&self) -> &GraphName {
        self.core.declaration.name()
    }

    /// Register a message listener. When a latched value is already held it
    /// is delivered to this listener before any future message.
    pub fn add_listener(&self, listener: Arc<dyn MessageListener<M>>) -> usize {
        self.core.add_listener(listener)
    }

    /// Register a closure as message listener.
    pub fn on_message<F>(&self, callback: F) -> usize
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        self.core.add_listener(Arc::new(callback))
    }

    /// Remove a message listener by id.
    pub fn remove_listener(&self, id: usize) {
        self.core.remove_listener(id);
    }

    /// Observe connection-level events (connects, transport and handshake
    /// failures).
    pub fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) -> usize {
        self.core.event_listeners.add(listener)
    }

    /// Observe master registration lifecycle events.
    pub fn add_registration_listener(&self, listener: Arc<dyn RegistrationListener>) -> usize {
        self.core.registration_listeners.add(listener)
    }

    /// Slave URIs of the publishers currently connected.
    pub fn connected_publishers(&self) -> Vec<String> {
        self.core.connected_publishers()
    }

    /// Feed a publisher set update directly to the connection manager, as
    /// the master would via `publisherUpdate`.
    pub fn update_publishers(&self, uris: Vec<String>) {
        self.core.reconcile(uris);
    }

    /// Tear the subscription down: drop every connection and enqueue the
    /// master unregistration.
    pub fn shutdown(&self) {
        if let Some(node) = self.node.upgrade() {
            node.unsubscribe(self.core.declaration.name());
        } else {
            self.core.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, CodecError, TypeDescriptor};

    #[derive(Debug, Clone, PartialEq)]
    struct Word(String);

    impl Message for Word {
        fn descriptor() -> &'static TypeDescriptor {
            static DESC: TypeDescriptor = TypeDescriptor {
                type_name: "test_msgs/Word",
                definition: "string data\n",
                md5sum: "992ce8a1687cec8c8bd883ec73ca41d1",
            };
            &DESC
        }

        fn encode(&self, buf: &mut Vec<u8>) -> std::result::Result<(), CodecError> {
            message::encode_string(&self.0, buf);
            Ok(())
        }

        fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
            let mut pos = 0;
            Ok(Self(message::decode_string(bytes, &mut pos)?))
        }
    }

    fn core() -> (Arc<SubscriberCore<Word>>, Scheduler) {
        let scheduler = Scheduler::new(2);
        let declaration = TopicDeclaration::from_descriptor(
            GraphName::new("/words").unwrap(),
            Word::descriptor(),
        );
        (
            Arc::new(SubscriberCore::new(
                declaration,
                GraphName::new("/listener").unwrap(),
                scheduler.clone(),
            )),
            scheduler,
        )
    }

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..deadline_ms / 5 {
            if done() {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_unreachable_publisher_reports_transport_error() {
        let (core, scheduler) = core();

        struct Recorder(Mutex<Vec<crate::ErrorKind>>);
        impl ConnectionEventListener for Recorder {
            fn on_connection_error(&self, _uri: &str, error: &Error) {
                self.0.lock().push(error.kind());
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        core.event_listeners.add(recorder.clone());

        // Nothing listens on this port; requestTopic itself fails.
        core.reconcile(vec!["http://127.0.0.1:1/".to_string()]);

        assert!(wait_until(10_000, || !recorder.0.lock().is_empty()));
        assert_eq!(recorder.0.lock()[0], crate::ErrorKind::Transport);
        // The subscriber stays usable.
        assert!(core.connected_publishers().is_empty());
        assert!(core.state.lock().pending.is_empty());

        SubscriptionEndpoint::close(&*core);
        scheduler.shutdown();
    }

    #[test]
    fn test_reconcile_coalesces_duplicate_targets() {
        let (core, scheduler) = core();

        // Identical URIs in one update collapse into one pending connect.
        core.reconcile(vec![
            "http://127.0.0.1:1/".to_string(),
            "http://127.0.0.1:1/".to_string(),
        ]);
        assert!(core.state.lock().pending.len() <= 1);
        assert_eq!(core.target.load().len(), 1);

        SubscriptionEndpoint::close(&*core);
        scheduler.shutdown();
    }

    #[test]
    fn test_empty_target_clears_state() {
        let (core, scheduler) = core();
        core.reconcile(Vec::new());
        assert!(core.target.load().is_empty());
        assert!(core.connected_publishers().is_empty());

        SubscriptionEndpoint::close(&*core);
        scheduler.shutdown();
    }

    #[test]
    fn test_closed_manager_ignores_updates() {
        let (core, scheduler) = core();
        SubscriptionEndpoint::close(&*core);
        core.reconcile(vec!["http://127.0.0.1:1/".to_string()]);
        assert!(core.target.load().is_empty());
        assert!(core.state.lock().pending.is_empty());
        scheduler.shutdown();
    }
}
