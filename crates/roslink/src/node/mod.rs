// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node runtime.
//!
//! A [`Node`] is one process's membership in the graph: it owns the shared
//! worker pool, the master client, the directory-facing XML-RPC endpoint,
//! the shared topic/service listener, the registration worker, and the
//! endpoint registries. User code holds cheap handles - [`Publisher`],
//! [`Subscriber`], [`ServiceClient`], [`ServiceServer`] - and never touches
//! the wiring directly.
//!
//! ## Example
//!
//! ```rust,no_run
//! use roslink::Node;
//! # #[derive(Clone)] struct Scan;
//! # impl roslink::Message for Scan {
//! #     fn descriptor() -> &'static roslink::TypeDescriptor { unimplemented!() }
//! #     fn encode(&self, _: &mut Vec<u8>) -> Result<(), roslink::CodecError> { Ok(()) }
//! #     fn decode(_: &[u8]) -> Result<Self, roslink::CodecError> { Ok(Scan) }
//! # }
//!
//! # fn main() -> roslink::Result<()> {
//! let node = Node::builder("lidar_driver").build()?;
//! let scans = node.advertise::<Scan>("/scan", false)?;
//! scans.publish(&Scan)?;
//! node.shutdown();
//! # Ok(())
//! # }
//! ```

mod publisher;
mod registration;
mod service_client;
mod service_server;
mod slave;
mod subscriber;
mod tcpros;

pub use publisher::Publisher;
pub use registration::RegistrationListener;
pub use service_client::ServiceClient;
pub use service_server::{ServiceResponseBuilder, ServiceServer};
pub use subscriber::{ConnectionEventListener, Subscriber};

use std::any::Any;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::{DEFAULT_MASTER_URI, DEFAULT_WORKER_THREADS};
use crate::error::{Error, Result};
use crate::graph::{GraphName, ServiceDeclaration, ServiceId, TopicDeclaration};
use crate::master::MasterClient;
use crate::message::{Message, ServicePair};
use crate::sched::{ListenerSet, Scheduler};
use crate::time::{Clock, SystemClock};
use crate::transport::header::ConnectionHeader;
use crate::xmlrpc::XmlRpcServer;

use publisher::PublisherCore;
use registration::{RegistrationAction, RegistrationJob, Registrar};
use service_server::ServiceServerCore;
use slave::SlaveHandler;
use subscriber::SubscriberCore;
use tcpros::TcpRosServer;

// ============================================================================
// Endpoint handler kinds
// ============================================================================

/// A publication reachable through the shared listener.
pub(crate) trait TopicEndpoint: Send + Sync + 'static {
    fn declaration(&self) -> &TopicDeclaration;
    /// Validate the subscriber handshake, reply, and attach the socket.
    fn attach(&self, stream: TcpStream, header: &ConnectionHeader) -> Result<()>;
    fn registration_listeners(&self) -> &Arc<ListenerSet<dyn RegistrationListener>>;
    fn close(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A subscription fed by the connection manager.
pub(crate) trait SubscriptionEndpoint: Send + Sync + 'static {
    fn declaration(&self) -> &TopicDeclaration;
    /// Hand a new authoritative publisher set to the reconciler.
    fn update_publishers(self: Arc<Self>, uris: Vec<String>);
    fn registration_listeners(&self) -> &Arc<ListenerSet<dyn RegistrationListener>>;
    fn close(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A service served through the shared listener.
pub(crate) trait ServiceEndpoint: Send + Sync + 'static {
    fn declaration(&self) -> &ServiceDeclaration;
    /// Run the mirror handshake and the request loop on the caller's thread.
    fn serve(&self, stream: TcpStream, header: &ConnectionHeader);
    fn registration_listeners(&self) -> &Arc<ListenerSet<dyn RegistrationListener>>;
    fn close(&self);
}

// ============================================================================
// Node internals
// ============================================================================

pub(crate) struct NodeInner {
    name: GraphName,
    slave_uri: String,
    master: Arc<MasterClient>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    slave: XmlRpcServer,
    tcpros: TcpRosServer,
    registrar: Registrar,
    publishers: DashMap<GraphName, Arc<dyn TopicEndpoint>>,
    subscriptions: DashMap<GraphName, Arc<dyn SubscriptionEndpoint>>,
    services: DashMap<GraphName, Arc<dyn ServiceEndpoint>>,
    goal_count: AtomicU64,
    shutdown: AtomicBool,
}

impl NodeInner {
    pub(crate) fn master_uri(&self) -> String {
        self.master.master_uri().to_string()
    }

    pub(crate) fn topic_endpoint(&self, topic: &str) -> Option<Arc<dyn TopicEndpoint>> {
        let name = GraphName::new(topic).ok()?;
        self.publishers.get(&name).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn service_endpoint(&self, service: &str) -> Option<Arc<dyn ServiceEndpoint>> {
        let name = GraphName::new(service).ok()?;
        self.services.get(&name).map(|entry| Arc::clone(entry.value()))
    }

    /// Where the shared listener serves `topic`, if this node publishes it.
    pub(crate) fn topic_address(&self, topic: &str) -> Option<(String, u16)> {
        let name = GraphName::new(topic).ok()?;
        if self.publishers.contains_key(&name) {
            Some(self.tcpros.advertise_address())
        } else {
            None
        }
    }

    /// Route a `publisherUpdate` to the topic's connection manager.
    pub(crate) fn publisher_update(&self, topic: &str, uris: Vec<String>) -> bool {
        let Ok(name) = GraphName::new(topic) else {
            return false;
        };
        let Some(endpoint) = self.subscriptions.get(&name).map(|e| Arc::clone(e.value()))
        else {
            return false;
        };
        endpoint.update_publishers(uris);
        true
    }

    pub(crate) fn publications(&self) -> Vec<(String, String)> {
        self.publishers
            .iter()
            .map(|entry| entry.value().declaration().to_pair())
            .collect()
    }

    pub(crate) fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().declaration().to_pair())
            .collect()
    }

    pub(crate) fn unadvertise(&self, name: &GraphName) {
        if let Some((_, endpoint)) = self.publishers.remove(name) {
            endpoint.close();
            let master = Arc::clone(&self.master);
            let topic = name.clone();
            let slave_uri = self.slave_uri.clone();
            self.registrar.submit(RegistrationJob {
                label: format!("unregister publisher {}", name),
                action: RegistrationAction::Unregister,
                listeners: Arc::clone(endpoint.registration_listeners()),
                call: Box::new(move || {
                    master.unregister_publisher(&topic, &slave_uri).map(|_| ())
                }),
            });
        }
    }

    pub(crate) fn unsubscribe(&self, name: &GraphName) {
        if let Some((_, endpoint)) = self.subscriptions.remove(name) {
            endpoint.close();
            let master = Arc::clone(&self.master);
            let topic = name.clone();
            let slave_uri = self.slave_uri.clone();
            self.registrar.submit(RegistrationJob {
                label: format!("unregister subscriber {}", name),
                action: RegistrationAction::Unregister,
                listeners: Arc::clone(endpoint.registration_listeners()),
                call: Box::new(move || {
                    master.unregister_subscriber(&topic, &slave_uri).map(|_| ())
                }),
            });
        }
    }

    pub(crate) fn unadvertise_service(&self, name: &GraphName) {
        if let Some((_, endpoint)) = self.services.remove(name) {
            endpoint.close();
            let service_uri = endpoint
                .declaration()
                .id()
                .uri()
                .unwrap_or_default()
                .to_string();
            let master = Arc::clone(&self.master);
            let service = name.clone();
            self.registrar.submit(RegistrationJob {
                label: format!("unregister service {}", name),
                action: RegistrationAction::Unregister,
                listeners: Arc::clone(endpoint.registration_listeners()),
                call: Box::new(move || {
                    master.unregister_service(&service, &service_uri).map(|_| ())
                }),
            });
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("node {} shutting down", self.name);

        let topics: Vec<GraphName> = self.publishers.iter().map(|e| e.key().clone()).collect();
        for name in topics {
            self.unadvertise(&name);
        }
        let subscriptions: Vec<GraphName> =
            self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for name in subscriptions {
            self.unsubscribe(&name);
        }
        let services: Vec<GraphName> = self.services.iter().map(|e| e.key().clone()).collect();
        for name in services {
            self.unadvertise_service(&name);
        }

        // Drains the queued unregisters before exiting.
        self.registrar.shutdown();
        self.tcpros.shutdown();
        self.slave.shutdown();
        self.scheduler.shutdown();
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and starts a [`Node`].
pub struct NodeBuilder {
    name: String,
    master_uri: String,
    bind_host: String,
    advertise_host: String,
    worker_threads: usize,
    clock: Arc<dyn Clock>,
}

impl NodeBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            master_uri: DEFAULT_MASTER_URI.to_string(),
            bind_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            worker_threads: DEFAULT_WORKER_THREADS,
            clock: Arc::new(SystemClock),
        }
    }

    /// Directory (master) URI, `http://host:port/`.
    pub fn master_uri(mut self, uri: impl Into<String>) -> Self {
        self.master_uri = uri.into();
        self
    }

    /// Local address both servers bind to.
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Host name peers are told to connect to.
    pub fn advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    /// Worker-thread count of the shared scheduler.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Replace the wall clock (simulated time, tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the runtime: bind both servers, start the scheduler and the
    /// registration worker.
    pub fn build(self) -> Result<Node> {
        let name = GraphName::new(self.name)?;
        let scheduler = Scheduler::new(self.worker_threads);

        let slave_handler = Arc::new(SlaveHandler::new());
        let slave = XmlRpcServer::bind(
            &self.bind_host,
            &self.advertise_host,
            Arc::clone(&slave_handler) as Arc<dyn crate::xmlrpc::RpcHandler>,
        )?;
        let tcpros = TcpRosServer::bind(&self.bind_host, &self.advertise_host)?;
        let slave_uri = slave.uri().to_string();

        let master = Arc::new(MasterClient::new(self.master_uri, name.clone()));
        let registrar = Registrar::start()?;

        let inner = Arc::new(NodeInner {
            name: name.clone(),
            slave_uri,
            master,
            scheduler,
            clock: self.clock,
            slave,
            tcpros,
            registrar,
            publishers: DashMap::new(),
            subscriptions: DashMap::new(),
            services: DashMap::new(),
            goal_count: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        slave_handler.attach(Arc::downgrade(&inner));
        inner.tcpros.attach(Arc::downgrade(&inner));

        let (host, port) = inner.tcpros.advertise_address();
        info!(
            "node {} up: directory endpoint {}, transport {}:{}",
            name, inner.slave_uri, host, port
        );
        Ok(Node { inner })
    }
}

// ============================================================================
// Node
// ============================================================================

/// One process's membership in the graph.
///
/// Cheap to clone; the runtime stays up until [`shutdown`](Node::shutdown).
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start configuring a node named `name`.
    pub fn builder(name: &str) -> NodeBuilder {
        NodeBuilder::new(name)
    }

    /// The node's graph name.
    pub fn name(&self) -> &GraphName {
        &self.inner.name
    }

    /// URI of this node's directory-facing endpoint.
    pub fn slave_uri(&self) -> &str {
        &self.inner.slave_uri
    }

    /// The master client, for direct directory queries.
    pub fn master(&self) -> &MasterClient {
        &self.inner.master
    }

    /// A graph-unique goal id: node name, a monotonically increasing
    /// counter, and the injected clock's current time.
    pub fn generate_goal_id(&self) -> String {
        let count = self.inner.goal_count.fetch_add(1, Ordering::Relaxed) + 1;
        let stamp = self.inner.clock.now();
        format!("{}-{}-{}", self.inner.name, count, stamp)
    }

    /// True once shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Advertise a publication on `topic`.
    ///
    /// Advertising the same topic again with the same message type returns a
    /// handle to the existing publication; a different type is an error.
    pub fn advertise<M: Message>(&self, topic: &str, latch: bool) -> Result<Publisher<M>> {
        let name = GraphName::new(topic)?;

        match self.inner.publishers.entry(name.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(entry);
                let registered = existing.declaration().type_name().to_string();
                match existing.into_any().downcast::<PublisherCore<M>>() {
                    Ok(core) => Ok(Publisher {
                        core,
                        node: Arc::downgrade(&self.inner),
                    }),
                    Err(_) => Err(Error::TypeMismatch {
                        topic: name,
                        registered,
                        requested: M::descriptor().type_name.to_string(),
                    }),
                }
            }
            Entry::Vacant(entry) => {
                let declaration =
                    TopicDeclaration::from_descriptor(name.clone(), M::descriptor());
                let core = Arc::new(PublisherCore::<M>::new(
                    declaration.clone(),
                    self.inner.name.clone(),
                    latch,
                    Arc::new(ListenerSet::new(self.inner.scheduler.clone())),
                ));
                entry.insert(Arc::clone(&core) as Arc<dyn TopicEndpoint>);

                let master = Arc::clone(&self.inner.master);
                let slave_uri = self.inner.slave_uri.clone();
                self.inner.registrar.submit(RegistrationJob {
                    label: format!("register publisher {}", name),
                    action: RegistrationAction::Register,
                    listeners: Arc::clone(core.registration_listeners()),
                    call: Box::new(move || {
                        // The current subscriber list is informational;
                        // subscribers dial in through the shared listener.
                        master.register_publisher(&declaration, &slave_uri).map(|_| ())
                    }),
                });

                Ok(Publisher {
                    core,
                    node: Arc::downgrade(&self.inner),
                })
            }
        }
    }

    /// Subscribe to `topic`.
    ///
    /// Subscribing to the same topic again with the same message type
    /// returns a handle to the existing subscription; a different type is an
    /// error.
    pub fn subscribe<M: Message>(&self, topic: &str) -> Result<Subscriber<M>> {
        let name = GraphName::new(topic)?;

        match self.inner.subscriptions.entry(name.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(entry);
                let registered = existing.declaration().type_name().to_string();
                match existing.into_any().downcast::<SubscriberCore<M>>() {
                    Ok(core) => Ok(Subscriber {
                        core,
                        node: Arc::downgrade(&self.inner),
                    }),
                    Err(_) => Err(Error::TypeMismatch {
                        topic: name,
                        registered,
                        requested: M::descriptor().type_name.to_string(),
                    }),
                }
            }
            Entry::Vacant(entry) => {
                let declaration = TopicDeclaration::from_descriptor(name.clone(), M::descriptor());
                let core = Arc::new(SubscriberCore::<M>::new(
                    declaration.clone(),
                    self.inner.name.clone(),
                    self.inner.scheduler.clone(),
                ));
                entry.insert(Arc::clone(&core) as Arc<dyn SubscriptionEndpoint>);

                let master = Arc::clone(&self.inner.master);
                let slave_uri = self.inner.slave_uri.clone();
                let manager = Arc::downgrade(&core);
                self.inner.registrar.submit(RegistrationJob {
                    label: format!("register subscriber {}", name),
                    action: RegistrationAction::Register,
                    listeners: Arc::clone(core.registration_listeners()),
                    call: Box::new(move || {
                        // The registration response is the first target set.
                        master
                            .register_subscriber(&declaration, &slave_uri)
                            .map(|publisher_uris| {
                                if let Some(manager) = manager.upgrade() {
                                    manager.reconcile(publisher_uris);
                                }
                            })
                    }),
                });

                Ok(Subscriber {
                    core,
                    node: Arc::downgrade(&self.inner),
                })
            }
        }
    }

    /// Advertise a service under `name`; `builder` answers each request.
    ///
    /// A second server for an existing service name on this node is
    /// [`Error::DuplicateService`].
    pub fn advertise_service<S, B>(&self, name: &str, builder: B) -> Result<ServiceServer>
    where
        S: ServicePair,
        B: ServiceResponseBuilder<S> + 'static,
    {
        let name = GraphName::new(name)?;
        let (host, port) = self.inner.tcpros.advertise_address();
        let service_uri = format!("rosrpc://{}:{}", host, port);

        match self.inner.services.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateService(name)),
            Entry::Vacant(entry) => {
                let declaration = ServiceDeclaration::from_descriptor(
                    ServiceId::new(name.clone(), service_uri.clone()),
                    S::descriptor(),
                );
                let core = Arc::new(ServiceServerCore::<S>::new(
                    declaration.clone(),
                    self.inner.name.clone(),
                    Box::new(builder),
                    Arc::new(ListenerSet::new(self.inner.scheduler.clone())),
                ));
                entry.insert(Arc::clone(&core) as Arc<dyn ServiceEndpoint>);

                let master = Arc::clone(&self.inner.master);
                let slave_uri = self.inner.slave_uri.clone();
                let listeners = Arc::clone(core.registration_listeners());
                let register_uri = service_uri.clone();
                self.inner.registrar.submit(RegistrationJob {
                    label: format!("register service {}", name),
                    action: RegistrationAction::Register,
                    listeners: Arc::clone(&listeners),
                    call: Box::new(move || {
                        master.register_service(&declaration, &register_uri, &slave_uri)
                    }),
                });

                Ok(ServiceServer {
                    name,
                    uri: service_uri,
                    registration_listeners: listeners,
                    node: Arc::downgrade(&self.inner),
                })
            }
        }
    }

    /// Create a client for the service `name`. The service URI is resolved
    /// through the master on first use.
    pub fn service_client<S: ServicePair>(&self, name: &str) -> Result<ServiceClient<S>> {
        let name = GraphName::new(name)?;
        let declaration =
            ServiceDeclaration::from_descriptor(ServiceId::unresolved(name), S::descriptor());
        Ok(service_client::new_client(
            declaration,
            self.inner.name.clone(),
            Arc::clone(&self.inner.master),
        ))
    }

    /// Create a client for the service `name` at a known URI
    /// (`rosrpc://host:port`), bypassing the master lookup.
    pub fn service_client_at<S: ServicePair>(
        &self,
        name: &str,
        uri: &str,
    ) -> Result<ServiceClient<S>> {
        let name = GraphName::new(name)?;
        let declaration = ServiceDeclaration::from_descriptor(
            ServiceId::new(name, uri.to_string()),
            S::descriptor(),
        );
        Ok(service_client::new_client(
            declaration,
            self.inner.name.clone(),
            Arc::clone(&self.inner.master),
        ))
    }

    /// Tear the whole runtime down: unregister every endpoint, stop both
    /// servers, and join the workers. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}
