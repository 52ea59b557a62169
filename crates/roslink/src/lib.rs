// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # roslink - Graph Messaging Runtime
//!
//! A pure Rust client-side runtime for a distributed robotics
//! publish/subscribe and request/response messaging system. Independent
//! processes ("nodes") exchange typed messages over named channels ("topics")
//! and invoke named request/response endpoints ("services"); a central
//! directory ("master") tracks registrations and brokers peer discovery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roslink::{Node, Result};
//! # #[derive(Clone)] struct Telemetry;
//! # impl roslink::Message for Telemetry {
//! #     fn descriptor() -> &'static roslink::TypeDescriptor { unimplemented!() }
//! #     fn encode(&self, _: &mut Vec<u8>) -> std::result::Result<(), roslink::CodecError> { Ok(()) }
//! #     fn decode(_: &[u8]) -> std::result::Result<Self, roslink::CodecError> { Ok(Telemetry) }
//! # }
//!
//! fn main() -> Result<()> {
//!     let node = Node::builder("sensor_driver")
//!         .master_uri("http://localhost:11311/")
//!         .build()?;
//!
//!     let publisher = node.advertise::<Telemetry>("telemetry", false)?;
//!     publisher.publish(&Telemetry)?;
//!
//!     node.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |        Node -> Publisher / Subscriber / ServiceClient              |
//! +--------------------------------------------------------------------+
//! |                          Graph Layer                               |
//! |   Registration Lifecycle | Connection Reconcile | Slave Endpoint   |
//! +--------------------------------------------------------------------+
//! |                        Transport Layer                             |
//! |   Connection Header Handshake | Outgoing Fan-out | Incoming Queue  |
//! +--------------------------------------------------------------------+
//! |                         Directory RPC                              |
//! |             XML-RPC over HTTP (master + per-node API)              |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | Entry point to the graph, factory for all endpoints |
//! | [`node::Publisher`] | Publishes typed messages to a topic |
//! | [`node::Subscriber`] | Receives typed messages from a topic |
//! | [`node::ServiceClient`] | Calls a remote service endpoint |
//! | [`Message`] | Trait for wire-serializable message types |
//!
//! ## Modules Overview
//!
//! - [`node`] - Node runtime and user-facing handles (start here)
//! - [`transport`] - Topic wire protocol: header handshake, queues, framing
//! - [`master`] - Typed client for the directory (master) RPC surface
//! - [`xmlrpc`] - Minimal XML-RPC value model, codec, and HTTP plumbing
//! - [`graph`] - Names, identifiers, and declarations
//! - [`sched`] - Shared worker pool and listener fan-out

/// Compile-time configurable logging system.
#[macro_use]
pub mod logging;

pub mod config;
mod error;
pub mod graph;
pub mod master;
pub mod message;
pub mod node;
mod queue;
pub mod sched;
mod time;
pub mod transport;
pub mod xmlrpc;

pub use error::{Error, ErrorKind, Result};
pub use graph::{
    GraphName, NodeId, PublisherId, ServiceDeclaration, ServiceId, SubscriberId, TopicDeclaration,
    TopicId,
};
pub use message::{compute_md5sum, CodecError, Message, ServicePair, TypeDescriptor};
pub use node::{Node, NodeBuilder};
pub use queue::CircularBlockingQueue;
pub use time::{Clock, SystemClock, Time};
