// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service server endpoint.
//!
//! The node's shared listener routes connections carrying a `service` header
//! field here. After the mirror handshake, each request frame is decoded,
//! handed to the user's response builder, and answered with one status byte
//! (`1` success, `0` failure) followed by the length-prefixed body - the
//! serialized response or the builder's error string.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::graph::{GraphName, ServiceDeclaration};
use crate::message::{Message, ServicePair};
use crate::sched::ListenerSet;
use crate::transport::frame;
use crate::transport::header::{digests_compatible, fields, ConnectionHeader};

use super::registration::RegistrationListener;
use super::{NodeInner, ServiceEndpoint};

/// Builds one response per incoming request.
///
/// Returning `Err` sends the failure status and the error string to the
/// caller; it does not terminate the connection.
pub trait ServiceResponseBuilder<S: ServicePair>: Send + Sync {
    /// Handle one request.
    fn build(&self, request: S::Request) -> std::result::Result<S::Response, String>;
}

impl<S, F> ServiceResponseBuilder<S> for F
where
    S: ServicePair,
    F: Fn(S::Request) -> std::result::Result<S::Response, String> + Send + Sync,
{
    fn build(&self, request: S::Request) -> std::result::Result<S::Response, String> {
        self(request)
    }
}

pub(crate) struct ServiceServerCore<S: ServicePair> {
    declaration: ServiceDeclaration,
    caller_id: GraphName,
    builder: Box<dyn ServiceResponseBuilder<S>>,
    registration_listeners: Arc<ListenerSet<dyn RegistrationListener>>,
    requests_served: AtomicU64,
    closed: AtomicBool,
}

impl<S: ServicePair> ServiceServerCore<S> {
    pub fn new(
        declaration: ServiceDeclaration,
        caller_id: GraphName,
        builder: Box<dyn ServiceResponseBuilder<S>>,
        registration_listeners: Arc<ListenerSet<dyn RegistrationListener>>,
    ) -> Self {
        Self {
            declaration,
            caller_id,
            builder,
            registration_listeners,
            requests_served: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn handshake(&self, stream: &mut TcpStream, header: &ConnectionHeader) -> Result<()> {
        let theirs = header.get(fields::MD5_CHECKSUM).unwrap_or("*");
        if !digests_compatible(self.declaration.md5sum(), theirs) {
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
            let _ = reply.write_to(stream);
            return Err(Error::HandshakeMismatch {
                expected: self.declaration.md5sum().to_string(),
                actual: theirs.to_string(),
            });
        }

        let mut reply = ConnectionHeader::new();
        reply.put(fields::CALLER_ID, self.caller_id.as_str());
        reply.put(fields::MD5_CHECKSUM, self.declaration.md5sum());
        reply.put(fields::TYPE, self.declaration.type_name());
        reply.write_to(stream)?;

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        Ok(())
    }

    fn request_loop(&self, mut stream: TcpStream) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let body = match frame::read_frame(&mut stream, MAX_FRAME_SIZE) {
                Ok(body) => body,
                Err(e) => {
                    debug!("[{}] service connection done: {}", self.declaration.name(), e);
                    return;
                }
            };

            let outcome = match <S::Request as Message>::decode(&body) {
                Ok(request) => self.builder.build(request),
                Err(e) => Err(format!("undecodable request: {}", e)),
            };

            let written = match outcome {
                Ok(response) => {
                    let mut encoded = Vec::new();
                    match response.encode(&mut encoded) {
                        Ok(()) => write_reply(&mut stream, 1, &encoded),
                        Err(e) => {
                            write_reply(&mut stream, 0, format!("encode failed: {}", e).as_bytes())
                        }
                    }
                }
                Err(message) => write_reply(&mut stream, 0, message.as_bytes()),
            };
            if let Err(e) = written {
                debug!("[{}] reply write failed: {}", self.declaration.name(), e);
                return;
            }
            self.requests_served.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn write_reply(stream: &mut TcpStream, status: u8, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&[status])?;
    frame::write_frame(stream, body)
}

impl<S: ServicePair> ServiceEndpoint for ServiceServerCore<S> {
    fn declaration(&self) -> &ServiceDeclaration {
        &self.declaration
    }

    fn serve(&self, mut stream: TcpStream, header: &ConnectionHeader) {
        match self.handshake(&mut stream, header) {
            Ok(()) => self.request_loop(stream),
            Err(e) => warn!(
                "[{}] service handshake rejected: {}",
                self.declaration.name(),
                e
            ),
        }
    }

    fn registration_listeners(&self) -> &Arc<ListenerSet<dyn RegistrationListener>> {
        &self.registration_listeners
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Handle to an advertised service.
pub struct ServiceServer {
    pub(crate) name: GraphName,
    pub(crate) uri: String,
    pub(crate) registration_listeners: Arc<ListenerSet<dyn RegistrationListener>>,
    pub(crate) node: Weak<NodeInner>,
}

impl std::fmt::Debug for ServiceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceServer")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl ServiceServer {
    /// The service's graph name.
    pub fn service_name(&self) -> &GraphName {
        &self.name
    }

    /// The advertised `rosrpc://host:port` URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Observe master registration lifecycle events.
    pub fn add_registration_listener(&self, listener: Arc<dyn RegistrationListener>) -> usize {
        self.registration_listeners.add(listener)
    }

    /// Stop serving and enqueue the master unregistration.
    pub fn shutdown(&self) {
        if let Some(node) = self.node.upgrade() {
            node.unadvertise_service(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ServiceId;
    use crate::message::{self, CodecError, TypeDescriptor};
    use crate::sched::Scheduler;
    use crate::transport::frame::read_frame;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct TwoInts {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Sum {
        sum: i64,
    }

    impl Message for TwoInts {
        fn descriptor() -> &'static TypeDescriptor {
            static DESC: TypeDescriptor = TypeDescriptor {
                type_name: "test_srvs/AddTwoIntsRequest",
                definition: "int64 a\nint64 b\n",
                md5sum: "36d09b846be0b371c5f190354dd3153e",
            };
            &DESC
        }
        fn encode(&self, buf: &mut Vec<u8>) -> std::result::Result<(), CodecError> {
            message::encode_i64(self.a, buf);
            message::encode_i64(self.b, buf);
            Ok(())
        }
        fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
            let mut pos = 0;
            Ok(Self {
                a: message::decode_i64(bytes, &mut pos)?,
                b: message::decode_i64(bytes, &mut pos)?,
            })
        }
    }

    impl Message for Sum {
        fn descriptor() -> &'static TypeDescriptor {
            static DESC: TypeDescriptor = TypeDescriptor {
                type_name: "test_srvs/AddTwoIntsResponse",
                definition: "int64 sum\n",
                md5sum: "b88405221c77b1878a3cbbfff53428d7",
            };
            &DESC
        }
        fn encode(&self, buf: &mut Vec<u8>) -> std::result::Result<(), CodecError> {
            message::encode_i64(self.sum, buf);
            Ok(())
        }
        fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
            let mut pos = 0;
            Ok(Self {
                sum: message::decode_i64(bytes, &mut pos)?,
            })
        }
    }

    struct AddTwoInts;

    impl ServicePair for AddTwoInts {
        type Request = TwoInts;
        type Response = Sum;
        fn descriptor() -> &'static TypeDescriptor {
            static DESC: TypeDescriptor = TypeDescriptor {
                type_name: "test_srvs/AddTwoInts",
                definition: "int64 a\nint64 b\n---\nint64 sum\n",
                md5sum: "6a2e34150c00229791cc89ff309fff21",
            };
            &DESC
        }
    }

    fn server_core() -> (Arc<ServiceServerCore<AddTwoInts>>, Scheduler) {
        let scheduler = Scheduler::new(1);
        let declaration = ServiceDeclaration::from_descriptor(
            ServiceId::new(
                GraphName::new("/add_two_ints").unwrap(),
                "rosrpc://127.0.0.1:1",
            ),
            AddTwoInts::descriptor(),
        );
        let core = Arc::new(ServiceServerCore::<AddTwoInts>::new(
            declaration,
            GraphName::new("/server").unwrap(),
            Box::new(|request: TwoInts| {
                if request.a == i64::MAX {
                    Err("overflow".to_string())
                } else {
                    Ok(Sum {
                        sum: request.a + request.b,
                    })
                }
            }),
            Arc::new(ListenerSet::new(scheduler.clone())),
        ));
        (core, scheduler)
    }

    fn client_header(md5sum: &str) -> ConnectionHeader {
        let mut header = ConnectionHeader::new();
        header.put(fields::CALLER_ID, "/client");
        header.put(fields::SERVICE, "/add_two_ints");
        header.put(fields::MD5_CHECKSUM, md5sum);
        header.put(fields::TYPE, "test_srvs/AddTwoInts");
        header.put(fields::PERSISTENT, "1");
        header
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn read_status_and_body(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut status = [0u8; 1];
        stream.read_exact(&mut status).unwrap();
        (status[0], read_frame(stream, 1024).unwrap())
    }

    #[test]
    fn test_requests_answered_in_order() {
        let (core, scheduler) = server_core();
        let (mut client_side, server_side) = loopback_pair();
        let header = client_header(AddTwoInts::descriptor().md5sum);

        let serve = thread::spawn(move || core.serve(server_side, &header));

        client_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let _reply = ConnectionHeader::read_from(&mut client_side, 1 << 20)
            .unwrap()
            .unwrap();

        for (a, b) in [(3i64, 4i64), (10, -2), (0, 0)] {
            let mut body = Vec::new();
            TwoInts { a, b }.encode(&mut body).unwrap();
            frame::write_frame(&mut client_side, &body).unwrap();

            let (status, body) = read_status_and_body(&mut client_side);
            assert_eq!(status, 1);
            assert_eq!(Sum::decode(&body).unwrap(), Sum { sum: a + b });
        }

        drop(client_side);
        serve.join().unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn test_builder_error_reported_as_failure_status() {
        let (core, scheduler) = server_core();
        let (mut client_side, server_side) = loopback_pair();
        let header = client_header("*");

        let serve = thread::spawn(move || core.serve(server_side, &header));

        client_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let _reply = ConnectionHeader::read_from(&mut client_side, 1 << 20)
            .unwrap()
            .unwrap();

        let mut body = Vec::new();
        TwoInts { a: i64::MAX, b: 1 }.encode(&mut body).unwrap();
        frame::write_frame(&mut client_side, &body).unwrap();

        let (status, body) = read_status_and_body(&mut client_side);
        assert_eq!(status, 0);
        assert_eq!(body, b"overflow");

        drop(client_side);
        serve.join().unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn test_digest_mismatch_rejected() {
        let (core, scheduler) = server_core();
        let (mut client_side, server_side) = loopback_pair();
        let header = client_header("1111111111111111");

        let serve = thread::spawn(move || core.serve(server_side, &header));

        client_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reply = ConnectionHeader::read_from(&mut client_side, 1 << 20)
            .unwrap()
            .unwrap();
        assert!(reply.get(fields::ERROR).unwrap().contains("digest mismatch"));

        serve.join().unwrap();
        scheduler.shutdown();
    }
}
