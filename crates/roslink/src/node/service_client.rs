// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client pipeline.
//!
//! One persistent connection per service. Because the wire protocol does not
//! multiplex, responses arrive in request order: each call appends its
//! completion to a FIFO deque before the request bytes hit the socket, and
//! the reader thread completes the deque head for every response frame. Any
//! read error fails every pending completion in order, marks the connection
//! dead, and lets the next call dial a fresh one.

use std::collections::VecDeque;
use std::io::Read;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use crate::config::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, MAX_FRAME_SIZE, MAX_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::graph::{GraphName, ServiceDeclaration};
use crate::master::MasterClient;
use crate::message::{Message, ServicePair};
use crate::transport::frame;
use crate::transport::header::{digests_compatible, fields, ConnectionHeader};

type Completion<S> =
    Box<dyn FnOnce(Result<<S as ServicePair>::Response>) + Send + 'static>;

/// Handle to a service client.
///
/// Cheap to clone; all clones share the persistent connection.
pub struct ServiceClient<S: ServicePair> {
    pub(crate) core: Arc<ServiceClientCore<S>>,
}

impl<S: ServicePair> Clone for ServiceClient<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

pub(crate) struct ServiceClientCore<S: ServicePair> {
    declaration: ServiceDeclaration,
    caller_id: GraphName,
    master: Arc<MasterClient>,
    connection: Mutex<Option<Connection<S>>>,
    closed: AtomicBool,
}

struct Connection<S: ServicePair> {
    stream: TcpStream,
    pending: Arc<Mutex<PendingState<S>>>,
    alive: Arc<AtomicBool>,
}

/// FIFO of in-flight completions plus the reader's terminal marker.
///
/// `terminated` is flipped by the reader under this mutex before it exits,
/// and checked by enqueuers under the same mutex. Once set, nothing may be
/// added: every completion in the queue is owned by whoever drains it, so
/// each fires exactly once and none is silently dropped.
struct PendingState<S: ServicePair> {
    queue: VecDeque<Completion<S>>,
    terminated: bool,
}

impl<S: ServicePair> Connection<S> {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl<S: ServicePair> ServiceClientCore<S> {
    pub fn new(
        declaration: ServiceDeclaration,
        caller_id: GraphName,
        master: Arc<MasterClient>,
    ) -> Self {
        Self {
            declaration,
            caller_id,
            master,
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Issue one request; `completion` fires exactly once - from the reader
    /// thread, or inline when the connection is already gone or the request
    /// write fails. Connection setup failures propagate to the caller
    /// without consuming the completion.
    fn call_async(&self, request: &S::Request, completion: Completion<S>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }

        let mut body = Vec::new();
        request.encode(&mut body)?;

        let mut guard = self.connection.lock();
        if guard.as_ref().is_some_and(|c| !c.is_alive()) {
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let connection = guard.as_ref().expect("connection just established");

        // FIFO invariant: the completion is queued before the request bytes
        // reach the wire, so the reader can never see a response without a
        // matching deque head. The enqueue and the liveness check share the
        // pending mutex with the reader's terminal drain: either the reader
        // still owns the queue and will fire this completion, or it has
        // terminated and the completion fails inline - never parked in a
        // deque nobody drains.
        {
            let mut pending = connection.pending.lock();
            if pending.terminated {
                drop(pending);
                *guard = None;
                drop(guard);
                completion(Err(connection_lost()));
                return Ok(());
            }
            pending.queue.push_back(completion);
        }

        let mut writer = &connection.stream;
        if let Err(e) = frame::write_frame(&mut writer, &body) {
            warn!("[{}] request write failed: {}", self.declaration.name(), e);
            // Reclaim the completion queued above and fail it here. We are
            // the only enqueuer (the connection mutex is held), so the back
            // of the queue is ours unless the reader's terminal drain
            // already fired it - in which case the queue no longer holds it
            // and there is nothing to do. Earlier in-flight completions stay
            // queued for the reader, which the socket shutdown wakes.
            let reclaimed = {
                let mut pending = connection.pending.lock();
                pending.terminated = true;
                pending.queue.pop_back()
            };
            connection.close();
            *guard = None;
            drop(guard);
            if let Some(completion) = reclaimed {
                completion(Err(Error::Transport(e)));
            }
        }
        Ok(())
    }

    /// Dial the advertised URI and run the client side of the handshake.
    fn connect(&self) -> Result<Connection<S>> {
        let uri = match self.declaration.id().uri() {
            Some(uri) => uri.to_string(),
            None => self
                .master
                .lookup_service(self.declaration.name().as_str())?,
        };
        let (host, port) = split_rosrpc_uri(&uri)?;

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(Error::Transport)?
            .next()
            .ok_or_else(|| Error::InvalidUri(uri.clone()))?;
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut header = ConnectionHeader::new();
        header.put(fields::CALLER_ID, self.caller_id.as_str());
        header.put(fields::SERVICE, self.declaration.name().as_str());
        header.put(fields::MD5_CHECKSUM, self.declaration.md5sum());
        header.put(fields::TYPE, self.declaration.type_name());
        header.put(fields::PERSISTENT, "1");
        header.write_to(&mut stream)?;

        let reply = ConnectionHeader::read_from(&mut stream, MAX_HEADER_SIZE)??;
        if let Some(message) = reply.get(fields::ERROR) {
            return Err(Error::ServiceFailure(message.to_string()));
        }
        if let Some(theirs) = reply.get(fields::MD5_CHECKSUM) {
            if !digests_compatible(self.declaration.md5sum(), theirs) {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(Error::HandshakeMismatch {
                    expected: self.declaration.md5sum().to_string(),
                    actual: theirs.to_string(),
                });
            }
        }

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        let pending: Arc<Mutex<PendingState<S>>> = Arc::new(Mutex::new(PendingState {
            queue: VecDeque::new(),
            terminated: false,
        }));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_stream = stream.try_clone()?;
        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let label = self.declaration.name().to_string();
        thread::Builder::new()
            .name(format!("svc-reader-{}", label))
            .spawn(move || reader_loop::<S>(reader_stream, reader_pending, reader_alive, label))?;

        info!("[{}] service connection up: {}", self.declaration.name(), uri);
        Ok(Connection {
            stream,
            pending,
            alive,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
        }
    }
}

fn reader_loop<S: ServicePair>(
    mut stream: TcpStream,
    pending: Arc<Mutex<PendingState<S>>>,
    alive: Arc<AtomicBool>,
    label: String,
) {
    loop {
        let mut status = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut status) {
            debug!("[{}] service connection closed: {}", label, e);
            break;
        }
        let body = match frame::read_frame(&mut stream, MAX_FRAME_SIZE) {
            Ok(body) => body,
            Err(e) => {
                debug!("[{}] service response read failed: {}", label, e);
                break;
            }
        };

        let completion = pending.lock().queue.pop_front();
        let Some(completion) = completion else {
            warn!("[{}] response with no pending request, dropping connection", label);
            break;
        };

        if status[0] == 1 {
            match <S::Response as Message>::decode(&body) {
                Ok(response) => completion(Ok(response)),
                Err(e) => completion(Err(Error::Codec(e))),
            }
        } else {
            let message = String::from_utf8_lossy(&body).into_owned();
            completion(Err(Error::ServiceFailure(message)));
        }
    }

    // Terminal drain: mark the queue closed to enqueuers under the mutex,
    // take ownership of everything in flight, then fail it in order with
    // no lock held across the callbacks.
    alive.store(false, Ordering::Release);
    let _ = stream.shutdown(Shutdown::Both);
    let drained: Vec<Completion<S>> = {
        let mut pending = pending.lock();
        pending.terminated = true;
        pending.queue.drain(..).collect()
    };
    for completion in drained {
        completion(Err(connection_lost()));
    }
}

fn connection_lost() -> Error {
    Error::Transport(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "service connection lost",
    ))
}

/// Split `rosrpc://host:port` into host and port.
fn split_rosrpc_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("rosrpc://")
        .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidUri(uri.to_string()))?;
    if host.is_empty() {
        return Err(Error::InvalidUri(uri.to_string()));
    }
    Ok((host.to_string(), port))
}

impl<S: ServicePair> ServiceClient<S> {
    /// The service's graph name.
    pub fn service_name(&self) -> &GraphName {
        self.core.declaration.name()
    }

    /// Issue a request and invoke `completion` with the outcome.
    ///
    /// Completions fire in request order. Connection setup failures surface
    /// here without consuming the completion; once `Ok(())` is returned the
    /// completion fires exactly once - with the response, the remote error,
    /// or a transport failure - even if the peer disconnects.
    pub fn call_async<F>(&self, request: &S::Request, completion: F) -> Result<()>
    where
        F: FnOnce(Result<S::Response>) + Send + 'static,
    {
        self.core.call_async(request, Box::new(completion))
    }

    /// Issue a request and block for the response.
    ///
    /// Service calls carry no intrinsic timeout; use
    /// [`call_with_timeout`](Self::call_with_timeout) to bound the wait.
    pub fn call(&self, request: &S::Request) -> Result<S::Response> {
        let (tx, rx) = bounded(1);
        self.call_async(request, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.recv().map_err(|_| Error::Cancelled)?
    }

    /// Issue a request and block for the response, up to `timeout`.
    pub fn call_with_timeout(
        &self,
        request: &S::Request,
        timeout: Duration,
    ) -> Result<S::Response> {
        let (tx, rx) = bounded(1);
        self.call_async(request, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.recv_timeout(timeout).map_err(|_| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "service call timed out",
            ))
        })?
    }

    /// True while the persistent connection is established and healthy.
    pub fn is_connected(&self) -> bool {
        self.core
            .connection
            .lock()
            .as_ref()
            .is_some_and(Connection::is_alive)
    }

    /// Drop the connection and reject future calls.
    pub fn shutdown(&self) {
        self.core.close();
    }
}

/// Internal constructor used by the node runtime.
pub(crate) fn new_client<S: ServicePair>(
    declaration: ServiceDeclaration,
    caller_id: GraphName,
    master: Arc<MasterClient>,
) -> ServiceClient<S> {
    ServiceClient {
        core: Arc::new(ServiceClientCore::new(declaration, caller_id, master)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ServiceId;
    use crate::message::{self, CodecError, TypeDescriptor};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_split_rosrpc_uri() {
        let (host, port) = split_rosrpc_uri("rosrpc://10.1.2.3:40123").unwrap();
        assert_eq!(host, "10.1.2.3");
        assert_eq!(port, 40123);

        let (host, port) = split_rosrpc_uri("rosrpc://svc-host:1/").unwrap();
        assert_eq!(host, "svc-host");
        assert_eq!(port, 1);
    }

    #[test]
    fn test_split_rosrpc_uri_rejects_garbage() {
        assert!(split_rosrpc_uri("http://host:1/").is_err());
        assert!(split_rosrpc_uri("rosrpc://host").is_err());
        assert!(split_rosrpc_uri("rosrpc://:1").is_err());
        assert!(split_rosrpc_uri("rosrpc://host:99999").is_err());
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Num(i64);

    impl Message for Num {
        fn descriptor() -> &'static TypeDescriptor {
            static DESC: TypeDescriptor = TypeDescriptor {
                type_name: "test_srvs/Num",
                definition: "int64 value\n",
                md5sum: "0123456789abcdef0123456789abcdef",
            };
            &DESC
        }
        fn encode(&self, buf: &mut Vec<u8>) -> std::result::Result<(), CodecError> {
            message::encode_i64(self.0, buf);
            Ok(())
        }
        fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
            let mut pos = 0;
            Ok(Self(message::decode_i64(bytes, &mut pos)?))
        }
    }

    struct Echo;

    impl ServicePair for Echo {
        type Request = Num;
        type Response = Num;
        fn descriptor() -> &'static TypeDescriptor {
            static DESC: TypeDescriptor = TypeDescriptor {
                type_name: "test_srvs/Echo",
                definition: "int64 value\n---\nint64 value\n",
                md5sum: "fedcba9876543210fedcba9876543210",
            };
            &DESC
        }
    }

    fn client_for(uri: &str) -> ServiceClient<Echo> {
        let name = GraphName::new("/echo").unwrap();
        let declaration =
            ServiceDeclaration::from_descriptor(ServiceId::new(name.clone(), uri), Echo::descriptor());
        new_client(
            declaration,
            GraphName::new("/client").unwrap(),
            Arc::new(MasterClient::new("http://127.0.0.1:1/", name)),
        )
    }

    /// A peer that completes the handshake, optionally drops some requests
    /// on the floor, and hangs up.
    fn handshake_then_drop(accepts: u32) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("rosrpc://127.0.0.1:{}", listener.local_addr().unwrap().port());
        thread::spawn(move || {
            for _ in 0..accepts {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let _client_header = ConnectionHeader::read_from(&mut stream, 1 << 20)
                    .unwrap()
                    .unwrap();
                let mut reply = ConnectionHeader::new();
                reply.put(fields::CALLER_ID, "/fake_server");
                reply.put(fields::MD5_CHECKSUM, "*");
                reply.put(fields::TYPE, "test_srvs/Echo");
                reply.write_to(&mut stream).unwrap();
                // Hang up without answering anything.
            }
        });
        uri
    }

    #[test]
    fn test_disconnect_fails_call_instead_of_hanging() {
        let uri = handshake_then_drop(1);
        let client = client_for(&uri);

        // The peer drops the connection after the handshake; the blocking
        // call must return a transport error, never park forever.
        let err = client.call(&Num(7)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_completion_fires_exactly_once_on_disconnect() {
        let uri = handshake_then_drop(2);
        let client = client_for(&uri);

        let fired = Arc::new(AtomicU32::new(0));
        {
            let fired = Arc::clone(&fired);
            client
                .call_async(&Num(1), move |outcome| {
                    assert!(outcome.is_err());
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        // The drop reaches the reader, which fails the queued completion.
        for _ in 0..500 {
            if fired.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Later calls redial and are failed too, again exactly once each.
        let err = client.call(&Num(2)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
