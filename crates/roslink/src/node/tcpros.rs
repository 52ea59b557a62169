// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared topic/service listener.
//!
//! One TCP listener serves every publication and service of the node. Each
//! accepted connection is classified by its handshake header and dispatched
//! to exactly one handler kind: a `topic` field routes to the publisher's
//! attach path, a `service` field to the service request loop, anything else
//! is answered with an error header and closed.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{HANDSHAKE_TIMEOUT, MAX_HEADER_SIZE};
use crate::transport::header::{fields, ConnectionHeader};

use super::NodeInner;

/// Poll interval of the accept loop while idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub(crate) struct TcpRosServer {
    local_addr: SocketAddr,
    advertise_host: String,
    node: Arc<Mutex<Option<Weak<NodeInner>>>>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpRosServer {
    /// Bind to an ephemeral port on `bind_host`; peers are told to connect
    /// to `advertise_host`.
    pub fn bind(bind_host: &str, advertise_host: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind((bind_host, 0))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let node: Arc<Mutex<Option<Weak<NodeInner>>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let node = Arc::clone(&node);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("tcpros-accept-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, node, shutdown))?
        };

        Ok(Self {
            local_addr,
            advertise_host: advertise_host.to_string(),
            node,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    /// Wire the listener to its node; called once construction completes.
    pub fn attach(&self, node: Weak<NodeInner>) {
        *self.node.lock() = Some(node);
    }

    /// `(host, port)` peers should dial for topics and services.
    pub fn advertise_address(&self) -> (String, u16) {
        (self.advertise_host.clone(), self.local_addr.port())
    }

    /// Stop accepting connections and join the accept thread. Connections
    /// already handed to endpoints run until those endpoints close.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpRosServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    node: Arc<Mutex<Option<Weak<NodeInner>>>>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let node = node.lock().clone();
                let spawned = thread::Builder::new()
                    .name(format!("tcpros-conn-{}", peer))
                    .spawn(move || handle_connection(stream, node));
                if spawned.is_err() {
                    warn!("failed to spawn tcpros connection thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("tcpros accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Read the opening header and dispatch to exactly one handler kind.
fn handle_connection(mut stream: TcpStream, node: Option<Weak<NodeInner>>) {
    if stream.set_nonblocking(false).is_err()
        || stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).is_err()
        || stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT)).is_err()
    {
        return;
    }

    let header = match ConnectionHeader::read_from(&mut stream, MAX_HEADER_SIZE) {
        Ok(Ok(header)) => header,
        Ok(Err(e)) => {
            debug!("rejecting connection with malformed header: {}", e);
            reject(stream, &format!("malformed connection header: {}", e));
            return;
        }
        Err(e) => {
            debug!("connection dropped during handshake: {}", e);
            return;
        }
    };

    let Some(node) = node.and_then(|weak| weak.upgrade()) else {
        reject(stream, "node is shutting down");
        return;
    };

    if let Some(topic) = header.get(fields::TOPIC) {
        match node.topic_endpoint(topic) {
            Some(endpoint) => {
                if let Err(e) = endpoint.attach(stream, &header) {
                    warn!("[{}] subscriber handshake failed: {}", topic, e);
                }
            }
            None => reject(stream, &format!("topic {} is not published here", topic)),
        }
    } else if let Some(service) = header.get(fields::SERVICE) {
        match node.service_endpoint(service) {
            // Runs the request loop on this connection's thread.
            Some(endpoint) => endpoint.serve(stream, &header),
            None => reject(stream, &format!("service {} is not served here", service)),
        }
    } else {
        reject(stream, "header carries neither topic nor service");
    }
}

fn reject(mut stream: TcpStream, message: &str) {
    let mut reply = ConnectionHeader::new();
    reply.put(fields::ERROR, message);
    let _ = reply.write_to(&mut stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_unattached_server_rejects_with_error_header() {
        let server = TcpRosServer::bind("127.0.0.1", "127.0.0.1").unwrap();
        let (host, port) = server.advertise_address();

        let mut stream = TcpStream::connect((host.as_str(), port)).unwrap();
        let mut header = ConnectionHeader::new();
        header.put(fields::CALLER_ID, "/probe");
        header.put(fields::TOPIC, "/nothing");
        header.put(fields::MD5_CHECKSUM, "*");
        header.write_to(&mut stream).unwrap();
        stream.flush().unwrap();

        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reply = ConnectionHeader::read_from(&mut stream, 1 << 20)
            .unwrap()
            .unwrap();
        assert!(reply.contains(fields::ERROR));

        server.shutdown();
    }

    #[test]
    fn test_headerless_peer_is_tolerated() {
        let server = TcpRosServer::bind("127.0.0.1", "127.0.0.1").unwrap();
        let (host, port) = server.advertise_address();

        // Connect and immediately hang up; the handler must not wedge the
        // accept loop.
        drop(TcpStream::connect((host.as_str(), port)).unwrap());
        drop(TcpStream::connect((host.as_str(), port)).unwrap());

        server.shutdown();
    }

    #[test]
    fn test_advertise_address_uses_configured_host() {
        let server = TcpRosServer::bind("127.0.0.1", "robot-1.local").unwrap();
        let (host, port) = server.advertise_address();
        assert_eq!(host, "robot-1.local");
        assert!(port > 0);
        server.shutdown();
    }
}
