// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal XML-RPC server.
//!
//! Backs the per-node directory endpoint ("slave API") and the mock master
//! used in tests. One accept thread polls a non-blocking listener; each
//! accepted connection is served by a short-lived thread that reads one HTTP
//! request, dispatches it to the installed [`RpcHandler`], and replies.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::{client::find_header_end, encode_fault, encode_response, parse_request, Value};

/// Poll interval of the accept loop while idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Per-connection socket timeout.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted request entity.
const MAX_REQUEST_BODY: usize = 4 * 1024 * 1024;

/// Application-level XML-RPC fault.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// `faultCode`
    pub code: i32,
    /// `faultString`
    pub message: String,
}

impl Fault {
    /// Build a fault.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of dispatching one method call.
pub type HandlerResult = Result<Value, Fault>;

/// Dispatches incoming method calls.
pub trait RpcHandler: Send + Sync {
    /// Handle one call. Runs on a per-connection thread.
    fn handle(&self, method: &str, params: &[Value]) -> HandlerResult;
}

/// A bound XML-RPC HTTP server.
pub struct XmlRpcServer {
    local_addr: SocketAddr,
    uri: String,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl XmlRpcServer {
    /// Bind to an ephemeral port on `bind_host`, advertising
    /// `http://advertise_host:port/` as the endpoint URI.
    pub fn bind(
        bind_host: &str,
        advertise_host: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((bind_host, 0))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let uri = format!("http://{}:{}/", advertise_host, local_addr.port());

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("xmlrpc-accept-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, handler, shutdown))?
        };

        Ok(Self {
            local_addr,
            uri,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    /// The advertised endpoint URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting calls and join the accept thread. Connections already
    /// being served run to completion.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for XmlRpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, handler: Arc<dyn RpcHandler>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, _peer)) => {
                let handler = Arc::clone(&handler);
                let spawned = thread::Builder::new()
                    .name("xmlrpc-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, &*handler) {
                            debug!("xmlrpc connection error: {}", e);
                        }
                    });
                if spawned.is_err() {
                    warn!("failed to spawn xmlrpc connection thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("xmlrpc accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn serve_connection(mut stream: TcpStream, handler: &dyn RpcHandler) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CONNECTION_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECTION_TIMEOUT))?;

    let body = read_http_request(&mut stream)?;

    let response_xml = match parse_request(&body) {
        Ok((method, params)) => match handler.handle(&method, &params) {
            Ok(value) => encode_response(&value),
            Err(fault) => encode_fault(fault.code, &fault.message),
        },
        Err(e) => encode_fault(-32700, &format!("parse error: {}", e)),
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/xml\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        response_xml.len(),
        response_xml
    );
    stream.write_all(response.as_bytes())
}

/// Read one HTTP request and return its entity body.
fn read_http_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut raw = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    // Accumulate until the header terminator shows up.
    let header_end = loop {
        if let Some(end) = find_header_end(&raw) {
            break end;
        }
        if raw.len() > MAX_REQUEST_BODY {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        raw.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 head"))?;
    let mut content_length = None;
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }
    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing Content-Length")
    })?;
    if content_length > MAX_REQUEST_BODY {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "request entity too large",
        ));
    }

    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-entity",
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    String::from_utf8(body)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 entity"))
}
