// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking XML-RPC client over HTTP/1.0.
//!
//! One TCP connection per call with `Connection: close`, which keeps the
//! response framing trivial: read to EOF, honor `Content-Length` when
//! present. Every directory round trip is bounded by the caller's timeout.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{encode_request, parse_response, Value, XmlRpcError};

/// Invoke `method` on the XML-RPC endpoint at `uri` (`http://host:port/`).
pub fn call(
    uri: &str,
    method: &str,
    params: &[Value],
    timeout: Duration,
) -> Result<Value, XmlRpcError> {
    let (host, port, path) = split_http_uri(uri)?;

    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(XmlRpcError::Io)?
        .next()
        .ok_or_else(|| XmlRpcError::Http(format!("no address for {}:{}", host, port)))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let body = encode_request(method, params);
    let request = format!(
        "POST {} HTTP/1.0\r\n\
         Host: {}:{}\r\n\
         User-Agent: roslink\r\n\
         Content-Type: text/xml\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        path,
        host,
        port,
        body.len()
    );
    stream.write_all(request.as_bytes())?;
    stream.write_all(body.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;

    let response_body = parse_http_response(&raw)?;
    parse_response(&response_body)
}

/// Split `http://host[:port]/path` into its parts. The port defaults to 80
/// and the path to `/`.
pub(crate) fn split_http_uri(uri: &str) -> Result<(String, u16, String), XmlRpcError> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| XmlRpcError::Http(format!("not an http URI: {}", uri)))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| XmlRpcError::Http(format!("bad port in {}", uri)))?;
            (host, port)
        }
        None => (authority, 80),
    };

    if host.is_empty() {
        return Err(XmlRpcError::Http(format!("empty host in {}", uri)));
    }
    Ok((host.to_string(), port, path.to_string()))
}

fn parse_http_response(raw: &[u8]) -> Result<String, XmlRpcError> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| XmlRpcError::Http("response without header terminator".to_string()))?;

    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| XmlRpcError::Http("non-UTF-8 response head".to_string()))?;
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "200" {
        return Err(XmlRpcError::Http(format!("status {:?}", status_line)));
    }

    let mut body = &raw[header_end..];
    // Honor Content-Length when present; trailing bytes past it are padding
    // from sloppy peers.
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(len) = value.trim().parse::<usize>() {
                    if len <= body.len() {
                        body = &body[..len];
                    }
                }
            }
        }
    }

    String::from_utf8(body.to_vec()).map_err(|_| XmlRpcError::Http("non-UTF-8 body".to_string()))
}

pub(crate) fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|idx| idx + 4)
}
