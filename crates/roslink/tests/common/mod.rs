// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures: wire-compatible test message types and an in-process
//! mock master implementing the registration surface, including
//! `publisherUpdate` pushes to registered subscribers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use roslink::message::{self, CodecError, Message, ServicePair, TypeDescriptor};
use roslink::xmlrpc::{self, Fault, HandlerResult, RpcHandler, Value, XmlRpcServer};
use roslink::Time;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StringMsg {
    pub data: String,
}

impl Message for StringMsg {
    fn descriptor() -> &'static TypeDescriptor {
        static DESC: TypeDescriptor = TypeDescriptor {
            type_name: "std_msgs/String",
            definition: "string data\n",
            md5sum: "992ce8a1687cec8c8bd883ec73ca41d1",
        };
        &DESC
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        message::encode_string(&self.data, buf);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        Ok(Self {
            data: message::decode_string(bytes, &mut pos)?,
        })
    }
}

/// Sequence-numbered, timestamped message for ordering checks.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedCount {
    pub seq: u32,
    pub stamp: Time,
}

impl Message for StampedCount {
    fn descriptor() -> &'static TypeDescriptor {
        static DESC: TypeDescriptor = TypeDescriptor {
            type_name: "test_msgs/StampedCount",
            definition: "uint32 seq\ntime stamp\n",
            md5sum: "3d4b2f9e8a1c06d5e7f8a9b0c1d2e3f4",
        };
        &DESC
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        message::encode_u32(self.seq, buf);
        message::encode_u32(self.stamp.secs, buf);
        message::encode_u32(self.stamp.nsecs, buf);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let seq = message::decode_u32(bytes, &mut pos)?;
        let secs = message::decode_u32(bytes, &mut pos)?;
        let nsecs = message::decode_u32(bytes, &mut pos)?;
        Ok(Self {
            seq,
            stamp: Time::new(secs, nsecs),
        })
    }
}

/// Same wire layout as [`StringMsg`] under a different digest, for
/// handshake-mismatch scenarios.
#[derive(Debug, Clone, PartialEq)]
pub struct OtherStringMsg {
    pub data: String,
}

impl Message for OtherStringMsg {
    fn descriptor() -> &'static TypeDescriptor {
        static DESC: TypeDescriptor = TypeDescriptor {
            type_name: "test_msgs/OtherString",
            definition: "string data\nuint8 flavor\n",
            md5sum: "ffffffffffffffffffffffffffffffff",
        };
        &DESC
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        message::encode_string(&self.data, buf);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        Ok(Self {
            data: message::decode_string(bytes, &mut pos)?,
        })
    }
}

// ============================================================================
// Service pair
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AddTwoIntsRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddTwoIntsResponse {
    pub sum: i64,
}

impl Message for AddTwoIntsRequest {
    fn descriptor() -> &'static TypeDescriptor {
        static DESC: TypeDescriptor = TypeDescriptor {
            type_name: "test_srvs/AddTwoIntsRequest",
            definition: "int64 a\nint64 b\n",
            md5sum: "36d09b846be0b371c5f190354dd3153e",
        };
        &DESC
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        message::encode_i64(self.a, buf);
        message::encode_i64(self.b, buf);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        Ok(Self {
            a: message::decode_i64(bytes, &mut pos)?,
            b: message::decode_i64(bytes, &mut pos)?,
        })
    }
}

impl Message for AddTwoIntsResponse {
    fn descriptor() -> &'static TypeDescriptor {
        static DESC: TypeDescriptor = TypeDescriptor {
            type_name: "test_srvs/AddTwoIntsResponse",
            definition: "int64 sum\n",
            md5sum: "b88405221c77b1878a3cbbfff53428d7",
        };
        &DESC
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        message::encode_i64(self.sum, buf);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        Ok(Self {
            sum: message::decode_i64(bytes, &mut pos)?,
        })
    }
}

pub struct AddTwoInts;

impl ServicePair for AddTwoInts {
    type Request = AddTwoIntsRequest;
    type Response = AddTwoIntsResponse;

    fn descriptor() -> &'static TypeDescriptor {
        static DESC: TypeDescriptor = TypeDescriptor {
            type_name: "test_srvs/AddTwoInts",
            definition: "int64 a\nint64 b\n---\nint64 sum\n",
            md5sum: "6a2e34150c00229791cc89ff309fff21",
        };
        &DESC
    }
}

// ============================================================================
// Mock master
// ============================================================================

#[derive(Default)]
struct MasterState {
    /// topic -> publisher slave URIs, in registration order.
    publishers: HashMap<String, Vec<String>>,
    /// topic -> subscriber slave URIs.
    subscribers: HashMap<String, Vec<String>>,
    /// service name -> service URI.
    services: HashMap<String, String>,
}

struct MasterHandler {
    state: Mutex<MasterState>,
}

impl MasterHandler {
    fn triple(code: i32, message: &str, value: Value) -> HandlerResult {
        Ok(Value::Array(vec![
            Value::Int(code),
            Value::string(message),
            value,
        ]))
    }

    fn str_param(params: &[Value], index: usize) -> Result<String, Fault> {
        params
            .get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Fault::new(-1, format!("parameter {} must be a string", index)))
    }

    fn uri_array(uris: &[String]) -> Value {
        Value::Array(uris.iter().map(Value::string).collect())
    }

    /// Mirror of the real master: pushes the new publisher list to every
    /// registered subscriber of the topic.
    fn notify_subscribers(&self, topic: &str) {
        let (publishers, subscribers) = {
            let state = self.state.lock();
            (
                state.publishers.get(topic).cloned().unwrap_or_default(),
                state.subscribers.get(topic).cloned().unwrap_or_default(),
            )
        };
        let topic = topic.to_string();
        for subscriber_uri in subscribers {
            let publishers = publishers.clone();
            let topic = topic.clone();
            thread::spawn(move || {
                let params = [
                    Value::string("/master"),
                    Value::string(topic),
                    Value::Array(publishers.iter().map(Value::string).collect()),
                ];
                let _ = xmlrpc::call(
                    &subscriber_uri,
                    "publisherUpdate",
                    &params,
                    Duration::from_secs(5),
                );
            });
        }
    }
}

impl RpcHandler for MasterHandler {
    fn handle(&self, method: &str, params: &[Value]) -> HandlerResult {
        match method {
            "registerPublisher" => {
                let topic = Self::str_param(params, 1)?;
                let slave_uri = Self::str_param(params, 3)?;
                let subscribers = {
                    let mut state = self.state.lock();
                    let entry = state.publishers.entry(topic.clone()).or_default();
                    if !entry.contains(&slave_uri) {
                        entry.push(slave_uri);
                    }
                    state.subscribers.get(&topic).cloned().unwrap_or_default()
                };
                self.notify_subscribers(&topic);
                Self::triple(1, "registered", Self::uri_array(&subscribers))
            }

            "unregisterPublisher" => {
                let topic = Self::str_param(params, 1)?;
                let slave_uri = Self::str_param(params, 2)?;
                let removed = {
                    let mut state = self.state.lock();
                    match state.publishers.get_mut(&topic) {
                        Some(entry) => {
                            let before = entry.len();
                            entry.retain(|uri| uri != &slave_uri);
                            before - entry.len()
                        }
                        None => 0,
                    }
                };
                self.notify_subscribers(&topic);
                Self::triple(1, "", Value::Int(removed as i32))
            }

            "registerSubscriber" => {
                let topic = Self::str_param(params, 1)?;
                let slave_uri = Self::str_param(params, 3)?;
                let publishers = {
                    let mut state = self.state.lock();
                    let entry = state.subscribers.entry(topic.clone()).or_default();
                    if !entry.contains(&slave_uri) {
                        entry.push(slave_uri);
                    }
                    state.publishers.get(&topic).cloned().unwrap_or_default()
                };
                Self::triple(1, "subscribed", Self::uri_array(&publishers))
            }

            "unregisterSubscriber" => {
                let topic = Self::str_param(params, 1)?;
                let slave_uri = Self::str_param(params, 2)?;
                let removed = {
                    let mut state = self.state.lock();
                    match state.subscribers.get_mut(&topic) {
                        Some(entry) => {
                            let before = entry.len();
                            entry.retain(|uri| uri != &slave_uri);
                            before - entry.len()
                        }
                        None => 0,
                    }
                };
                Self::triple(1, "", Value::Int(removed as i32))
            }

            "registerService" => {
                let service = Self::str_param(params, 1)?;
                let service_uri = Self::str_param(params, 2)?;
                self.state.lock().services.insert(service, service_uri);
                Self::triple(1, "registered", Value::Int(0))
            }

            "unregisterService" => {
                let service = Self::str_param(params, 1)?;
                let removed = self.state.lock().services.remove(&service).is_some();
                Self::triple(1, "", Value::Int(i32::from(removed)))
            }

            "lookupService" => {
                let service = Self::str_param(params, 1)?;
                match self.state.lock().services.get(&service) {
                    Some(uri) => Self::triple(1, "", Value::string(uri)),
                    None => Self::triple(-1, &format!("no provider for {}", service), Value::Int(0)),
                }
            }

            "getUri" => Self::triple(1, "", Value::string("http://mock-master/")),

            other => Err(Fault::new(-32601, format!("unknown method {:?}", other))),
        }
    }
}

/// An in-process directory implementing the registration surface.
pub struct MockMaster {
    server: XmlRpcServer,
}

impl MockMaster {
    pub fn start() -> Self {
        let handler = Arc::new(MasterHandler {
            state: Mutex::new(MasterState::default()),
        });
        let server = XmlRpcServer::bind("127.0.0.1", "127.0.0.1", handler)
            .expect("mock master failed to bind");
        Self { server }
    }

    pub fn uri(&self) -> &str {
        self.server.uri()
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Poll `done` every 10 ms until it holds or `deadline` elapses.
pub fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

/// Build a node wired to the mock master on loopback.
pub fn test_node(name: &str, master: &MockMaster) -> roslink::Node {
    roslink::Node::builder(name)
        .master_uri(master.uri())
        .bind_host("127.0.0.1")
        .advertise_host("127.0.0.1")
        .worker_threads(4)
        .build()
        .expect("node failed to start")
}
