// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node directory endpoint ("slave API").
//!
//! The master and peer nodes reach this node through a small XML-RPC
//! surface: `requestTopic` negotiates a topic connection, `publisherUpdate`
//! pushes the authoritative publisher set into the connection manager, and
//! the remaining methods report node state. Every result is the standard
//! `[status-code, status-message, value]` triple.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::xmlrpc::{Fault, HandlerResult, RpcHandler, Value};

use super::NodeInner;

pub(crate) struct SlaveHandler {
    node: Mutex<Option<Weak<NodeInner>>>,
}

impl SlaveHandler {
    pub fn new() -> Self {
        Self {
            node: Mutex::new(None),
        }
    }

    /// Wire the handler to its node; called once construction completes.
    pub fn attach(&self, node: Weak<NodeInner>) {
        *self.node.lock() = Some(node);
    }

    fn node(&self) -> Option<Arc<NodeInner>> {
        self.node.lock().as_ref().and_then(Weak::upgrade)
    }
}

fn triple(code: i32, message: impl Into<String>, value: Value) -> Value {
    Value::Array(vec![Value::Int(code), Value::Str(message.into()), value])
}

fn ok(value: Value) -> HandlerResult {
    Ok(triple(1, "", value))
}

fn failed(message: impl Into<String>) -> HandlerResult {
    Ok(triple(0, message, Value::Int(0)))
}

fn param_str<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, Fault> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| Fault::new(-1, format!("parameter {} ({}) must be a string", index, name)))
}

impl RpcHandler for SlaveHandler {
    fn handle(&self, method: &str, params: &[Value]) -> HandlerResult {
        let Some(node) = self.node() else {
            return Err(Fault::new(-1, "node is not available"));
        };

        match method {
            "requestTopic" => {
                let _caller = param_str(params, 0, "caller_id")?;
                let topic = param_str(params, 1, "topic")?;
                let protocols = params
                    .get(2)
                    .and_then(Value::as_array)
                    .ok_or_else(|| Fault::new(-1, "parameter 2 (protocols) must be a list"))?;

                let tcpros_requested = protocols.iter().any(|entry| {
                    entry
                        .as_array()
                        .and_then(|fields| fields.first())
                        .and_then(Value::as_str)
                        == Some("TCPROS")
                });
                if !tcpros_requested {
                    return failed("no supported protocol requested");
                }

                match node.topic_address(topic) {
                    Some((host, port)) => ok(Value::Array(vec![
                        Value::string("TCPROS"),
                        Value::string(host),
                        Value::Int(i32::from(port)),
                    ])),
                    None => failed(format!("no publishers for topic {}", topic)),
                }
            }

            "publisherUpdate" => {
                let _caller = param_str(params, 0, "caller_id")?;
                let topic = param_str(params, 1, "topic")?;
                let uris = params
                    .get(2)
                    .and_then(Value::as_array)
                    .ok_or_else(|| Fault::new(-1, "parameter 2 (publishers) must be a list"))?;
                let uris: Vec<String> = uris
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();

                if node.publisher_update(topic, uris) {
                    ok(Value::Int(0))
                } else {
                    failed(format!("not subscribed to {}", topic))
                }
            }

            "getMasterUri" => ok(Value::string(node.master_uri())),

            "getPid" => ok(Value::Int(std::process::id() as i32)),

            "getPublications" => {
                let pairs = node
                    .publications()
                    .into_iter()
                    .map(|(name, type_name)| {
                        Value::Array(vec![Value::Str(name), Value::Str(type_name)])
                    })
                    .collect();
                ok(Value::Array(pairs))
            }

            "getSubscriptions" => {
                let pairs = node
                    .subscriptions()
                    .into_iter()
                    .map(|(name, type_name)| {
                        Value::Array(vec![Value::Str(name), Value::Str(type_name)])
                    })
                    .collect();
                ok(Value::Array(pairs))
            }

            "shutdown" => {
                let caller = param_str(params, 0, "caller_id")?;
                let reason = params.get(1).and_then(Value::as_str).unwrap_or("");
                info!("shutdown requested by {}: {}", caller, reason);
                // Tear down off this thread so the reply still goes out.
                std::thread::spawn(move || node.shutdown());
                ok(Value::Int(0))
            }

            other => Err(Fault::new(-32601, format!("unknown method {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_handler_faults() {
        let handler = SlaveHandler::new();
        let result = handler.handle("getPid", &[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_triple_shape() {
        let value = triple(1, "ready", Value::Int(7));
        assert_eq!(
            value,
            Value::Array(vec![Value::Int(1), Value::string("ready"), Value::Int(7)])
        );
    }

    #[test]
    fn test_param_str_validation() {
        let params = vec![Value::Int(3)];
        assert!(param_str(&params, 0, "caller_id").is_err());
        assert!(param_str(&params, 1, "topic").is_err());

        let params = vec![Value::string("/node")];
        assert_eq!(param_str(&params, 0, "caller_id").unwrap(), "/node");
    }
}
