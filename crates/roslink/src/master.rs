// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed client for the directory (master) RPC surface.
//!
//! Every master method returns a `[status-code, status-message, value]`
//! triple with `1` success, `0` failure, `-1` error. Payloads are
//! dynamically typed on the wire; this module validates their structure
//! strictly at the boundary and converts them to typed values before
//! anything propagates inward.

use std::fmt;
use std::time::Duration;

use crate::config::DIRECTORY_RPC_TIMEOUT;
use crate::graph::{GraphName, ServiceDeclaration, TopicDeclaration};
use crate::xmlrpc::{self, Value, XmlRpcError};

/// Result type for master operations.
pub type MasterResult<T> = std::result::Result<T, MasterError>;

/// Failure talking to, or reported by, the master.
#[derive(Debug)]
pub enum MasterError {
    /// The RPC round trip itself failed.
    Transport(XmlRpcError),
    /// The master answered with a non-success status code.
    Status {
        /// `0` failure or `-1` error.
        code: i32,
        /// The master's status message.
        message: String,
    },
    /// The response payload did not have the documented shape.
    MalformedResponse(String),
}

impl fmt::Display for MasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "master transport failure: {}", e),
            Self::Status { code, message } => {
                write!(f, "master status {}: {}", code, message)
            }
            Self::MalformedResponse(msg) => write!(f, "malformed master response: {}", msg),
        }
    }
}

impl std::error::Error for MasterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<XmlRpcError> for MasterError {
    fn from(e: XmlRpcError) -> Self {
        Self::Transport(e)
    }
}

/// One topic's participant list within [`SystemState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParticipants {
    /// Topic (or service) name.
    pub name: String,
    /// Names of the participating nodes.
    pub nodes: Vec<String>,
}

/// Snapshot of the whole graph as known by the master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemState {
    /// Publishers per topic.
    pub publishers: Vec<TopicParticipants>,
    /// Subscribers per topic.
    pub subscribers: Vec<TopicParticipants>,
    /// Servers per service.
    pub services: Vec<TopicParticipants>,
}

/// Client bound to one master URI and one caller identity.
pub struct MasterClient {
    master_uri: String,
    caller_id: GraphName,
    timeout: Duration,
}

impl MasterClient {
    /// Create a client calling `master_uri` as `caller_id`.
    pub fn new(master_uri: impl Into<String>, caller_id: GraphName) -> Self {
        Self {
            master_uri: master_uri.into(),
            caller_id,
            timeout: DIRECTORY_RPC_TIMEOUT,
        }
    }

    /// The master URI this client talks to.
    pub fn master_uri(&self) -> &str {
        &self.master_uri
    }

    /// The caller name passed as first parameter of every method.
    pub fn caller_id(&self) -> &GraphName {
        &self.caller_id
    }

    // ========================================================================
    // Registration surface
    // ========================================================================

    /// Register a publisher; returns the current subscriber slave URIs.
    pub fn register_publisher(
        &self,
        topic: &TopicDeclaration,
        slave_uri: &str,
    ) -> MasterResult<Vec<String>> {
        let value = self.call(
            "registerPublisher",
            &[
                self.caller(),
                Value::string(topic.name().as_str()),
                Value::string(topic.type_name()),
                Value::string(slave_uri),
            ],
        )?;
        uri_list(&value)
    }

    /// Unregister a publisher; returns the number of registrations removed.
    pub fn unregister_publisher(
        &self,
        topic_name: &GraphName,
        slave_uri: &str,
    ) -> MasterResult<i32> {
        let value = self.call(
            "unregisterPublisher",
            &[
                self.caller(),
                Value::string(topic_name.as_str()),
                Value::string(slave_uri),
            ],
        )?;
        integer(&value)
    }

    /// Register a subscriber; returns the current publisher slave URIs.
    pub fn register_subscriber(
        &self,
        topic: &TopicDeclaration,
        slave_uri: &str,
    ) -> MasterResult<Vec<String>> {
        let value = self.call(
            "registerSubscriber",
            &[
                self.caller(),
                Value::string(topic.name().as_str()),
                Value::string(topic.type_name()),
                Value::string(slave_uri),
            ],
        )?;
        uri_list(&value)
    }

    /// Unregister a subscriber; returns the number of registrations removed.
    pub fn unregister_subscriber(
        &self,
        topic_name: &GraphName,
        slave_uri: &str,
    ) -> MasterResult<i32> {
        let value = self.call(
            "unregisterSubscriber",
            &[
                self.caller(),
                Value::string(topic_name.as_str()),
                Value::string(slave_uri),
            ],
        )?;
        integer(&value)
    }

    /// Register a service server; the result payload is ignored.
    pub fn register_service(
        &self,
        service: &ServiceDeclaration,
        service_uri: &str,
        slave_uri: &str,
    ) -> MasterResult<()> {
        self.call(
            "registerService",
            &[
                self.caller(),
                Value::string(service.name().as_str()),
                Value::string(service_uri),
                Value::string(slave_uri),
            ],
        )?;
        Ok(())
    }

    /// Unregister a service server; returns the number removed.
    pub fn unregister_service(
        &self,
        service_name: &GraphName,
        service_uri: &str,
    ) -> MasterResult<i32> {
        let value = self.call(
            "unregisterService",
            &[
                self.caller(),
                Value::string(service_name.as_str()),
                Value::string(service_uri),
            ],
        )?;
        integer(&value)
    }

    // ========================================================================
    // Query surface
    // ========================================================================

    /// Slave URI of the named node.
    pub fn lookup_node(&self, node_name: &str) -> MasterResult<String> {
        let value = self.call("lookupNode", &[self.caller(), Value::string(node_name)])?;
        uri(&value)
    }

    /// Service URI (`rosrpc://host:port`) of the named service.
    pub fn lookup_service(&self, service_name: &str) -> MasterResult<String> {
        let value = self.call(
            "lookupService",
            &[self.caller(), Value::string(service_name)],
        )?;
        uri(&value)
    }

    /// `[name, type]` pairs of topics with publishers, under `subgraph`.
    pub fn get_published_topics(&self, subgraph: &str) -> MasterResult<Vec<(String, String)>> {
        let value = self.call(
            "getPublishedTopics",
            &[self.caller(), Value::string(subgraph)],
        )?;
        pair_list(&value)
    }

    /// `[name, type]` pairs of all known topics.
    pub fn get_topic_types(&self) -> MasterResult<Vec<(String, String)>> {
        let value = self.call("getTopicTypes", &[self.caller()])?;
        pair_list(&value)
    }

    /// The master's view of every publisher, subscriber, and service.
    pub fn get_system_state(&self) -> MasterResult<SystemState> {
        let value = self.call("getSystemState", &[self.caller()])?;
        system_state(&value)
    }

    /// The master's own URI.
    pub fn get_uri(&self) -> MasterResult<String> {
        let value = self.call("getUri", &[self.caller()])?;
        uri(&value)
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn caller(&self) -> Value {
        Value::string(self.caller_id.as_str())
    }

    /// Perform one call and unwrap the status triple.
    fn call(&self, method: &str, params: &[Value]) -> MasterResult<Value> {
        let response = xmlrpc::call(&self.master_uri, method, params, self.timeout)?;
        unwrap_triple(response)
    }
}

/// Validate a `[code, message, value]` triple, returning the value on
/// success status.
pub fn unwrap_triple(response: Value) -> MasterResult<Value> {
    let items = match response {
        Value::Array(items) if items.len() == 3 => items,
        other => {
            return Err(MasterError::MalformedResponse(format!(
                "expected 3-element status triple, got {:?}",
                other
            )))
        }
    };

    let mut items = items.into_iter();
    let code = items
        .next()
        .and_then(|v| v.as_i32())
        .ok_or_else(|| MasterError::MalformedResponse("status code is not an int".to_string()))?;
    let message = items
        .next()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let value = items.next().unwrap_or(Value::Int(0));

    if code == 1 {
        Ok(value)
    } else {
        Err(MasterError::Status { code, message })
    }
}

fn integer(value: &Value) -> MasterResult<i32> {
    value
        .as_i32()
        .ok_or_else(|| MasterError::MalformedResponse(format!("expected int, got {:?}", value)))
}

fn uri(value: &Value) -> MasterResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MasterError::MalformedResponse(format!("expected URI, got {:?}", value)))
}

fn uri_list(value: &Value) -> MasterResult<Vec<String>> {
    let items = value.as_array().ok_or_else(|| {
        MasterError::MalformedResponse(format!("expected URI list, got {:?}", value))
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                MasterError::MalformedResponse(format!("URI list holds non-string {:?}", item))
            })
        })
        .collect()
}

fn pair_list(value: &Value) -> MasterResult<Vec<(String, String)>> {
    let items = value.as_array().ok_or_else(|| {
        MasterError::MalformedResponse(format!("expected pair list, got {:?}", value))
    })?;
    items
        .iter()
        .map(|item| match item.as_array() {
            Some([a, b]) => match (a.as_str(), b.as_str()) {
                (Some(a), Some(b)) => Ok((a.to_string(), b.to_string())),
                _ => Err(MasterError::MalformedResponse(
                    "pair holds non-strings".to_string(),
                )),
            },
            _ => Err(MasterError::MalformedResponse(format!(
                "expected [name, type] pair, got {:?}",
                item
            ))),
        })
        .collect()
}

fn participants(value: &Value) -> MasterResult<Vec<TopicParticipants>> {
    let items = value.as_array().ok_or_else(|| {
        MasterError::MalformedResponse("system state section is not a list".to_string())
    })?;
    items
        .iter()
        .map(|item| match item.as_array() {
            Some([name, nodes]) => {
                let name = name.as_str().ok_or_else(|| {
                    MasterError::MalformedResponse("participant name is not a string".to_string())
                })?;
                let nodes = uri_list(nodes)?;
                Ok(TopicParticipants {
                    name: name.to_string(),
                    nodes,
                })
            }
            _ => Err(MasterError::MalformedResponse(
                "expected [name, [nodes...]] entry".to_string(),
            )),
        })
        .collect()
}

fn system_state(value: &Value) -> MasterResult<SystemState> {
    match value.as_array() {
        Some([pubs, subs, srvs]) => Ok(SystemState {
            publishers: participants(pubs)?,
            subscribers: participants(subs)?,
            services: participants(srvs)?,
        }),
        _ => Err(MasterError::MalformedResponse(
            "expected [publishers, subscribers, services]".to_string(),
        )),
    }
}
