// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic identifiers and declarations.

use std::fmt;

use super::GraphName;
use crate::message::TypeDescriptor;
use crate::transport::header::{fields, ConnectionHeader, HeaderError};

/// Identity of a topic inside the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicId {
    name: GraphName,
}

impl TopicId {
    /// Wrap a resolved topic name.
    pub fn new(name: GraphName) -> Self {
        Self { name }
    }

    /// The topic's graph name.
    pub fn name(&self) -> &GraphName {
        &self.name
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Immutable description of a topic: identity, type name, the canonical
/// flattened type definition, and the schema digest.
///
/// A reconnect to the same topic always reuses the declaration that opened
/// the original connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicDeclaration {
    id: TopicId,
    type_name: String,
    definition: String,
    md5sum: String,
}

impl TopicDeclaration {
    /// Build a declaration from its parts.
    pub fn new(
        id: TopicId,
        type_name: impl Into<String>,
        definition: impl Into<String>,
        md5sum: impl Into<String>,
    ) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            definition: definition.into(),
            md5sum: md5sum.into(),
        }
    }

    /// Build a declaration for a topic carrying the given message type.
    pub fn from_descriptor(name: GraphName, descriptor: &TypeDescriptor) -> Self {
        Self::new(
            TopicId::new(name),
            descriptor.type_name,
            descriptor.definition,
            descriptor.md5sum,
        )
    }

    /// Rebuild a declaration from a peer's connection header.
    pub fn from_header(header: &ConnectionHeader) -> Result<Self, HeaderError> {
        let name = header
            .get(fields::TOPIC)
            .ok_or(HeaderError::MissingField(fields::TOPIC))?;
        let name =
            GraphName::new(name).map_err(|_| HeaderError::MissingField(fields::TOPIC))?;
        let type_name = header
            .get(fields::TYPE)
            .ok_or(HeaderError::MissingField(fields::TYPE))?;
        let md5sum = header
            .get(fields::MD5_CHECKSUM)
            .ok_or(HeaderError::MissingField(fields::MD5_CHECKSUM))?;
        let definition = header.get(fields::MESSAGE_DEFINITION).unwrap_or("");
        Ok(Self::new(TopicId::new(name), type_name, definition, md5sum))
    }

    /// The topic identity.
    pub fn id(&self) -> &TopicId {
        &self.id
    }

    /// The topic's graph name.
    pub fn name(&self) -> &GraphName {
        self.id.name()
    }

    /// The message type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The canonical flattened type definition.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Hex digest of the flattened message schema.
    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    /// The declaration as handshake header fields.
    pub fn to_connection_header(&self) -> ConnectionHeader {
        let mut header = ConnectionHeader::new();
        header.put(fields::TOPIC, self.name().as_str());
        header.put(fields::TYPE, &self.type_name);
        header.put(fields::MD5_CHECKSUM, &self.md5sum);
        header.put(fields::MESSAGE_DEFINITION, &self.definition);
        header
    }

    /// `[name, type]` pair as reported by the directory.
    pub fn to_pair(&self) -> (String, String) {
        (self.name().to_string(), self.type_name.clone())
    }
}

impl fmt::Display for TopicDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic<{}, {}>", self.id, self.type_name)
    }
}
