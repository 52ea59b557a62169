// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service identifiers and declarations.

use std::fmt;
use std::hash::{Hash, Hasher};

use super::GraphName;
use crate::message::TypeDescriptor;

/// Identity of a service: its name plus the URI it is advertised at.
///
/// The URI is informational; two identifiers naming the same service at
/// different addresses compare equal.
#[derive(Debug, Clone)]
pub struct ServiceId {
    name: GraphName,
    uri: Option<String>,
}

impl ServiceId {
    /// Identity for a service whose address is not yet known.
    pub fn unresolved(name: GraphName) -> Self {
        Self { name, uri: None }
    }

    /// Identity for a service advertised at `uri` (`rosrpc://host:port`).
    pub fn new(name: GraphName, uri: impl Into<String>) -> Self {
        Self {
            name,
            uri: Some(uri.into()),
        }
    }

    /// The service's graph name.
    pub fn name(&self) -> &GraphName {
        &self.name
    }

    /// The advertised URI, when known.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }
}

impl PartialEq for ServiceId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ServiceId {}

impl Hash for ServiceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uri {
            Some(uri) => write!(f, "{} ({})", self.name, uri),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Immutable description of a service endpoint.
///
/// Two declarations are equal iff their names, type names, and digests match;
/// the URI does not participate.
#[derive(Debug, Clone)]
pub struct ServiceDeclaration {
    id: ServiceId,
    type_name: String,
    definition: String,
    md5sum: String,
}

impl ServiceDeclaration {
    /// Build a declaration from its parts.
    pub fn new(
        id: ServiceId,
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

    /// Build a declaration for a service carrying the given pair type.
    pub fn from_descriptor(id: ServiceId, descriptor: &TypeDescriptor) -> Self {
        Self::new(
            id,
            descriptor.type_name,
            descriptor.definition,
            descriptor.md5sum,
        )
    }

    /// The service identity.
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// The service's graph name.
    pub fn name(&self) -> &GraphName {
        self.id.name()
    }

    /// The service type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The canonical flattened type definition.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Hex digest of the flattened service schema.
    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    /// A copy of this declaration bound to a concrete URI.
    pub fn with_uri(&self, uri: impl Into<String>) -> Self {
        Self {
            id: ServiceId::new(self.id.name().clone(), uri),
            type_name: self.type_name.clone(),
            definition: self.definition.clone(),
            md5sum: self.md5sum.clone(),
        }
    }
}

impl PartialEq for ServiceDeclaration {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.type_name == other.type_name && self.md5sum == other.md5sum
    }
}

impl Eq for ServiceDeclaration {}

impl fmt::Display for ServiceDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service<{}, {}>", self.id, self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_uri() {
        let name = GraphName::new("/add_two_ints").unwrap();
        let a = ServiceDeclaration::new(
            ServiceId::new(name.clone(), "rosrpc://a:1"),
            "test/AddTwoInts",
            "int64 a\nint64 b",
            "6a2e34150c00229791cc89ff309fff21",
        );
        let b = a.with_uri("rosrpc://b:2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_requires_matching_digest() {
        let name = GraphName::new("/add_two_ints").unwrap();
        let a = ServiceDeclaration::new(
            ServiceId::unresolved(name.clone()),
            "test/AddTwoInts",
            "",
            "aaaa",
        );
        let b = ServiceDeclaration::new(ServiceId::unresolved(name), "test/AddTwoInts", "", "bbbb");
        assert_ne!(a, b);
    }
}
