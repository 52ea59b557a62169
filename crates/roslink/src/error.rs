// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Per-connection failures (handshake mismatch, transport errors, malformed
//! headers) are demoted to per-connection teardown and never escalate to
//! process exit. Programmer errors (duplicate service, bad URIs) surface
//! immediately to the caller.

use std::fmt;
use std::io;

use crate::graph::{GraphName, NameError};
use crate::master::MasterError;
use crate::message::CodecError;
use crate::transport::HeaderError;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], suitable for listener callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Digest disagreement during a handshake; fatal for that connection.
    HandshakeMismatch,
    /// Socket read/write error or unexpected EOF; fatal for that connection.
    Transport,
    /// Non-success status or malformed payload from the master.
    Master,
    /// A second server was created for an existing service name.
    DuplicateService,
    /// Normal shutdown; silent.
    Cancelled,
    /// Message or header serialization failure.
    Codec,
    /// Caller-supplied argument was invalid (URI, name, type mismatch).
    InvalidArgument,
    /// The remote service reported a failure for a request.
    ServiceFailure,
}

/// Errors returned by runtime operations.
#[derive(Debug)]
pub enum Error {
    /// Peer advertised a schema digest incompatible with ours.
    HandshakeMismatch {
        /// Digest carried by our declaration.
        expected: String,
        /// Digest presented by the peer.
        actual: String,
    },

    /// Socket-level failure; the owning connection is torn down.
    Transport(io::Error),

    /// Connection-header decode failure; treated as a transport error.
    MalformedHeader(HeaderError),

    /// Directory (master) RPC failure.
    Master(MasterError),

    /// A service server already exists under this name on this node.
    DuplicateService(GraphName),

    /// Operation raced with shutdown.
    Cancelled,

    /// Message encode/decode failure.
    Codec(CodecError),

    /// A URI could not be parsed or dialed.
    InvalidUri(String),

    /// A graph name failed validation.
    InvalidName(NameError),

    /// An endpoint already exists for this topic with a different type.
    TypeMismatch {
        /// Topic the caller addressed.
        topic: GraphName,
        /// Type name of the existing endpoint.
        registered: String,
        /// Type name the caller requested.
        requested: String,
    },

    /// The remote service returned a failure status with this message.
    ServiceFailure(String),
}

impl Error {
    /// Classify this error for listener observability.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HandshakeMismatch { .. } => ErrorKind::HandshakeMismatch,
            Self::Transport(_) => ErrorKind::Transport,
            // Malformed headers are handled exactly like transport faults.
            Self::MalformedHeader(_) => ErrorKind::Transport,
            Self::Master(_) => ErrorKind::Master,
            Self::DuplicateService(_) => ErrorKind::DuplicateService,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Codec(_) => ErrorKind::Codec,
            Self::InvalidUri(_) | Self::InvalidName(_) | Self::TypeMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::ServiceFailure(_) => ErrorKind::ServiceFailure,
        }
    }

    /// True when the error is fatal for the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::HandshakeMismatch | ErrorKind::Transport
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeMismatch { expected, actual } => {
                write!(f, "handshake digest mismatch: {} != {}", expected, actual)
            }
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::MalformedHeader(e) => write!(f, "malformed connection header: {}", e),
            Self::Master(e) => write!(f, "master error: {}", e),
            Self::DuplicateService(name) => write!(f, "service already advertised: {}", name),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::InvalidUri(uri) => write!(f, "invalid URI: {}", uri),
            Self::InvalidName(e) => write!(f, "invalid graph name: {}", e),
            Self::TypeMismatch {
                topic,
                registered,
                requested,
            } => write!(
                f,
                "topic {} already uses type {} (requested {})",
                topic, registered, requested
            ),
            Self::ServiceFailure(msg) => write!(f, "service call failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::MalformedHeader(e) => Some(e),
            Self::Master(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Self::MalformedHeader(e)
    }
}

impl From<MasterError> for Error {
    fn from(e: MasterError) -> Self {
        Self::Master(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<NameError> for Error {
    fn from(e: NameError) -> Self {
        Self::InvalidName(e)
    }
}
