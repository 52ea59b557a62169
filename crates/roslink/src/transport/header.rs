// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-header codec.
//!
//! Every TCP-level protocol in the graph negotiates with a handshake block:
//!
//! ```text
//! +-----------------+------------------+------------------+----
//! | Total (4B LE)   | FieldLen (4B LE) | "key=value" UTF-8 | ...
//! +-----------------+------------------+------------------+----
//! ```
//!
//! The block is an ordered-insertion mapping; duplicate keys are a protocol
//! violation (last-writer-wins is not permitted). Decode failures are fatal
//! for the connection that produced them.

use std::fmt;
use std::io::{self, Read, Write};

use crate::transport::frame;

/// Well-known header field names.
pub mod fields {
    /// Name of the node that opened the connection.
    pub const CALLER_ID: &str = "callerid";
    /// Topic name (topic connections).
    pub const TOPIC: &str = "topic";
    /// Message or service type name.
    pub const TYPE: &str = "type";
    /// Schema digest; `*` matches anything.
    pub const MD5_CHECKSUM: &str = "md5sum";
    /// Canonical flattened type definition.
    pub const MESSAGE_DEFINITION: &str = "message_definition";
    /// Service name (service connections).
    pub const SERVICE: &str = "service";
    /// Set to `1` by latching publishers.
    pub const LATCHING: &str = "latching";
    /// Set to `1` to request Nagle-off delivery.
    pub const TCP_NODELAY: &str = "tcp_nodelay";
    /// Set to `1` to keep a service connection open across calls.
    pub const PERSISTENT: &str = "persistent";
    /// Carries a human-readable rejection reason in a reply header.
    pub const ERROR: &str = "error";
}

/// Decode failure for a connection-header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// The block ended before the declared total length.
    Truncated,
    /// The leading total length disagrees with the payload length.
    TotalLengthMismatch {
        /// Declared total.
        declared: usize,
        /// Bytes actually present.
        actual: usize,
    },
    /// A field length prefix exceeds the remaining bytes.
    FieldOverrun,
    /// A field held no `=` separator.
    MissingSeparator,
    /// A field key appeared twice.
    DuplicateKey(String),
    /// A field was not valid UTF-8.
    InvalidUtf8,
    /// A required field was absent (raised by declaration parsing).
    MissingField(&'static str),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "header block truncated"),
            Self::TotalLengthMismatch { declared, actual } => write!(
                f,
                "header total length {} does not match payload length {}",
                declared, actual
            ),
            Self::FieldOverrun => write!(f, "header field length exceeds remaining bytes"),
            Self::MissingSeparator => write!(f, "header field without '=' separator"),
            Self::DuplicateKey(key) => write!(f, "duplicate header key {:?}", key),
            Self::InvalidUtf8 => write!(f, "header field is not valid UTF-8"),
            Self::MissingField(name) => write!(f, "required header field {:?} missing", name),
        }
    }
}

impl std::error::Error for HeaderError {}

/// Ordered-insertion mapping of handshake fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    entries: Vec<(String, String)>,
}

impl ConnectionHeader {
    /// An empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing an existing value in place so the original
    /// insertion order survives.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Look up a field value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// True when the field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// True when the field is present with the value `1`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no fields are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode the full block: leading total length, then each field as
    /// `[len][key=value]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (key, value) in &self.entries {
            let field_len = key.len() + 1 + value.len();
            payload.extend_from_slice(&(field_len as u32).to_le_bytes());
            payload.extend_from_slice(key.as_bytes());
            payload.push(b'=');
            payload.extend_from_slice(value.as_bytes());
        }

        let mut block = Vec::with_capacity(4 + payload.len());
        block.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        block.extend_from_slice(&payload);
        block
    }

    /// Decode a full block produced by [`encode`](Self::encode).
    pub fn decode(block: &[u8]) -> Result<Self, HeaderError> {
        if block.len() < 4 {
            return Err(HeaderError::Truncated);
        }
        let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
        let payload = &block[4..];
        if declared != payload.len() {
            return Err(HeaderError::TotalLengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        Self::decode_fields(payload)
    }

    /// Decode the field sequence of a block (without the leading total).
    pub fn decode_fields(mut payload: &[u8]) -> Result<Self, HeaderError> {
        let mut header = Self::new();
        while !payload.is_empty() {
            if payload.len() < 4 {
                return Err(HeaderError::Truncated);
            }
            let field_len =
                u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
            payload = &payload[4..];
            if field_len > payload.len() {
                return Err(HeaderError::FieldOverrun);
            }

            let field =
                std::str::from_utf8(&payload[..field_len]).map_err(|_| HeaderError::InvalidUtf8)?;
            payload = &payload[field_len..];

            let (key, value) = field.split_once('=').ok_or(HeaderError::MissingSeparator)?;
            if header.contains(key) {
                return Err(HeaderError::DuplicateKey(key.to_string()));
            }
            header.entries.push((key.to_string(), value.to_string()));
        }
        Ok(header)
    }

    /// Write the encoded block to a stream.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())
    }

    /// Read one header block from a stream, bounding the field payload by
    /// `max_size`.
    pub fn read_from<R: Read + ?Sized>(
        reader: &mut R,
        max_size: usize,
    ) -> io::Result<Result<Self, HeaderError>> {
        let payload = frame::read_frame(reader, max_size)?;
        Ok(Self::decode_fields(&payload))
    }
}

/// Compare two schema digests under the handshake rule: exact match, or the
/// wildcard `*` on either side.
pub fn digests_compatible(ours: &str, theirs: &str) -> bool {
    ours == theirs || ours == "*" || theirs == "*"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> ConnectionHeader {
        let mut header = ConnectionHeader::new();
        header.put(fields::CALLER_ID, "/listener");
        header.put(fields::TOPIC, "/chatter");
        header.put(fields::TYPE, "std_msgs/String");
        header.put(fields::MD5_CHECKSUM, "992ce8a1687cec8c8bd883ec73ca41d1");
        header
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let header = sample();
        let decoded = ConnectionHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);

        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                fields::CALLER_ID,
                fields::TOPIC,
                fields::TYPE,
                fields::MD5_CHECKSUM
            ]
        );
    }

    #[test]
    fn test_empty_value_allowed() {
        let mut header = ConnectionHeader::new();
        header.put(fields::MESSAGE_DEFINITION, "");
        let decoded = ConnectionHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.get(fields::MESSAGE_DEFINITION), Some(""));
    }

    #[test]
    fn test_total_length_mismatch() {
        let mut block = sample().encode();
        // Corrupt the declared total.
        block[0] = block[0].wrapping_add(1);
        assert!(matches!(
            ConnectionHeader::decode(&block),
            Err(HeaderError::TotalLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_field_overrun() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_le_bytes());
        payload.extend_from_slice(b"k=v");
        assert_eq!(
            ConnectionHeader::decode_fields(&payload),
            Err(HeaderError::FieldOverrun)
        );
    }

    #[test]
    fn test_missing_separator() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(b"no_sep!");
        assert_eq!(
            ConnectionHeader::decode_fields(&payload),
            Err(HeaderError::MissingSeparator)
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut payload = Vec::new();
        for _ in 0..2 {
            payload.extend_from_slice(&3u32.to_le_bytes());
            payload.extend_from_slice(b"a=b");
        }
        assert_eq!(
            ConnectionHeader::decode_fields(&payload),
            Err(HeaderError::DuplicateKey("a".to_string()))
        );
    }

    #[test]
    fn test_put_replaces_in_place() {
        let mut header = ConnectionHeader::new();
        header.put("a", "1");
        header.put("b", "2");
        header.put("a", "3");
        assert_eq!(header.len(), 2);
        assert_eq!(header.get("a"), Some("3"));
        assert_eq!(header.iter().next(), Some(("a", "3")));
    }

    #[test]
    fn test_stream_round_trip() {
        let header = sample();
        let mut wire = Vec::new();
        header.write_to(&mut wire).unwrap();

        let mut cursor = Cursor::new(wire);
        let decoded = ConnectionHeader::read_from(&mut cursor, 1024)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_flag_semantics() {
        let mut header = ConnectionHeader::new();
        header.put(fields::LATCHING, "1");
        header.put(fields::TCP_NODELAY, "0");
        assert!(header.flag(fields::LATCHING));
        assert!(!header.flag(fields::TCP_NODELAY));
        assert!(!header.flag(fields::PERSISTENT));
    }

    #[test]
    fn test_digest_wildcard_rule() {
        assert!(digests_compatible("abc", "abc"));
        assert!(digests_compatible("*", "abc"));
        assert!(digests_compatible("abc", "*"));
        assert!(!digests_compatible("abc", "def"));
    }
}
