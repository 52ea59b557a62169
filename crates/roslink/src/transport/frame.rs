// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing.
//!
//! TCP is a stream without message boundaries; every payload on a topic or
//! service connection travels as:
//!
//! ```text
//! +----------------+------------------+
//! | Length (4B LE) | Payload          |
//! +----------------+------------------+
//! ```
//!
//! The length field counts the payload only. Reads are blocking; callers
//! bound them with socket timeouts where the protocol requires one.

use std::io::{self, Read, Write};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_LEN: usize = 4;

/// Encode a payload into a fresh framed buffer.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    encode_into(payload, &mut framed);
    framed
}

/// Append `[length][payload]` to an existing buffer.
pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Write one framed payload.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)
}

/// Read one framed payload, rejecting frames larger than `max_size`.
///
/// A clean EOF at a frame boundary surfaces as `UnexpectedEof`; callers
/// treat it as connection close.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_size: usize) -> io::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;

    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max_size),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_layout() {
        let framed = encode(b"hello");
        assert_eq!(&framed[..4], &5u32.to_le_bytes());
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_round_trip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").unwrap();
        write_frame(&mut wire, b"").unwrap();
        write_frame(&mut wire, b"third").unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor, 1024).unwrap(), b"first");
        assert_eq!(read_frame(&mut cursor, 1024).unwrap(), b"");
        assert_eq!(read_frame(&mut cursor, 1024).unwrap(), b"third");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let framed = encode(&vec![0u8; 64]);
        let mut cursor = Cursor::new(framed);
        let err = read_frame(&mut cursor, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_body_is_eof() {
        let framed = encode(b"truncated body");
        let mut cursor = Cursor::new(&framed[..8]);
        let err = read_frame(&mut cursor, 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_eof_at_boundary() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_frame(&mut cursor, 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
