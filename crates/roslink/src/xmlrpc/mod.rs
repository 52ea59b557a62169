// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal XML-RPC value model and codec.
//!
//! The directory RPC surface rides on XML-RPC over HTTP. This module covers
//! exactly the subset the graph protocol uses - `int`/`i4`, `boolean`,
//! `string`, `double`, `array`, and `struct` (for faults) - with a strict
//! recursive-descent parser. Dynamically-typed payloads are converted to
//! [`Value`] variants at the boundary and validated before anything
//! propagates inward.

mod client;
mod server;

pub use client::call;
pub use server::{Fault, HandlerResult, RpcHandler, XmlRpcServer};

use std::fmt;
use std::io;

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `<int>` / `<i4>`
    Int(i32),
    /// `<boolean>`
    Bool(bool),
    /// `<string>` or untyped text
    Str(String),
    /// `<double>`
    Double(f64),
    /// `<array>`
    Array(Vec<Value>),
    /// `<struct>` (used by fault payloads)
    Struct(Vec<(String, Value)>),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// The value as an `i32`, if it is one.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// A struct member by name, if this is a struct.
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Struct(members) => members.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    fn write_xml(&self, out: &mut String) {
        match self {
            Self::Int(i) => {
                out.push_str("<value><int>");
                out.push_str(&i.to_string());
                out.push_str("</int></value>");
            }
            Self::Bool(b) => {
                out.push_str("<value><boolean>");
                out.push(if *b { '1' } else { '0' });
                out.push_str("</boolean></value>");
            }
            Self::Str(s) => {
                out.push_str("<value><string>");
                escape_into(s, out);
                out.push_str("</string></value>");
            }
            Self::Double(d) => {
                out.push_str("<value><double>");
                out.push_str(&d.to_string());
                out.push_str("</double></value>");
            }
            Self::Array(items) => {
                out.push_str("<value><array><data>");
                for item in items {
                    item.write_xml(out);
                }
                out.push_str("</data></array></value>");
            }
            Self::Struct(members) => {
                out.push_str("<value><struct>");
                for (name, value) in members {
                    out.push_str("<member><name>");
                    escape_into(name, out);
                    out.push_str("</name>");
                    value.write_xml(out);
                    out.push_str("</member>");
                }
                out.push_str("</struct></value>");
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

/// Errors produced by XML-RPC transport and parsing.
#[derive(Debug)]
pub enum XmlRpcError {
    /// Socket-level failure.
    Io(io::Error),
    /// The HTTP envelope was unusable (bad status, missing body).
    Http(String),
    /// The XML payload did not match the expected grammar.
    Malformed(String),
    /// The remote endpoint returned a fault.
    Fault {
        /// `faultCode`
        code: i32,
        /// `faultString`
        message: String,
    },
}

impl fmt::Display for XmlRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Http(msg) => write!(f, "HTTP error: {}", msg),
            Self::Malformed(msg) => write!(f, "malformed XML-RPC payload: {}", msg),
            Self::Fault { code, message } => write!(f, "fault {}: {}", code, message),
        }
    }
}

impl std::error::Error for XmlRpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for XmlRpcError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let (replacement, entity_len) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else if rest.starts_with("&quot;") {
            ('"', 6)
        } else if rest.starts_with("&apos;") {
            ('\'', 6)
        } else {
            ('&', 1)
        };
        out.push(replacement);
        rest = &rest[entity_len..];
    }
    out.push_str(rest);
    out
}

/// Encode a method call document.
pub fn encode_request(method: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\"?>");
    out.push_str("<methodCall><methodName>");
    escape_into(method, &mut out);
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        param.write_xml(&mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Encode a successful method response document.
pub fn encode_response(result: &Value) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\"?>");
    out.push_str("<methodResponse><params><param>");
    result.write_xml(&mut out);
    out.push_str("</param></params></methodResponse>");
    out
}

/// Encode a fault response document.
pub fn encode_fault(code: i32, message: &str) -> String {
    let fault = Value::Struct(vec![
        ("faultCode".to_string(), Value::Int(code)),
        ("faultString".to_string(), Value::string(message)),
    ]);
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\"?>");
    out.push_str("<methodResponse><fault>");
    fault.write_xml(&mut out);
    out.push_str("</fault></methodResponse>");
    out
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a method response document into its result value.
///
/// A fault document surfaces as [`XmlRpcError::Fault`].
pub fn parse_response(xml: &str) -> Result<Value, XmlRpcError> {
    let mut parser = Parser::new(xml);
    parser.skip_declaration();
    parser.skip_ws();
    parser.expect("<methodResponse>")?;
    parser.skip_ws();

    if parser.eat("<fault>") {
        let fault = parser.parse_value()?;
        let code = fault
            .member("faultCode")
            .and_then(Value::as_i32)
            .unwrap_or(-1);
        let message = fault
            .member("faultString")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return Err(XmlRpcError::Fault { code, message });
    }

    parser.expect("<params>")?;
    parser.skip_ws();
    parser.expect("<param>")?;
    let value = parser.parse_value()?;
    parser.skip_ws();
    parser.expect("</param>")?;
    parser.skip_ws();
    parser.expect("</params>")?;
    parser.skip_ws();
    parser.expect("</methodResponse>")?;
    Ok(value)
}

/// Parse a method call document into `(method, params)`.
pub fn parse_request(xml: &str) -> Result<(String, Vec<Value>), XmlRpcError> {
    let mut parser = Parser::new(xml);
    parser.skip_declaration();
    parser.skip_ws();
    parser.expect("<methodCall>")?;
    parser.skip_ws();
    parser.expect("<methodName>")?;
    let method = unescape(parser.take_until("</methodName>")?);
    parser.skip_ws();

    let mut params = Vec::new();
    if parser.eat("<params>") {
        loop {
            parser.skip_ws();
            if parser.eat("</params>") {
                break;
            }
            parser.expect("<param>")?;
            params.push(parser.parse_value()?);
            parser.skip_ws();
            parser.expect("</param>")?;
        }
        parser.skip_ws();
    }
    parser.expect("</methodCall>")?;
    Ok((method, params))
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn skip_declaration(&mut self) {
        self.skip_ws();
        if self.rest().starts_with("<?xml") {
            if let Some(end) = self.rest().find("?>") {
                self.pos += end + 2;
            }
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), XmlRpcError> {
        if self.eat(token) {
            Ok(())
        } else {
            let context: String = self.rest().chars().take(32).collect();
            Err(XmlRpcError::Malformed(format!(
                "expected {:?} at {:?}",
                token, context
            )))
        }
    }

    fn take_until(&mut self, token: &str) -> Result<&'a str, XmlRpcError> {
        match self.rest().find(token) {
            Some(idx) => {
                let text = &self.rest()[..idx];
                self.pos += idx + token.len();
                Ok(text)
            }
            None => Err(XmlRpcError::Malformed(format!(
                "unterminated element, missing {:?}",
                token
            ))),
        }
    }

    fn parse_value(&mut self) -> Result<Value, XmlRpcError> {
        self.skip_ws();
        self.expect("<value>")?;

        let value = if self.eat("<int>") {
            self.parse_int("</int>")?
        } else if self.eat("<i4>") {
            self.parse_int("</i4>")?
        } else if self.eat("<boolean>") {
            let text = self.take_until("</boolean>")?;
            Value::Bool(text.trim() == "1")
        } else if self.eat("<string>") {
            Value::Str(unescape(self.take_until("</string>")?))
        } else if self.eat("<double>") {
            let text = self.take_until("</double>")?;
            let parsed = text
                .trim()
                .parse::<f64>()
                .map_err(|_| XmlRpcError::Malformed(format!("bad double {:?}", text)))?;
            Value::Double(parsed)
        } else if self.eat("<array>") {
            self.skip_ws();
            self.expect("<data>")?;
            let mut items = Vec::new();
            loop {
                self.skip_ws();
                if self.eat("</data>") {
                    break;
                }
                items.push(self.parse_value()?);
            }
            self.skip_ws();
            self.expect("</array>")?;
            Value::Array(items)
        } else if self.eat("<struct>") {
            let mut members = Vec::new();
            loop {
                self.skip_ws();
                if self.eat("</struct>") {
                    break;
                }
                self.expect("<member>")?;
                self.skip_ws();
                self.expect("<name>")?;
                let name = unescape(self.take_until("</name>")?);
                let value = self.parse_value()?;
                self.skip_ws();
                self.expect("</member>")?;
                members.push((name, value));
            }
            Value::Struct(members)
        } else {
            // Untyped content is a string per the XML-RPC specification.
            return Ok(Value::Str(unescape(self.take_until("</value>")?)));
        };

        self.skip_ws();
        self.expect("</value>")?;
        Ok(value)
    }

    fn parse_int(&mut self, closing: &str) -> Result<Value, XmlRpcError> {
        let text = self.take_until(closing)?;
        let parsed = text
            .trim()
            .parse::<i32>()
            .map_err(|_| XmlRpcError::Malformed(format!("bad integer {:?}", text)))?;
        Ok(Value::Int(parsed))
    }
}
