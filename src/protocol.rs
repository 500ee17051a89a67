// Copyright 2026 Joyent, Inc.

//! Token codec for the replica protocol.
//!
//! Every metadata frame is a fixed 24-byte header followed by a token
//! stream. A token is `identifier:u16 | type:u8 | value`, little-endian
//! throughout, where the type tag alone determines the value's width. That
//! property is what makes unknown identifiers skippable: a decoder that has
//! never heard of an identifier can still step over its value.
//!
//! The typed containers in this module ([`RequestTokens`],
//! [`ResponseTokens`], [`ContextRequestTokens`], [`ContextResponseTokens`])
//! are the schema tables for the four message kinds. Encoding writes only
//! the fields that are present and computes the exact byte length up front,
//! so the output buffer is reserved once and never resized mid-encode.
//! Decoding fills the fields it knows and skips the rest.

use std::fmt;
use std::str;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::errors::{ReplicaError, Result};

pub const RP_PROTOCOL_VERSION: u32 = 1;
pub const RP_STATUS_OK: u32 = 200;

/*
 * Metadata frame layout. The length field is self-inclusive: it counts the
 * whole frame, its own four bytes included. Requests carry resource and
 * operation type words where responses carry a status word, so the fixed
 * header is 24 bytes either way and the token stream starts at RP_OFF_TOKENS.
 */
pub const RP_OFF_LEN: usize = 0x0;
pub const RP_OFF_RESOURCE_TYPE: usize = 0x4;
pub const RP_OFF_OPERATION_TYPE: usize = 0x6;
pub const RP_OFF_STATUS: usize = 0x4;
pub const RP_OFF_ACTIVITY_ID: usize = 0x8;
pub const RP_OFF_TOKENS: usize = 0x18;

pub const RP_METADATA_HEADER_SZ: usize = RP_OFF_TOKENS;
pub const RP_LEN_PREFIX_SZ: usize = 4;
pub const RP_ACTIVITY_ID_SZ: usize = 16;

/// Identifier plus type tag.
const RP_TOKEN_HEADER_SZ: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ResourceType {
    Connection = 0x0000,
    Database = 0x0001,
    Document = 0x0002,
    Collection = 0x0003,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum OperationType {
    Connection = 0x0000,
    Create = 0x0001,
    Read = 0x0002,
    Replace = 0x0003,
    Delete = 0x0004,
    Query = 0x0005,
}

/// Wire type tags. Fixed-width tags encode their width directly; the three
/// variable-width families differ only in the width of their length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TokenType {
    Byte = 0x00,
    UShort = 0x01,
    ULong = 0x02,
    Long = 0x03,
    ULongLong = 0x04,
    LongLong = 0x05,
    Float = 0x06,
    Double = 0x07,
    Guid = 0x08,
    SmallString = 0x09,
    SmallBytes = 0x0a,
    String = 0x0b,
    Bytes = 0x0c,
    ULongString = 0x0d,
    ULongBytes = 0x0e,
}

/// Token identifiers for context-request streams.
pub mod context_request_id {
    pub const PROTOCOL_VERSION: u16 = 0x0000;
    pub const CLIENT_VERSION: u16 = 0x0001;
    pub const USER_AGENT: u16 = 0x0002;
}

/// Token identifiers for context-response streams.
pub mod context_response_id {
    pub const PROTOCOL_VERSION: u16 = 0x0000;
    pub const SERVER_AGENT: u16 = 0x0001;
    pub const SERVER_VERSION: u16 = 0x0002;
}

/// Token identifiers for request streams.
pub mod request_id {
    pub const RESOURCE_ID: u16 = 0x0000;
    pub const AUTHORIZATION: u16 = 0x0001;
    pub const DATE: u16 = 0x0002;
    pub const CLIENT_VERSION: u16 = 0x0003;
    pub const REPLICA_PATH: u16 = 0x0004;
    pub const TRANSPORT_REQUEST_ID: u16 = 0x0005;
    pub const PAYLOAD_PRESENT: u16 = 0x0006;
    pub const ENTITY_ID: u16 = 0x0007;
}

/// Token identifiers for response streams.
pub mod response_id {
    pub const TRANSPORT_REQUEST_ID: u16 = 0x0000;
    pub const PAYLOAD_PRESENT: u16 = 0x0001;
    pub const REQUEST_CHARGE: u16 = 0x0002;
    pub const ITEM_COUNT: u16 = 0x0003;
    pub const SERVER_VERSION: u16 = 0x0004;
}

/// Opaque 16-byte correlation identifier, generated fresh per logical
/// operation and echoed by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityId(pub [u8; RP_ACTIVITY_ID_SZ]);

impl ActivityId {
    pub fn new() -> ActivityId {
        ActivityId(rand::random())
    }

    /// Panics if `bytes` is not exactly 16 bytes; callers slice out of a
    /// header whose size has already been validated.
    pub fn from_slice(bytes: &[u8]) -> ActivityId {
        let mut id = [0u8; RP_ACTIVITY_ID_SZ];
        id.copy_from_slice(bytes);
        ActivityId(id)
    }
}

impl Default for ActivityId {
    fn default() -> ActivityId {
        ActivityId::new()
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One decoded token value. The variant fixes the wire type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Byte(u8),
    UShort(u16),
    ULong(u32),
    Long(i32),
    ULongLong(u64),
    LongLong(i64),
    Float(f32),
    Double(f64),
    Guid([u8; 16]),
    SmallString(String),
    SmallBytes(Vec<u8>),
    String(String),
    Bytes(Vec<u8>),
    ULongString(String),
    ULongBytes(Vec<u8>),
}

impl TokenValue {
    pub fn token_type(&self) -> TokenType {
        match self {
            TokenValue::Byte(_) => TokenType::Byte,
            TokenValue::UShort(_) => TokenType::UShort,
            TokenValue::ULong(_) => TokenType::ULong,
            TokenValue::Long(_) => TokenType::Long,
            TokenValue::ULongLong(_) => TokenType::ULongLong,
            TokenValue::LongLong(_) => TokenType::LongLong,
            TokenValue::Float(_) => TokenType::Float,
            TokenValue::Double(_) => TokenType::Double,
            TokenValue::Guid(_) => TokenType::Guid,
            TokenValue::SmallString(_) => TokenType::SmallString,
            TokenValue::SmallBytes(_) => TokenType::SmallBytes,
            TokenValue::String(_) => TokenType::String,
            TokenValue::Bytes(_) => TokenType::Bytes,
            TokenValue::ULongString(_) => TokenType::ULongString,
            TokenValue::ULongBytes(_) => TokenType::ULongBytes,
        }
    }

    /// Byte count of the encoded value, length prefix included, token
    /// header excluded.
    pub fn encoded_len(&self) -> usize {
        match self {
            TokenValue::Byte(_) => 1,
            TokenValue::UShort(_) => 2,
            TokenValue::ULong(_) | TokenValue::Long(_) | TokenValue::Float(_) => 4,
            TokenValue::ULongLong(_) | TokenValue::LongLong(_) | TokenValue::Double(_) => 8,
            TokenValue::Guid(_) => 16,
            TokenValue::SmallString(s) => 1 + s.len(),
            TokenValue::SmallBytes(b) => 1 + b.len(),
            TokenValue::String(s) => 2 + s.len(),
            TokenValue::Bytes(b) => 2 + b.len(),
            TokenValue::ULongString(s) => 4 + s.len(),
            TokenValue::ULongBytes(b) => 4 + b.len(),
        }
    }

    /// Checks that a variable-length value fits its length prefix.
    pub fn check_width(&self) -> Result<()> {
        let (len, max) = match self {
            TokenValue::SmallString(s) => (s.len(), u8::max_value() as usize),
            TokenValue::SmallBytes(b) => (b.len(), u8::max_value() as usize),
            TokenValue::String(s) => (s.len(), u16::max_value() as usize),
            TokenValue::Bytes(b) => (b.len(), u16::max_value() as usize),
            TokenValue::ULongString(s) => (s.len(), u32::max_value() as usize),
            TokenValue::ULongBytes(b) => (b.len(), u32::max_value() as usize),
            _ => return Ok(()),
        };
        if len > max {
            return Err(ReplicaError::MalformedToken(format!(
                "value length {} exceeds the {:?} maximum of {}",
                len,
                self.token_type(),
                max
            )));
        }
        Ok(())
    }

    fn put(&self, buf: &mut BytesMut) {
        match self {
            TokenValue::Byte(v) => buf.put_u8(*v),
            TokenValue::UShort(v) => buf.put_u16_le(*v),
            TokenValue::ULong(v) => buf.put_u32_le(*v),
            TokenValue::Long(v) => buf.put_i32_le(*v),
            TokenValue::ULongLong(v) => buf.put_u64_le(*v),
            TokenValue::LongLong(v) => buf.put_i64_le(*v),
            TokenValue::Float(v) => buf.put_f32_le(*v),
            TokenValue::Double(v) => buf.put_f64_le(*v),
            TokenValue::Guid(v) => buf.put_slice(v),
            TokenValue::SmallString(s) => {
                buf.put_u8(s.len() as u8);
                buf.put_slice(s.as_bytes());
            }
            TokenValue::SmallBytes(b) => {
                buf.put_u8(b.len() as u8);
                buf.put_slice(b);
            }
            TokenValue::String(s) => {
                buf.put_u16_le(s.len() as u16);
                buf.put_slice(s.as_bytes());
            }
            TokenValue::Bytes(b) => {
                buf.put_u16_le(b.len() as u16);
                buf.put_slice(b);
            }
            TokenValue::ULongString(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            TokenValue::ULongBytes(b) => {
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }
}

/// One identifier/value pair out of a token stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: u16,
    pub value: TokenValue,
}

/// Appends one token. The value must already satisfy
/// [`TokenValue::check_width`].
pub fn put_token(buf: &mut BytesMut, id: u16, value: &TokenValue) {
    buf.put_u16_le(id);
    buf.put_u8(value.token_type() as u8);
    value.put(buf);
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize, what: &str) -> Result<&'a [u8]> {
    if buf.len() - *pos < n {
        return Err(ReplicaError::MalformedToken(format!(
            "{} needs {} bytes but only {} remain",
            what,
            n,
            buf.len() - *pos
        )));
    }
    let slice = &buf[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

fn utf8(bytes: &[u8]) -> Result<String> {
    str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| ReplicaError::MalformedToken("string token is not valid UTF-8".to_string()))
}

/// Reads one token at `*pos`, advancing past it. Fails on an unknown type
/// tag or a length prefix that overruns the buffer.
pub fn get_token(buf: &[u8], pos: &mut usize) -> Result<Token> {
    let header = take(buf, pos, RP_TOKEN_HEADER_SZ, "token header")?;
    let id = LittleEndian::read_u16(&header[0..2]);
    let tag = header[2];
    let token_type: TokenType =
        FromPrimitive::from_u8(tag).ok_or(ReplicaError::UnsupportedTokenType(tag))?;

    let value = match token_type {
        TokenType::Byte => TokenValue::Byte(take(buf, pos, 1, "Byte value")?[0]),
        TokenType::UShort => {
            TokenValue::UShort(LittleEndian::read_u16(take(buf, pos, 2, "UShort value")?))
        }
        TokenType::ULong => {
            TokenValue::ULong(LittleEndian::read_u32(take(buf, pos, 4, "ULong value")?))
        }
        TokenType::Long => {
            TokenValue::Long(LittleEndian::read_i32(take(buf, pos, 4, "Long value")?))
        }
        TokenType::ULongLong => {
            TokenValue::ULongLong(LittleEndian::read_u64(take(buf, pos, 8, "ULongLong value")?))
        }
        TokenType::LongLong => {
            TokenValue::LongLong(LittleEndian::read_i64(take(buf, pos, 8, "LongLong value")?))
        }
        TokenType::Float => {
            TokenValue::Float(LittleEndian::read_f32(take(buf, pos, 4, "Float value")?))
        }
        TokenType::Double => {
            TokenValue::Double(LittleEndian::read_f64(take(buf, pos, 8, "Double value")?))
        }
        TokenType::Guid => {
            let mut guid = [0u8; 16];
            guid.copy_from_slice(take(buf, pos, 16, "Guid value")?);
            TokenValue::Guid(guid)
        }
        TokenType::SmallString => {
            let len = take(buf, pos, 1, "SmallString length")?[0] as usize;
            TokenValue::SmallString(utf8(take(buf, pos, len, "SmallString value")?)?)
        }
        TokenType::SmallBytes => {
            let len = take(buf, pos, 1, "SmallBytes length")?[0] as usize;
            TokenValue::SmallBytes(take(buf, pos, len, "SmallBytes value")?.to_vec())
        }
        TokenType::String => {
            let len = LittleEndian::read_u16(take(buf, pos, 2, "String length")?) as usize;
            TokenValue::String(utf8(take(buf, pos, len, "String value")?)?)
        }
        TokenType::Bytes => {
            let len = LittleEndian::read_u16(take(buf, pos, 2, "Bytes length")?) as usize;
            TokenValue::Bytes(take(buf, pos, len, "Bytes value")?.to_vec())
        }
        TokenType::ULongString => {
            let len = LittleEndian::read_u32(take(buf, pos, 4, "ULongString length")?) as usize;
            TokenValue::ULongString(utf8(take(buf, pos, len, "ULongString value")?)?)
        }
        TokenType::ULongBytes => {
            let len = LittleEndian::read_u32(take(buf, pos, 4, "ULongBytes length")?) as usize;
            TokenValue::ULongBytes(take(buf, pos, len, "ULongBytes value")?.to_vec())
        }
    };

    Ok(Token { id, value })
}

/// A typed set of present-or-absent fields for one message kind.
///
/// `encode_into` assumes `validate` has passed and writes exactly
/// `encoded_len` bytes. `decode` skips identifiers it does not know.
pub trait TokenSet: Default {
    fn validate(&self) -> Result<()>;
    fn encoded_len(&self) -> usize;
    fn encode_into(&self, buf: &mut BytesMut);
    fn decode(stream: &[u8]) -> Result<Self>;

    /// Convenience wrapper: validate, reserve exactly, encode.
    fn encode(&self) -> Result<BytesMut> {
        self.validate()?;
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        Ok(buf)
    }
}

fn field_len(value_len: usize, prefix: usize) -> usize {
    RP_TOKEN_HEADER_SZ + prefix + value_len
}

fn check_len(what: &str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(ReplicaError::MalformedToken(format!(
            "{} length {} exceeds encodable maximum {}",
            what, len, max
        )));
    }
    Ok(())
}

/// Tokens sent by the connecting side during context negotiation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextRequestTokens {
    pub protocol_version: Option<u32>,
    pub client_version: Option<String>,
    pub user_agent: Option<String>,
}

impl TokenSet for ContextRequestTokens {
    fn validate(&self) -> Result<()> {
        if let Some(v) = &self.client_version {
            check_len("client version", v.len(), u8::max_value() as usize)?;
        }
        if let Some(v) = &self.user_agent {
            check_len("user agent", v.len(), u8::max_value() as usize)?;
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        let mut n = 0;
        if self.protocol_version.is_some() {
            n += field_len(4, 0);
        }
        if let Some(v) = &self.client_version {
            n += field_len(v.len(), 1);
        }
        if let Some(v) = &self.user_agent {
            n += field_len(v.len(), 1);
        }
        n
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        if let Some(v) = self.protocol_version {
            put_token(
                buf,
                context_request_id::PROTOCOL_VERSION,
                &TokenValue::ULong(v),
            );
        }
        if let Some(v) = &self.client_version {
            put_token(
                buf,
                context_request_id::CLIENT_VERSION,
                &TokenValue::SmallString(v.clone()),
            );
        }
        if let Some(v) = &self.user_agent {
            put_token(
                buf,
                context_request_id::USER_AGENT,
                &TokenValue::SmallString(v.clone()),
            );
        }
    }

    fn decode(stream: &[u8]) -> Result<ContextRequestTokens> {
        let mut out = ContextRequestTokens::default();
        let mut pos = 0;
        while pos < stream.len() {
            let token = get_token(stream, &mut pos)?;
            match (token.id, token.value) {
                (context_request_id::PROTOCOL_VERSION, TokenValue::ULong(v)) => {
                    out.protocol_version = Some(v)
                }
                (context_request_id::CLIENT_VERSION, TokenValue::SmallString(v)) => {
                    out.client_version = Some(v)
                }
                (context_request_id::USER_AGENT, TokenValue::SmallString(v)) => {
                    out.user_agent = Some(v)
                }
                _ => (),
            }
        }
        Ok(out)
    }
}

/// Tokens sent by the accepting side during context negotiation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextResponseTokens {
    pub protocol_version: Option<u32>,
    pub server_agent: Option<String>,
    pub server_version: Option<String>,
}

impl TokenSet for ContextResponseTokens {
    fn validate(&self) -> Result<()> {
        if let Some(v) = &self.server_agent {
            check_len("server agent", v.len(), u8::max_value() as usize)?;
        }
        if let Some(v) = &self.server_version {
            check_len("server version", v.len(), u8::max_value() as usize)?;
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        let mut n = 0;
        if self.protocol_version.is_some() {
            n += field_len(4, 0);
        }
        if let Some(v) = &self.server_agent {
            n += field_len(v.len(), 1);
        }
        if let Some(v) = &self.server_version {
            n += field_len(v.len(), 1);
        }
        n
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        if let Some(v) = self.protocol_version {
            put_token(
                buf,
                context_response_id::PROTOCOL_VERSION,
                &TokenValue::ULong(v),
            );
        }
        if let Some(v) = &self.server_agent {
            put_token(
                buf,
                context_response_id::SERVER_AGENT,
                &TokenValue::SmallString(v.clone()),
            );
        }
        if let Some(v) = &self.server_version {
            put_token(
                buf,
                context_response_id::SERVER_VERSION,
                &TokenValue::SmallString(v.clone()),
            );
        }
    }

    fn decode(stream: &[u8]) -> Result<ContextResponseTokens> {
        let mut out = ContextResponseTokens::default();
        let mut pos = 0;
        while pos < stream.len() {
            let token = get_token(stream, &mut pos)?;
            match (token.id, token.value) {
                (context_response_id::PROTOCOL_VERSION, TokenValue::ULong(v)) => {
                    out.protocol_version = Some(v)
                }
                (context_response_id::SERVER_AGENT, TokenValue::SmallString(v)) => {
                    out.server_agent = Some(v)
                }
                (context_response_id::SERVER_VERSION, TokenValue::SmallString(v)) => {
                    out.server_version = Some(v)
                }
                _ => (),
            }
        }
        Ok(out)
    }
}

/// Tokens carried by every request. The replica path and the payload flag
/// are mandatory in well-formed traffic; the rest travel as supplied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestTokens {
    pub resource_id: Option<Vec<u8>>,
    pub authorization: Option<String>,
    pub date: Option<String>,
    pub client_version: Option<String>,
    pub replica_path: Option<String>,
    pub transport_request_id: Option<u32>,
    pub payload_present: Option<bool>,
    pub entity_id: Option<String>,
}

impl RequestTokens {
    /// Returns the container to its all-absent state for pool reuse.
    pub fn reset(&mut self) {
        *self = RequestTokens::default();
    }
}

impl TokenSet for RequestTokens {
    fn validate(&self) -> Result<()> {
        if let Some(v) = &self.resource_id {
            check_len("resource id", v.len(), u16::max_value() as usize)?;
        }
        if let Some(v) = &self.authorization {
            check_len("authorization token", v.len(), u16::max_value() as usize)?;
        }
        if let Some(v) = &self.date {
            check_len("date", v.len(), u8::max_value() as usize)?;
        }
        if let Some(v) = &self.client_version {
            check_len("client version", v.len(), u8::max_value() as usize)?;
        }
        if let Some(v) = &self.replica_path {
            check_len("replica path", v.len(), u16::max_value() as usize)?;
        }
        if let Some(v) = &self.entity_id {
            check_len("entity id", v.len(), u16::max_value() as usize)?;
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        let mut n = 0;
        if let Some(v) = &self.resource_id {
            n += field_len(v.len(), 2);
        }
        if let Some(v) = &self.authorization {
            n += field_len(v.len(), 2);
        }
        if let Some(v) = &self.date {
            n += field_len(v.len(), 1);
        }
        if let Some(v) = &self.client_version {
            n += field_len(v.len(), 1);
        }
        if let Some(v) = &self.replica_path {
            n += field_len(v.len(), 2);
        }
        if self.transport_request_id.is_some() {
            n += field_len(4, 0);
        }
        if self.payload_present.is_some() {
            n += field_len(1, 0);
        }
        if let Some(v) = &self.entity_id {
            n += field_len(v.len(), 2);
        }
        n
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        if let Some(v) = &self.resource_id {
            put_token(buf, request_id::RESOURCE_ID, &TokenValue::Bytes(v.clone()));
        }
        if let Some(v) = &self.authorization {
            put_token(
                buf,
                request_id::AUTHORIZATION,
                &TokenValue::String(v.clone()),
            );
        }
        if let Some(v) = &self.date {
            put_token(buf, request_id::DATE, &TokenValue::SmallString(v.clone()));
        }
        if let Some(v) = &self.client_version {
            put_token(
                buf,
                request_id::CLIENT_VERSION,
                &TokenValue::SmallString(v.clone()),
            );
        }
        if let Some(v) = &self.replica_path {
            put_token(
                buf,
                request_id::REPLICA_PATH,
                &TokenValue::String(v.clone()),
            );
        }
        if let Some(v) = self.transport_request_id {
            put_token(
                buf,
                request_id::TRANSPORT_REQUEST_ID,
                &TokenValue::ULong(v),
            );
        }
        if let Some(v) = self.payload_present {
            put_token(
                buf,
                request_id::PAYLOAD_PRESENT,
                &TokenValue::Byte(if v { 1 } else { 0 }),
            );
        }
        if let Some(v) = &self.entity_id {
            put_token(buf, request_id::ENTITY_ID, &TokenValue::String(v.clone()));
        }
    }

    fn decode(stream: &[u8]) -> Result<RequestTokens> {
        let mut out = RequestTokens::default();
        let mut pos = 0;
        while pos < stream.len() {
            let token = get_token(stream, &mut pos)?;
            match (token.id, token.value) {
                (request_id::RESOURCE_ID, TokenValue::Bytes(v)) => out.resource_id = Some(v),
                (request_id::AUTHORIZATION, TokenValue::String(v)) => {
                    out.authorization = Some(v)
                }
                (request_id::DATE, TokenValue::SmallString(v)) => out.date = Some(v),
                (request_id::CLIENT_VERSION, TokenValue::SmallString(v)) => {
                    out.client_version = Some(v)
                }
                (request_id::REPLICA_PATH, TokenValue::String(v)) => {
                    out.replica_path = Some(v)
                }
                (request_id::TRANSPORT_REQUEST_ID, TokenValue::ULong(v)) => {
                    out.transport_request_id = Some(v)
                }
                (request_id::PAYLOAD_PRESENT, TokenValue::Byte(v)) => {
                    out.payload_present = Some(v != 0)
                }
                (request_id::ENTITY_ID, TokenValue::String(v)) => out.entity_id = Some(v),
                _ => (),
            }
        }
        Ok(out)
    }
}

/// Tokens carried by every response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseTokens {
    pub transport_request_id: Option<u32>,
    pub payload_present: Option<bool>,
    pub request_charge: Option<f64>,
    pub item_count: Option<u32>,
    pub server_version: Option<String>,
}

impl TokenSet for ResponseTokens {
    fn validate(&self) -> Result<()> {
        if let Some(v) = &self.server_version {
            check_len("server version", v.len(), u8::max_value() as usize)?;
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        let mut n = 0;
        if self.transport_request_id.is_some() {
            n += field_len(4, 0);
        }
        if self.payload_present.is_some() {
            n += field_len(1, 0);
        }
        if self.request_charge.is_some() {
            n += field_len(8, 0);
        }
        if self.item_count.is_some() {
            n += field_len(4, 0);
        }
        if let Some(v) = &self.server_version {
            n += field_len(v.len(), 1);
        }
        n
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        if let Some(v) = self.transport_request_id {
            put_token(
                buf,
                response_id::TRANSPORT_REQUEST_ID,
                &TokenValue::ULong(v),
            );
        }
        if let Some(v) = self.payload_present {
            put_token(
                buf,
                response_id::PAYLOAD_PRESENT,
                &TokenValue::Byte(if v { 1 } else { 0 }),
            );
        }
        if let Some(v) = self.request_charge {
            put_token(buf, response_id::REQUEST_CHARGE, &TokenValue::Double(v));
        }
        if let Some(v) = self.item_count {
            put_token(buf, response_id::ITEM_COUNT, &TokenValue::ULong(v));
        }
        if let Some(v) = &self.server_version {
            put_token(
                buf,
                response_id::SERVER_VERSION,
                &TokenValue::SmallString(v.clone()),
            );
        }
    }

    fn decode(stream: &[u8]) -> Result<ResponseTokens> {
        let mut out = ResponseTokens::default();
        let mut pos = 0;
        while pos < stream.len() {
            let token = get_token(stream, &mut pos)?;
            match (token.id, token.value) {
                (response_id::TRANSPORT_REQUEST_ID, TokenValue::ULong(v)) => {
                    out.transport_request_id = Some(v)
                }
                (response_id::PAYLOAD_PRESENT, TokenValue::Byte(v)) => {
                    out.payload_present = Some(v != 0)
                }
                (response_id::REQUEST_CHARGE, TokenValue::Double(v)) => {
                    out.request_charge = Some(v)
                }
                (response_id::ITEM_COUNT, TokenValue::ULong(v)) => out.item_count = Some(v),
                (response_id::SERVER_VERSION, TokenValue::SmallString(v)) => {
                    out.server_version = Some(v)
                }
                _ => (),
            }
        }
        Ok(out)
    }
}

/// Fixed header of a request or context-request metadata frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestHeader {
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    pub activity_id: ActivityId,
}

/// Fixed header of a response or context-response metadata frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseHeader {
    pub status: u32,
    pub activity_id: ActivityId,
}

/// Writes a complete request metadata frame. The caller must have run
/// `tokens.validate()` first; the fill happens directly in `buf`.
pub fn encode_request_frame_into<T: TokenSet>(
    header: &RequestHeader,
    tokens: &T,
    buf: &mut BytesMut,
) {
    let total = RP_METADATA_HEADER_SZ + tokens.encoded_len();
    buf.reserve(total);
    buf.put_u32_le(total as u32);
    buf.put_u16_le(header.resource_type as u16);
    buf.put_u16_le(header.operation_type as u16);
    buf.put_slice(&header.activity_id.0);
    tokens.encode_into(buf);
}

/// Writes a complete response metadata frame; same contract as
/// [`encode_request_frame_into`].
pub fn encode_response_frame_into<T: TokenSet>(
    header: &ResponseHeader,
    tokens: &T,
    buf: &mut BytesMut,
) {
    let total = RP_METADATA_HEADER_SZ + tokens.encoded_len();
    buf.reserve(total);
    buf.put_u32_le(total as u32);
    buf.put_u32_le(header.status);
    buf.put_slice(&header.activity_id.0);
    tokens.encode_into(buf);
}

pub fn encode_request_frame<T: TokenSet>(header: &RequestHeader, tokens: &T) -> Result<BytesMut> {
    tokens.validate()?;
    let mut buf = BytesMut::with_capacity(RP_METADATA_HEADER_SZ + tokens.encoded_len());
    encode_request_frame_into(header, tokens, &mut buf);
    Ok(buf)
}

pub fn encode_response_frame<T: TokenSet>(
    header: &ResponseHeader,
    tokens: &T,
) -> Result<BytesMut> {
    tokens.validate()?;
    let mut buf = BytesMut::with_capacity(RP_METADATA_HEADER_SZ + tokens.encoded_len());
    encode_response_frame_into(header, tokens, &mut buf);
    Ok(buf)
}

fn check_metadata_frame(frame: &[u8]) -> Result<()> {
    if frame.len() < RP_METADATA_HEADER_SZ {
        return Err(ReplicaError::MalformedToken(format!(
            "metadata frame of {} bytes is shorter than the fixed header",
            frame.len()
        )));
    }
    let declared = LittleEndian::read_u32(&frame[RP_OFF_LEN..RP_OFF_LEN + 4]) as usize;
    if declared != frame.len() {
        return Err(ReplicaError::MalformedToken(format!(
            "declared length {} does not match frame size {}",
            declared,
            frame.len()
        )));
    }
    Ok(())
}

pub fn parse_request_header(frame: &[u8]) -> Result<RequestHeader> {
    check_metadata_frame(frame)?;
    let raw_resource =
        LittleEndian::read_u16(&frame[RP_OFF_RESOURCE_TYPE..RP_OFF_RESOURCE_TYPE + 2]);
    let resource_type = FromPrimitive::from_u16(raw_resource).ok_or_else(|| {
        ReplicaError::MalformedToken(format!("unknown resource type 0x{:04x}", raw_resource))
    })?;
    let raw_operation =
        LittleEndian::read_u16(&frame[RP_OFF_OPERATION_TYPE..RP_OFF_OPERATION_TYPE + 2]);
    let operation_type = FromPrimitive::from_u16(raw_operation).ok_or_else(|| {
        ReplicaError::MalformedToken(format!("unknown operation type 0x{:04x}", raw_operation))
    })?;
    let activity_id = ActivityId::from_slice(
        &frame[RP_OFF_ACTIVITY_ID..RP_OFF_ACTIVITY_ID + RP_ACTIVITY_ID_SZ],
    );

    Ok(RequestHeader {
        resource_type,
        operation_type,
        activity_id,
    })
}

pub fn parse_response_header(frame: &[u8]) -> Result<ResponseHeader> {
    check_metadata_frame(frame)?;
    let status = LittleEndian::read_u32(&frame[RP_OFF_STATUS..RP_OFF_STATUS + 4]);
    let activity_id = ActivityId::from_slice(
        &frame[RP_OFF_ACTIVITY_ID..RP_OFF_ACTIVITY_ID + RP_ACTIVITY_ID_SZ],
    );

    Ok(ResponseHeader {
        status,
        activity_id,
    })
}

/// The token stream portion of a validated metadata frame.
pub fn metadata_tokens(frame: &[u8]) -> &[u8] {
    &frame[RP_OFF_TOKENS..]
}
