// Copyright 2026 Joyent, Inc.

//! Zero-copy extraction of routing fields from raw metadata frames.
//!
//! The proxy needs exactly two facts about each request: where it is going
//! and whether a payload frame follows. Fully decoding the token stream for
//! that would allocate a container per message, so this module walks the
//! raw buffer instead, stepping over every token by its tag-derived width
//! and capturing only the identifiers of interest. Nothing is allocated per
//! token; the only allocation is the decoded path string itself.

use std::str;

use byteorder::{ByteOrder, LittleEndian};
use num::FromPrimitive;

use crate::errors::{ReplicaError, Result};
use crate::protocol::{request_id, response_id, TokenType, RP_OFF_TOKENS};

/// Routing facts lifted out of a request metadata frame.
///
/// `path_len_offset` and `path_len` locate the path token's u16 length
/// prefix and value inside the original frame, so the rewrite can splice
/// around them without re-encoding anything else.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestScan {
    pub has_payload: bool,
    pub path: String,
    pub path_len_offset: usize,
    pub path_len: usize,
}

/// Scans a request frame for the replica path and the payload flag.
///
/// Both fields are mandatory in well-formed request traffic, so reaching
/// the end of the frame without either is a protocol violation reported as
/// [`ReplicaError::MalformedToken`]. The walk stops as soon as both have
/// been seen.
pub fn scan_request(frame: &[u8]) -> Result<RequestScan> {
    let mut walk = TokenWalk::new(frame)?;
    let mut has_payload: Option<bool> = None;
    let mut path: Option<(String, usize, usize)> = None;

    while has_payload.is_none() || path.is_none() {
        let (id, token_type) = match walk.next_header()? {
            Some(header) => header,
            None => break,
        };
        if id == request_id::PAYLOAD_PRESENT && token_type == TokenType::Byte {
            has_payload = Some(walk.read_byte()? != 0);
        } else if id == request_id::REPLICA_PATH && token_type == TokenType::String {
            let len_offset = walk.pos;
            let value = walk.read_u16_prefixed("replica path")?;
            let decoded = str::from_utf8(value).map_err(|_| {
                ReplicaError::MalformedToken("replica path is not valid UTF-8".to_string())
            })?;
            path = Some((decoded.to_string(), len_offset, value.len()));
        } else {
            walk.skip_value(token_type)?;
        }
    }

    match (has_payload, path) {
        (Some(has_payload), Some((path, path_len_offset, path_len))) => Ok(RequestScan {
            has_payload,
            path,
            path_len_offset,
            path_len,
        }),
        _ => Err(ReplicaError::MalformedToken(
            "request frame is missing the replica path or the payload flag".to_string(),
        )),
    }
}

/// Scans a response frame for the payload flag, which every well-formed
/// response carries.
pub fn scan_response(frame: &[u8]) -> Result<bool> {
    let mut walk = TokenWalk::new(frame)?;
    loop {
        let (id, token_type) = match walk.next_header()? {
            Some(header) => header,
            None => {
                return Err(ReplicaError::MalformedToken(
                    "response frame is missing the payload flag".to_string(),
                ))
            }
        };
        if id == response_id::PAYLOAD_PRESENT && token_type == TokenType::Byte {
            return Ok(walk.read_byte()? != 0);
        }
        walk.skip_value(token_type)?;
    }
}

/// Forward-only cursor over a metadata frame's token stream. The cursor is
/// bounded by the frame slice, so it can never advance past the declared
/// frame length.
struct TokenWalk<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> TokenWalk<'a> {
    fn new(frame: &'a [u8]) -> Result<TokenWalk<'a>> {
        if frame.len() < RP_OFF_TOKENS {
            return Err(ReplicaError::MalformedToken(format!(
                "metadata frame of {} bytes is shorter than the fixed header",
                frame.len()
            )));
        }
        Ok(TokenWalk {
            frame,
            pos: RP_OFF_TOKENS,
        })
    }

    /// Returns the next token's identifier and type, or `None` at the end
    /// of the frame.
    fn next_header(&mut self) -> Result<Option<(u16, TokenType)>> {
        if self.pos == self.frame.len() {
            return Ok(None);
        }
        let header = self.take(3, "token header")?;
        let id = LittleEndian::read_u16(&header[0..2]);
        let tag = header[2];
        let token_type =
            FromPrimitive::from_u8(tag).ok_or(ReplicaError::UnsupportedTokenType(tag))?;
        Ok(Some((id, token_type)))
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.frame.len() - self.pos < n {
            return Err(ReplicaError::MalformedToken(format!(
                "{} needs {} bytes but only {} remain in the frame",
                what,
                n,
                self.frame.len() - self.pos
            )));
        }
        let slice = &self.frame[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1, "Byte value")?[0])
    }

    fn read_u16_prefixed(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = LittleEndian::read_u16(self.take(2, what)?) as usize;
        self.take(len, what)
    }

    /// Steps over one value using only its type tag.
    fn skip_value(&mut self, token_type: TokenType) -> Result<()> {
        let width = match token_type {
            TokenType::Byte => 1,
            TokenType::UShort => 2,
            TokenType::ULong | TokenType::Long | TokenType::Float => 4,
            TokenType::ULongLong | TokenType::LongLong | TokenType::Double => 8,
            TokenType::Guid => 16,
            TokenType::SmallString | TokenType::SmallBytes => {
                self.take(1, "length prefix")?[0] as usize
            }
            TokenType::String | TokenType::Bytes => {
                LittleEndian::read_u16(self.take(2, "length prefix")?) as usize
            }
            TokenType::ULongString | TokenType::ULongBytes => {
                LittleEndian::read_u32(self.take(4, "length prefix")?) as usize
            }
        };
        self.take(width, "token value")?;
        Ok(())
    }
}
