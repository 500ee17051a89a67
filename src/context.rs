// Copyright 2026 Joyent, Inc.

//! Context negotiation, the single round exchanged on every fresh
//! connection before request traffic may flow.
//!
//! The connecting side announces its protocol version and identity; the
//! accepting side answers with status 200 and its own identity. Any other
//! status is fatal to the connection, which must be discarded rather than
//! reused.

use std::time::Duration;

use slog::{debug, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::errors::{ReplicaError, Result};
use crate::framing::{FrameReader, FrameWriter};
use crate::protocol::{
    encode_request_frame_into, encode_response_frame_into, metadata_tokens, parse_request_header,
    parse_response_header, ActivityId, ContextRequestTokens, ContextResponseTokens, OperationType,
    RequestHeader, ResourceType, ResponseHeader, TokenSet, RP_METADATA_HEADER_SZ,
    RP_PROTOCOL_VERSION, RP_STATUS_OK,
};

pub const RP_USER_AGENT: &str = concat!("replica-rpc/", env!("CARGO_PKG_VERSION"));

/// Performs the client role: send the context request, require a
/// status-200 answer.
pub async fn negotiate_as_client<R, W>(
    reader: &mut FrameReader<R>,
    writer: &FrameWriter<W>,
    deadline: Duration,
) -> Result<ContextResponseTokens>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    timeout(deadline, client_round(reader, writer))
        .await
        .map_err(|_| ReplicaError::Timeout("context negotiation"))?
}

async fn client_round<R, W>(
    reader: &mut FrameReader<R>,
    writer: &FrameWriter<W>,
) -> Result<ContextResponseTokens>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let tokens = ContextRequestTokens {
        protocol_version: Some(RP_PROTOCOL_VERSION),
        client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        user_agent: Some(RP_USER_AGENT.to_string()),
    };
    tokens.validate()?;
    let header = RequestHeader {
        resource_type: ResourceType::Connection,
        operation_type: OperationType::Connection,
        activity_id: ActivityId::new(),
    };
    let total = RP_METADATA_HEADER_SZ + tokens.encoded_len();
    writer
        .write_frame(total, |buf| {
            encode_request_frame_into(&header, &tokens, buf)
        })
        .await?;

    let frame = match reader.read_metadata_frame().await? {
        Some(frame) => frame,
        None => return Err(ReplicaError::ConnectionClosed),
    };
    let response = parse_response_header(frame)?;
    if response.status != RP_STATUS_OK {
        return Err(ReplicaError::HandshakeFailed(response.status));
    }
    ContextResponseTokens::decode(metadata_tokens(frame))
}

/// Performs the server role: read the context request, answer 200 with a
/// fresh activity id. Validation of the client's fields is best-effort;
/// a version skew is logged, not rejected.
pub async fn negotiate_as_server<R, W>(
    reader: &mut FrameReader<R>,
    writer: &FrameWriter<W>,
    log: &Logger,
    deadline: Duration,
) -> Result<ContextRequestTokens>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    timeout(deadline, server_round(reader, writer, log))
        .await
        .map_err(|_| ReplicaError::Timeout("context negotiation"))?
}

async fn server_round<R, W>(
    reader: &mut FrameReader<R>,
    writer: &FrameWriter<W>,
    log: &Logger,
) -> Result<ContextRequestTokens>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let tokens = {
        let frame = match reader.read_metadata_frame().await? {
            Some(frame) => frame,
            None => return Err(ReplicaError::ConnectionClosed),
        };
        parse_request_header(frame)?;
        ContextRequestTokens::decode(metadata_tokens(frame))?
    };
    if tokens.protocol_version != Some(RP_PROTOCOL_VERSION) {
        debug!(log, "client negotiated an unexpected protocol version";
               "version" => ?tokens.protocol_version);
    }

    let header = ResponseHeader {
        status: RP_STATUS_OK,
        activity_id: ActivityId::new(),
    };
    let response = ContextResponseTokens {
        protocol_version: Some(RP_PROTOCOL_VERSION),
        server_agent: Some(RP_USER_AGENT.to_string()),
        server_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    response.validate()?;
    let total = RP_METADATA_HEADER_SZ + response.encoded_len();
    writer
        .write_frame(total, |buf| {
            encode_response_frame_into(&header, &response, buf)
        })
        .await?;

    debug!(log, "context negotiated";
           "client_version" => tokens.client_version.clone().unwrap_or_default(),
           "user_agent" => tokens.user_agent.clone().unwrap_or_default());
    Ok(tokens)
}
