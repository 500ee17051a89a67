// Copyright 2026 Joyent, Inc.

//! Client side of the replica protocol: connect, negotiate context, then
//! exchange request/response pairs over one connection.
//!
//! Authorization tokens are opaque here; whoever owns the signing secret
//! hands the finished token in and this module forwards it verbatim. The
//! date token is stamped at send time because the signature covers it.

use bytes::{BufMut, Bytes};
use chrono::Utc;
use slog::{debug, o, Drain, Logger};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::TimeoutConfig;
use crate::context::negotiate_as_client;
use crate::errors::{ReplicaError, Result};
use crate::framing::{FrameReader, FrameWriter};
use crate::pool::RequestPool;
use crate::protocol::{
    encode_request_frame_into, metadata_tokens, parse_response_header, ActivityId, OperationType,
    RequestHeader, ResourceType, ResponseTokens, TokenSet, RP_LEN_PREFIX_SZ,
    RP_METADATA_HEADER_SZ, RP_STATUS_OK,
};

/// One decoded reply from a replica.
#[derive(Debug)]
pub struct ReplicaResponse {
    pub status: u32,
    pub activity_id: ActivityId,
    pub tokens: ResponseTokens,
    pub payload: Option<Bytes>,
}

impl ReplicaResponse {
    pub fn is_success(&self) -> bool {
        self.status == RP_STATUS_OK
    }
}

/// A negotiated connection to a replica or to the proxy tier in front of
/// one. Requests are issued one at a time; the connection assumes the peer
/// answers in receipt order.
pub struct ReplicaClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    pool: RequestPool,
    timeouts: TimeoutConfig,
    next_transport_request_id: u32,
    log: Logger,
}

impl ReplicaClient {
    /// Connects, negotiates context, and returns a connection ready for
    /// request traffic.
    pub async fn connect(
        addr: &str,
        timeouts: TimeoutConfig,
        log: Option<Logger>,
    ) -> Result<ReplicaClient> {
        let log =
            log.unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let stream = timeout(timeouts.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ReplicaError::Timeout("connect"))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let writer = FrameWriter::new(write_half);

        let context = negotiate_as_client(&mut reader, &writer, timeouts.handshake_timeout())
            .await?;
        debug!(log, "context negotiated";
               "server_agent" => context.server_agent.unwrap_or_default());

        Ok(ReplicaClient {
            reader,
            writer,
            pool: RequestPool::new(),
            timeouts,
            next_transport_request_id: 1,
            log,
        })
    }

    /// Sends one request and reads its reply. The request container comes
    /// out of the pool and returns to it when the frame has been written.
    pub async fn request(
        &mut self,
        resource_type: ResourceType,
        operation_type: OperationType,
        path: &str,
        authorization: Option<&str>,
        payload: Option<&[u8]>,
    ) -> Result<ReplicaResponse> {
        let activity_id = ActivityId::new();
        let transport_request_id = self.next_transport_request_id;
        self.next_transport_request_id = self.next_transport_request_id.wrapping_add(1);

        let header = RequestHeader {
            resource_type,
            operation_type,
            activity_id,
        };

        {
            let mut request = self.pool.get();
            request.replica_path = Some(path.to_string());
            request.date = Some(Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string());
            request.client_version = Some(env!("CARGO_PKG_VERSION").to_string());
            request.authorization = authorization.map(str::to_string);
            request.transport_request_id = Some(transport_request_id);
            request.payload_present = Some(payload.is_some());
            request.validate()?;

            let total = RP_METADATA_HEADER_SZ
                + request.encoded_len()
                + payload.map_or(0, |p| RP_LEN_PREFIX_SZ + p.len());
            let write = self.writer.write_frame(total, |buf| {
                encode_request_frame_into(&header, &*request, buf);
                if let Some(p) = payload {
                    buf.put_u32_le(p.len() as u32);
                    buf.put_slice(p);
                }
            });
            timeout(self.timeouts.io_timeout(), write)
                .await
                .map_err(|_| ReplicaError::Timeout("request write"))??;
        }
        debug!(self.log, "request sent";
               "activity_id" => %activity_id, "path" => path);

        let reader = &mut self.reader;
        let read = async {
            let (status, activity_id, tokens) = {
                let frame = match reader.read_metadata_frame().await? {
                    Some(frame) => frame,
                    None => return Err(ReplicaError::ConnectionClosed),
                };
                let header = parse_response_header(frame)?;
                let tokens = ResponseTokens::decode(metadata_tokens(frame))?;
                (header.status, header.activity_id, tokens)
            };
            let payload = if tokens.payload_present.unwrap_or(false) {
                Some(Bytes::copy_from_slice(reader.read_payload_frame().await?))
            } else {
                None
            };
            Ok(ReplicaResponse {
                status,
                activity_id,
                tokens,
                payload,
            })
        };
        let response = timeout(self.timeouts.io_timeout(), read)
            .await
            .map_err(|_| ReplicaError::Timeout("response read"))??;

        debug!(self.log, "response received";
               "activity_id" => %response.activity_id, "status" => response.status);
        Ok(response)
    }

    /// Containers currently idle in the request pool.
    pub fn pooled_requests(&self) -> usize {
        self.pool.idle()
    }
}
