// Copyright 2026 Joyent, Inc.

//! The reverse-proxy relay: routes each inbound request to a backend
//! replica, rewriting the replica path in flight.
//!
//! Per inbound connection the proxy negotiates context as a server, then
//! loops: scan the next request frame for its routing path and payload
//! flag, resolve the path's first segment through the routing table, fetch
//! or establish the outbound connection for that endpoint, splice the path
//! token down to the remainder, and forward. A response pump per outbound
//! connection relays replies back over the inbound connection.
//!
//! Known limitations, kept deliberately: responses are relayed in arrival
//! order with no correlation on the transport request id, so a backend
//! that answers out of order would cross replies; and an outbound
//! connection's pump stays bound to the inbound connection that first
//! created it, which only matters when several inbound connections share a
//! destination. Neither shows up in the single-client deployments this
//! tier was built for.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cache::ConnectionCache;
use crate::config::{RoutingTable, TimeoutConfig};
use crate::context::{negotiate_as_client, negotiate_as_server};
use crate::errors::{ReplicaError, Result};
use crate::framing::{FrameReader, FrameWriter};
use crate::protocol::RP_LEN_PREFIX_SZ;
use crate::scanner::{scan_request, scan_response, RequestScan};

/// One established backend connection: the writer the relay loop sends
/// requests through, plus the pump task draining its responses.
pub struct OutboundConnection {
    endpoint: String,
    writer: FrameWriter<OwnedWriteHalf>,
    pump: JoinHandle<()>,
}

impl OutboundConnection {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for OutboundConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// The proxy application context: routing table, deadlines, and the
/// outbound connection cache. Created at startup, shared by reference with
/// every relay task, torn down at shutdown.
pub struct Proxy {
    routes: RoutingTable,
    timeouts: TimeoutConfig,
    cache: ConnectionCache<OutboundConnection>,
    log: Logger,
}

impl Proxy {
    pub fn new(routes: RoutingTable, timeouts: TimeoutConfig, log: Option<Logger>) -> Proxy {
        let log = log.unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Proxy {
            routes,
            timeouts,
            cache: ConnectionCache::new(),
            log,
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Live outbound connections currently held by the cache.
    pub fn outbound_connections(&self) -> usize {
        self.cache.len()
    }

    /// Drives one inbound connection to completion. Errors terminate only
    /// this connection and are logged here; sibling connections are
    /// unaffected.
    pub async fn handle_connection(
        self: Arc<Proxy>,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let log = self.log.new(o!("peer" => peer));

        match self.relay(stream, &log, shutdown).await {
            Ok(()) => debug!(log, "inbound connection closed"),
            Err(e) => warn!(log, "inbound connection terminated"; "err" => %e),
        }
    }

    async fn relay(
        &self,
        stream: TcpStream,
        log: &Logger,
        shutdown: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let inbound_writer = Arc::new(FrameWriter::new(write_half));

        negotiate_as_server(
            &mut reader,
            &inbound_writer,
            log,
            self.timeouts.handshake_timeout(),
        )
        .await?;

        loop {
            let more = tokio::select! {
                _ = shutdown.cancelled() => break,
                forwarded = self.relay_one(&mut reader, &inbound_writer, log, &shutdown) => {
                    forwarded?
                }
            };
            if !more {
                break;
            }
        }
        Ok(())
    }

    /// Forwards one request (and its payload frame, when present) to the
    /// resolved backend. Returns `false` on clean end-of-stream.
    async fn relay_one(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        inbound_writer: &Arc<FrameWriter<OwnedWriteHalf>>,
        log: &Logger,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let frame = match reader.read_metadata_frame().await? {
            Some(frame) => frame,
            None => return Ok(false),
        };
        let scan = scan_request(frame)?;
        let (hint, remainder) = split_replica_path(&scan.path)?;
        let endpoint = self
            .routes
            .resolve(hint)
            .ok_or_else(|| ReplicaError::RoutingUnresolvable(hint.to_string()))?
            .to_string();

        let connection = self
            .cache
            .get_or_create(&endpoint, || {
                self.open_outbound(endpoint.clone(), Arc::clone(inbound_writer), log, shutdown)
            })
            .await?;

        debug!(log, "routing request";
               "endpoint" => %endpoint, "path" => %scan.path, "payload" => scan.has_payload);

        let rewritten = rewrite_replica_path(frame, &scan, remainder);
        let payload = if scan.has_payload {
            Some(
                timeout(self.timeouts.io_timeout(), reader.read_payload_frame())
                    .await
                    .map_err(|_| ReplicaError::Timeout("inbound payload read"))??,
            )
        } else {
            None
        };

        let total = rewritten.len() + payload.map_or(0, |p| RP_LEN_PREFIX_SZ + p.len());
        let write = connection.writer.write_frame(total, |buf| {
            buf.extend_from_slice(&rewritten);
            if let Some(p) = payload {
                buf.put_u32_le(p.len() as u32);
                buf.put_slice(p);
            }
        });
        timeout(self.timeouts.io_timeout(), write)
            .await
            .map_err(|_| ReplicaError::Timeout("outbound write"))??;
        Ok(true)
    }

    /// Connection factory run under the cache's single-flight gate:
    /// connect, negotiate as client, then start the response pump for this
    /// inbound connection before the entry is considered ready.
    async fn open_outbound(
        &self,
        endpoint: String,
        inbound_writer: Arc<FrameWriter<OwnedWriteHalf>>,
        log: &Logger,
        shutdown: &CancellationToken,
    ) -> Result<OutboundConnection> {
        let log = log.new(o!("endpoint" => endpoint.clone()));
        let established = async {
            let stream = timeout(
                self.timeouts.connect_timeout(),
                TcpStream::connect(&endpoint),
            )
            .await
            .map_err(|_| ReplicaError::Timeout("connect"))??;
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            let mut out_reader = FrameReader::new(read_half);
            let out_writer = FrameWriter::new(write_half);
            negotiate_as_client(&mut out_reader, &out_writer, self.timeouts.handshake_timeout())
                .await?;
            Ok((out_reader, out_writer))
        }
        .await;

        let (out_reader, out_writer) = match established {
            Ok(halves) => halves,
            Err(e) => {
                return Err(ReplicaError::UpstreamUnavailable {
                    endpoint,
                    source: Box::new(e),
                })
            }
        };
        info!(log, "outbound connection established");

        let pump = tokio::spawn(pump_responses(
            out_reader,
            inbound_writer,
            self.timeouts.io_timeout(),
            shutdown.clone(),
            log,
        ));

        Ok(OutboundConnection {
            endpoint,
            writer: out_writer,
            pump,
        })
    }
}

/// Relays response frames from one outbound connection back to the inbound
/// connection, in arrival order. An error here is fatal only to this
/// outbound connection and is always logged.
async fn pump_responses(
    mut reader: FrameReader<OwnedReadHalf>,
    inbound: Arc<FrameWriter<OwnedWriteHalf>>,
    io_timeout: Duration,
    shutdown: CancellationToken,
    log: Logger,
) {
    match pump_loop(&mut reader, &inbound, io_timeout, &shutdown).await {
        Ok(()) => debug!(log, "response pump finished"),
        Err(e) => warn!(log, "response pump terminated"; "err" => %e),
    }
}

async fn pump_loop(
    reader: &mut FrameReader<OwnedReadHalf>,
    inbound: &FrameWriter<OwnedWriteHalf>,
    io_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = reader.read_metadata_frame() => match read? {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };

        if !scan_response(frame)? {
            let total = frame.len();
            let write = inbound.write_frame(total, |buf| buf.extend_from_slice(frame));
            timeout(io_timeout, write)
                .await
                .map_err(|_| ReplicaError::Timeout("inbound write"))??;
            continue;
        }

        // A payload follows. The metadata frame is copied once so both
        // frames go out under a single writer gate; writing them under
        // separate gates could interleave a sibling pump's frame between
        // them.
        let metadata = Bytes::copy_from_slice(frame);
        let payload = timeout(io_timeout, reader.read_payload_frame())
            .await
            .map_err(|_| ReplicaError::Timeout("outbound payload read"))??;
        let total = metadata.len() + RP_LEN_PREFIX_SZ + payload.len();
        let write = inbound.write_frame(total, |buf| {
            buf.extend_from_slice(&metadata);
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(payload);
        });
        timeout(io_timeout, write)
            .await
            .map_err(|_| ReplicaError::Timeout("inbound write"))??;
    }
}

/// Splits `/<hint>/<remainder>` into the destination hint and the path
/// forwarded to the backend. A path with no second segment forwards as
/// `/`.
pub fn split_replica_path(path: &str) -> Result<(&str, &str)> {
    let rest = path.strip_prefix('/').ok_or_else(|| {
        ReplicaError::MalformedToken(format!("replica path {:?} does not start with '/'", path))
    })?;
    let (hint, remainder) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => (rest, "/"),
    };
    if hint.is_empty() {
        return Err(ReplicaError::MalformedToken(format!(
            "replica path {:?} has an empty destination hint",
            path
        )));
    }
    Ok((hint, remainder))
}

/// Builds the outbound metadata frame from three borrowed slices of the
/// inbound one: everything before the path token's length prefix, the new
/// length and path value, everything after the old value. The total frame
/// length is recomputed, never reused.
pub fn rewrite_replica_path(frame: &[u8], scan: &RequestScan, new_path: &str) -> BytesMut {
    let old_value_start = scan.path_len_offset + 2;
    let old_value_end = old_value_start + scan.path_len;
    let total = frame.len() - scan.path_len + new_path.len();

    let mut out = BytesMut::with_capacity(total);
    out.put_u32_le(total as u32);
    out.extend_from_slice(&frame[RP_LEN_PREFIX_SZ..scan.path_len_offset]);
    out.put_u16_le(new_path.len() as u16);
    out.extend_from_slice(new_path.as_bytes());
    out.extend_from_slice(&frame[old_value_end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    use crate::protocol::{
        encode_request_frame, metadata_tokens, ActivityId, OperationType, RequestHeader,
        RequestTokens, ResourceType, TokenSet,
    };

    fn request_frame(path: &str) -> BytesMut {
        let tokens = RequestTokens {
            replica_path: Some(path.to_string()),
            transport_request_id: Some(7),
            payload_present: Some(false),
            ..RequestTokens::default()
        };
        let header = RequestHeader {
            resource_type: ResourceType::Document,
            operation_type: OperationType::Read,
            activity_id: ActivityId::new(),
        };
        encode_request_frame(&header, &tokens).expect("encode failed")
    }

    #[test]
    fn split_takes_the_first_segment() {
        assert_eq!(
            split_replica_path("/replica-7/apps/x/services/y").expect("split failed"),
            ("replica-7", "/apps/x/services/y")
        );
        assert_eq!(
            split_replica_path("/replica-7").expect("split failed"),
            ("replica-7", "/")
        );
        assert!(split_replica_path("replica-7/x").is_err());
        assert!(split_replica_path("//x").is_err());
    }

    #[test]
    fn same_length_rewrite_preserves_total_length() {
        let frame = request_frame("/A/rest");
        let scan = scan_request(&frame).expect("scan failed");
        let rewritten = rewrite_replica_path(&frame, &scan, "/B/rest");
        assert_eq!(rewritten.len(), frame.len());
        assert_eq!(
            LittleEndian::read_u32(&rewritten[..4]) as usize,
            rewritten.len()
        );
    }

    #[test]
    fn rewrite_shifts_length_by_exactly_the_byte_delta() {
        let frame = request_frame("/replica-7/apps/x/services/y");
        let scan = scan_request(&frame).expect("scan failed");
        let (_, remainder) = split_replica_path(&scan.path).expect("split failed");
        let rewritten = rewrite_replica_path(&frame, &scan, remainder);

        let delta = scan.path.len() - remainder.len();
        assert_eq!(rewritten.len(), frame.len() - delta);
        assert_eq!(
            LittleEndian::read_u32(&rewritten[..4]) as usize,
            rewritten.len()
        );

        // Everything but the path survives the splice byte-for-byte.
        let decoded =
            RequestTokens::decode(metadata_tokens(&rewritten)).expect("decode failed");
        assert_eq!(decoded.replica_path.as_deref(), Some("/apps/x/services/y"));
        assert_eq!(decoded.transport_request_id, Some(7));
        assert_eq!(decoded.payload_present, Some(false));

        // And the rewritten frame scans cleanly too.
        let rescanned = scan_request(&rewritten).expect("rescan failed");
        assert_eq!(rescanned.path, "/apps/x/services/y");
    }

    #[test]
    fn rewrite_to_a_longer_hint_grows_the_frame() {
        let frame = request_frame("/a/rest");
        let scan = scan_request(&frame).expect("scan failed");
        let rewritten = rewrite_replica_path(&frame, &scan, "/abcdef/rest");
        assert_eq!(rewritten.len(), frame.len() + 5);
        assert_eq!(
            LittleEndian::read_u32(&rewritten[..4]) as usize,
            rewritten.len()
        );
    }
}
