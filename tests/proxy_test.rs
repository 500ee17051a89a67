// Copyright 2026 Joyent, Inc.

//! End-to-end tests: a real backend replica stub, the proxy in front of
//! it, and a client driving requests through both over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BufMut;
use slog::{o, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use replica_rpc::client::ReplicaClient;
use replica_rpc::config::{RoutingTable, TimeoutConfig};
use replica_rpc::context::{negotiate_as_client, negotiate_as_server};
use replica_rpc::errors::Result;
use replica_rpc::framing::{FrameReader, FrameWriter};
use replica_rpc::protocol::{
    encode_response_frame, metadata_tokens, parse_request_header, OperationType, RequestTokens,
    ResourceType, ResponseHeader, ResponseTokens, TokenSet, RP_STATUS_OK,
};
use replica_rpc::proxy::Proxy;
use replica_rpc::server;

fn test_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What the backend stub observed, for assertions.
#[derive(Default)]
struct BackendState {
    accepted: AtomicUsize,
    seen_paths: Mutex<Vec<String>>,
}

/// A minimal replica: negotiates as a server, echoes each request's
/// transport request id and payload back with status 200.
async fn run_backend(listener: TcpListener, state: Arc<BackendState>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        state.accepted.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let _ = serve_replica_connection(stream, state).await;
        });
    }
}

async fn serve_replica_connection(stream: TcpStream, state: Arc<BackendState>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let writer = FrameWriter::new(write_half);
    negotiate_as_server(&mut reader, &writer, &test_log(), Duration::from_secs(5)).await?;

    loop {
        let (activity_id, tokens) = {
            let frame = match reader.read_metadata_frame().await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            let header = parse_request_header(frame)?;
            let tokens = RequestTokens::decode(metadata_tokens(frame))?;
            (header.activity_id, tokens)
        };
        state
            .seen_paths
            .lock()
            .unwrap()
            .push(tokens.replica_path.clone().unwrap_or_default());

        let payload = if tokens.payload_present == Some(true) {
            Some(reader.read_payload_frame().await?.to_vec())
        } else {
            None
        };

        let response_tokens = ResponseTokens {
            transport_request_id: tokens.transport_request_id,
            payload_present: Some(payload.is_some()),
            request_charge: Some(1.0),
            item_count: None,
            server_version: Some("replica-stub/1.0".to_string()),
        };
        let header = ResponseHeader {
            status: RP_STATUS_OK,
            activity_id,
        };
        let frame = encode_response_frame(&header, &response_tokens)?;
        let total = frame.len() + payload.as_ref().map_or(0, |p| 4 + p.len());
        writer
            .write_frame(total, |buf| {
                buf.extend_from_slice(&frame);
                if let Some(p) = &payload {
                    buf.put_u32_le(p.len() as u32);
                    buf.put_slice(p);
                }
            })
            .await?;
    }
}

/// Starts a backend stub and a proxy routing `hint` to it. Returns the
/// proxy's address, the backend's observations, and the proxy handle.
async fn start_proxy_with_backend(
    hint: &str,
) -> (String, Arc<BackendState>, Arc<Proxy>, CancellationToken) {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let backend_addr = backend_listener.local_addr().expect("no local addr");
    let state = Arc::new(BackendState::default());
    tokio::spawn(run_backend(backend_listener, Arc::clone(&state)));

    let mut routes = RoutingTable::new();
    routes.insert(hint, &backend_addr.to_string());

    let proxy = Arc::new(Proxy::new(
        routes,
        TimeoutConfig::default(),
        Some(test_log()),
    ));
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let proxy_addr = proxy_listener.local_addr().expect("no local addr");
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(
        proxy_listener,
        Arc::clone(&proxy),
        shutdown.clone(),
    ));

    (proxy_addr.to_string(), state, proxy, shutdown)
}

#[tokio::test]
async fn proxy_rewrites_the_path_and_relays_the_response() {
    let (proxy_addr, state, proxy, _shutdown) = start_proxy_with_backend("replica-7").await;

    let mut client = ReplicaClient::connect(&proxy_addr, TimeoutConfig::default(), None)
        .await
        .expect("connect failed");

    let response = client
        .request(
            ResourceType::Document,
            OperationType::Read,
            "/replica-7/apps/x/services/y",
            Some("presigned-token"),
            None,
        )
        .await
        .expect("request failed");

    assert!(response.is_success());
    assert_eq!(response.tokens.transport_request_id, Some(1));
    assert_eq!(response.payload, None);
    assert_eq!(
        state.seen_paths.lock().unwrap().as_slice(),
        ["/apps/x/services/y"]
    );

    // Subsequent requests reuse the cached outbound connection.
    for _ in 0..3 {
        let response = client
            .request(
                ResourceType::Document,
                OperationType::Read,
                "/replica-7/apps/x/services/y",
                None,
                None,
            )
            .await
            .expect("request failed");
        assert!(response.is_success());
    }
    assert_eq!(state.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.outbound_connections(), 1);
}

#[tokio::test]
async fn proxy_forwards_payload_frames_both_ways() {
    let (proxy_addr, state, _proxy, _shutdown) = start_proxy_with_backend("replica-3").await;

    let mut client = ReplicaClient::connect(&proxy_addr, TimeoutConfig::default(), None)
        .await
        .expect("connect failed");

    let body = br#"{"id": "doc-1", "value": 42}"#;
    let response = client
        .request(
            ResourceType::Document,
            OperationType::Create,
            "/replica-3/apps/x/docs/doc-1",
            Some("presigned-token"),
            Some(&body[..]),
        )
        .await
        .expect("request failed");

    assert!(response.is_success());
    assert_eq!(response.payload.as_deref(), Some(&body[..]));
    assert_eq!(
        state.seen_paths.lock().unwrap().as_slice(),
        ["/apps/x/docs/doc-1"]
    );
}

#[tokio::test]
async fn unresolvable_hint_closes_the_connection_without_forwarding() {
    let (proxy_addr, state, _proxy, _shutdown) = start_proxy_with_backend("replica-7").await;

    let mut client = ReplicaClient::connect(&proxy_addr, TimeoutConfig::default(), None)
        .await
        .expect("connect failed");
    let result = client
        .request(
            ResourceType::Document,
            OperationType::Read,
            "/nowhere/apps/x",
            None,
            None,
        )
        .await;
    assert!(result.is_err());
    assert!(state.seen_paths.lock().unwrap().is_empty());
    assert_eq!(state.accepted.load(Ordering::SeqCst), 0);

    // The proxy itself keeps serving fresh connections.
    let mut client = ReplicaClient::connect(&proxy_addr, TimeoutConfig::default(), None)
        .await
        .expect("reconnect failed");
    let response = client
        .request(
            ResourceType::Document,
            OperationType::Read,
            "/replica-7/apps/x",
            None,
            None,
        )
        .await
        .expect("request failed");
    assert!(response.is_success());
}

#[tokio::test]
async fn truncated_request_tears_down_only_its_own_connection() {
    let (proxy_addr, _state, _proxy, _shutdown) = start_proxy_with_backend("replica-7").await;

    // Handshake by hand, then send 10 bytes of a frame that declares 48.
    let stream = TcpStream::connect(&proxy_addr).await.expect("connect failed");
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let writer = FrameWriter::new(write_half);
    negotiate_as_client(&mut reader, &writer, Duration::from_secs(5))
        .await
        .expect("negotiation failed");

    writer
        .write_frame(10, |buf| {
            buf.put_u32_le(48);
            buf.put_slice(&[0u8; 6]);
        })
        .await
        .expect("write failed");
    drop(writer);

    // The proxy detects the truncation and drops the connection without
    // processing the partial frame.
    let end = reader.read_metadata_frame().await.expect("read failed");
    assert!(end.is_none());

    // Sibling connections are unaffected.
    let mut client = ReplicaClient::connect(&proxy_addr, TimeoutConfig::default(), None)
        .await
        .expect("connect failed");
    let response = client
        .request(
            ResourceType::Document,
            OperationType::Read,
            "/replica-7/apps/x",
            None,
            None,
        )
        .await
        .expect("request failed");
    assert!(response.is_success());
}
