// Copyright 2026 Joyent, Inc.

//! Accept loop for the proxy tier: one relay task per inbound connection.

use std::sync::Arc;

use slog::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::proxy::Proxy;

/// Accepts inbound connections until `shutdown` fires, spawning a relay
/// task for each. Accept failures are logged and the loop keeps going; a
/// failing connection never takes the listener down with it.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<Proxy>,
    shutdown: CancellationToken,
) -> Result<()> {
    let log = proxy.log().clone();
    info!(log, "listening for replica requests";
          "address" => %listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(log, "accept loop shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let proxy = Arc::clone(&proxy);
                    let token = shutdown.child_token();
                    tokio::spawn(proxy.handle_connection(stream, token));
                }
                Err(e) => error!(log, "failed to accept socket"; "err" => %e),
            }
        }
    }
}
