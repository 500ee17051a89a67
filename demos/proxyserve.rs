// Copyright 2026 Joyent, Inc.

use std::fs;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{crate_version, App, Arg, ArgMatches};
use slog::{error, o, Drain, Logger};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use replica_rpc::config::{RoutingTable, TimeoutConfig};
use replica_rpc::proxy::Proxy;
use replica_rpc::server;

static APP: &str = "proxyserve";
static DEFAULT_LISTEN: &str = "127.0.0.1:2030";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Reverse proxy for replica RPC traffic")
        .version(crate_version!())
        .arg(
            Arg::with_name("listen")
                .help("address:port to accept replica requests on (Default: 127.0.0.1:2030)")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("routes")
                .help("path to a JSON routing table: {\"routes\": {\"<hint>\": \"host:port\"}}")
                .long("routes")
                .short("r")
                .takes_value(true)
                .required(true),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let listen = matches.value_of("listen").unwrap_or(DEFAULT_LISTEN);
    let routes_path = matches.value_of("routes").unwrap_or_else(|| {
        eprintln!("Failed to parse routes argument");
        process::exit(1)
    });
    let routes_doc = fs::read_to_string(routes_path).unwrap_or_else(|e| {
        eprintln!("Failed to read routing table {}: {}", routes_path, e);
        process::exit(1)
    });
    let routes = RoutingTable::from_json(&routes_doc).unwrap_or_else(|e| {
        eprintln!("Failed to parse routing table {}: {}", routes_path, e);
        process::exit(1)
    });

    let listener = TcpListener::bind(listen).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", listen, e);
        process::exit(1)
    });

    let proxy = Arc::new(Proxy::new(
        routes,
        TimeoutConfig::default(),
        Some(root_log.clone()),
    ));
    let shutdown = CancellationToken::new();

    if let Err(e) = server::serve(listener, proxy, shutdown).await {
        error!(root_log, "proxy terminated"; "err" => %e);
        process::exit(1)
    }
}
