// Copyright 2026 Joyent, Inc.

use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};

use replica_rpc::client::ReplicaClient;
use replica_rpc::config::TimeoutConfig;
use replica_rpc::protocol::{OperationType, ResourceType};

static APP: &str = "replicacall";
static DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for sending one replica RPC request")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for the proxy or replica")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for the proxy or replica (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("path")
                .help("replica path, e.g. /replica-7/apps/x/services/y")
                .long("path")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("auth")
                .help("pre-signed authorization token, forwarded opaquely")
                .long("auth")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("payload")
                .help("document body to send as a payload frame")
                .long("payload")
                .short("d")
                .takes_value(true),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()].concat();
    let path = matches.value_of("path").unwrap_or_else(|| {
        eprintln!("Failed to parse path argument");
        process::exit(1)
    });
    let auth = matches.value_of("auth");
    let payload = matches.value_of("payload").map(str::as_bytes);

    let mut client = ReplicaClient::connect(&addr, TimeoutConfig::default(), None)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to connect to {}: {}", addr, e);
            process::exit(1)
        });

    let operation = if payload.is_some() {
        OperationType::Create
    } else {
        OperationType::Read
    };
    let response = client
        .request(ResourceType::Document, operation, path, auth, payload)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Request failed: {}", e);
            process::exit(1)
        });

    println!("status: {}", response.status);
    println!("activity id: {}", response.activity_id);
    if let Some(charge) = response.tokens.request_charge {
        println!("request charge: {}", charge);
    }
    if let Some(body) = &response.payload {
        println!("{}", String::from_utf8_lossy(body));
    }
}
