// Copyright 2026 Joyent, Inc.

//! Routing and timeout configuration for the proxy tier.

use std::collections::HashMap;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{ReplicaError, Result};

/// Maps destination hints (the first segment of a replica path) to backend
/// endpoints in `host:port` form.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingTable {
    pub routes: HashMap<String, String>,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable::default()
    }

    pub fn insert(&mut self, hint: &str, endpoint: &str) {
        self.routes.insert(hint.to_string(), endpoint.to_string());
    }

    pub fn resolve(&self, hint: &str) -> Option<&str> {
        self.routes.get(hint).map(String::as_str)
    }

    /// Parses a routing table document of the form
    /// `{"routes": {"replica-7": "10.0.0.7:2030"}}`.
    pub fn from_json(doc: &str) -> Result<RoutingTable> {
        serde_json::from_str(doc).map_err(|e| ReplicaError::Config(e.to_string()))
    }
}

/// Per-operation deadlines. The base protocol can hang indefinitely on a
/// non-responsive peer, so connects, handshakes, and data-carrying reads
/// and writes all run under one of these. The idle wait for the next
/// inbound request is deliberately uncapped; reaping idle connections is
/// the transport layer's business.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> TimeoutConfig {
        TimeoutConfig {
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            io_timeout_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
