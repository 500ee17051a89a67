// Copyright 2026 Joyent, Inc.

//! Error types shared by the codec, framing, and proxy layers.

use std::io;

use thiserror::Error;

/// Errors raised while encoding, decoding, or relaying replica protocol
/// traffic. Every variant is fatal to the message or connection it concerns;
/// none is retried below the application layer.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The stream ended before a declared frame length was satisfied.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    /// A token or frame length is inconsistent with the remaining buffer,
    /// or a required field is absent from a well-formed message kind.
    #[error("malformed token stream: {0}")]
    MalformedToken(String),

    /// A token type tag outside the known table. Its value width is
    /// unknowable, so the message cannot even be skipped over.
    #[error("unsupported token type tag 0x{0:02x}")]
    UnsupportedTokenType(u8),

    /// Context negotiation completed with a non-success status. The
    /// connection must be discarded.
    #[error("context negotiation failed with status {0}")]
    HandshakeFailed(u32),

    /// The routing hint has no entry in the routing table.
    #[error("no endpoint for destination hint \"{0}\"")]
    RoutingUnresolvable(String),

    /// Connecting to or negotiating with a destination failed. Propagated to
    /// every caller awaiting the single-flight creation; never cached.
    #[error("upstream {endpoint} unavailable: {source}")]
    UpstreamUnavailable {
        endpoint: String,
        #[source]
        source: Box<ReplicaError>,
    },

    /// The peer closed the connection at a point where more traffic was
    /// required.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation exceeded its configured deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A configuration document failed to parse.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;
