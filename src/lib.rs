// Copyright 2026 Joyent, Inc.

//! Replica: a length-prefixed, token-encoded RPC wire protocol and the
//! reverse-proxy tier that routes it.
//!
//! Protocol definition
//!
//! Every unit on the wire is a frame. Metadata frames (context
//! negotiation, requests, responses) have this structure:
//!
//! * LENGTH      4-byte little-endian unsigned integer counting the whole
//!               frame, the length field itself included.
//!
//! * RESOURCE    2-byte little-endian resource type (requests), or together
//!               with OPERATION the 4-byte little-endian STATUS word
//!               (responses).
//!
//! * OPERATION   2-byte little-endian operation type (requests only).
//!
//! * ACTIVITYID  16 opaque bytes correlating every frame of one logical
//!               operation.
//!
//! * TOKENS      A sequence of `identifier:u16 | type:u8 | value` tokens.
//!               The type tag alone determines the value width, so an
//!               implementation can skip identifiers it does not know.
//!
//! A request whose payload-present token is set is followed by one payload
//! frame: a 4-byte little-endian length counting only the bytes after it,
//! then that many payload bytes. The two length conventions are easy to
//! conflate, which is why the frame layer exposes one typed read call per
//! convention.
//!
//! The proxy in [`proxy`] reads each inbound request, extracts the replica
//! path token without deserializing the frame, strips the path's first
//! segment to pick a backend, splices the shortened path back in with the
//! frame length recomputed, and relays the backend's responses over the
//! inbound connection in arrival order.

#![allow(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod framing;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod scanner;
pub mod server;
