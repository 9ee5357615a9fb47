//! Gateway Protocol - WebSocket-based control plane
//!
//! This module defines the protocol for communication between clients and the
//! gateway server.
//!
//! ## Protocol Overview
//!
//! - **JSON text frames** over a single WebSocket endpoint
//! - **Handshake first**: the client sends a `connect` request immediately
//!   after the socket opens; protocol version, role and credentials are
//!   settled before any other request is processed
//! - **Request-response pattern** with client-chosen request ids; requests
//!   may complete out of order, and a request may stream intermediate
//!   responses before its final one
//!
//! ## Message Types
//!
//! - `req`: Client-initiated requests
//! - `res`: Server responses to requests
//! - `event`: Server-pushed events

pub mod schema;
pub mod types;

pub use schema::{
    close_codes, ErrorCode, ErrorShape, EventFrame, GatewayFrame, RequestFrame, ResponseFrame,
    CONNECT_METHOD, PAIRING_REQUIRED_REASON, PROTOCOL_VERSION, SUPPORTED_PROTOCOLS,
};
pub use types::*;
