//! # OpenGate
//!
//! WebSocket control-plane gateway for multi-tenant agent orchestration.
//!
//! ## Features
//!
//! - **Versioned handshake:** protocol negotiation before any RPC
//! - **Fail-closed startup:** the gateway refuses to bind until auth is configured
//! - **Token, password or trusted-proxy auth** with brute-force lockout
//! - **Device pairing:** unknown devices wait for operator approval
//! - **Idempotent RPC:** retried requests replay the first result
//! - **Session transcripts:** JSONL transcripts with reset/delete archives

pub mod config;
pub mod error;
pub mod gateway;
pub mod persist;
pub mod sessions;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
