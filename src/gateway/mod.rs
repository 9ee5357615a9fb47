//! Gateway module - WebSocket-based control plane
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Gateway Server                    │
//! │              ws://127.0.0.1:18789/ws                │
//! │   handshake → auth → pairing → dispatch → methods   │
//! └───────────────────────┬─────────────────────────────┘
//!                         │
//!           ┌─────────────┼─────────────┐
//!           │             │             │
//!           ▼             ▼             ▼
//!      ┌─────────┐   ┌─────────┐   ┌─────────┐
//!      │   CLI   │   │ WebChat │   │  Nodes  │
//!      │ Client  │   │   UI    │   │         │
//!      └─────────┘   └─────────┘   └─────────┘
//! ```

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod handshake;
pub mod methods;
pub mod pairing;
pub mod protocol;
pub mod server;

pub use auth::{AuthOutcome, AuthRateLimiter, AuthRequest, Authenticator};
pub use client::{CallOutput, ClientOptions, GatewayCallError, GatewayClient};
pub use dispatch::{Dispatcher, Method, MethodRegistry, RequestContext};
pub use handshake::{ConnState, ConnectionInfo, ConnectionRegistry};
pub use pairing::PairingStore;
pub use protocol::{
    close_codes, ErrorCode, ErrorShape, GatewayFrame, RequestFrame, ResponseFrame, Role, PROTOCOL_VERSION,
};
pub use server::{router, GatewayServer, GatewayState};
