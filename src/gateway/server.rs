//! Gateway WebSocket server
//!
//! One task per accepted socket. Each connection runs the handshake state
//! machine, then dispatches requests concurrently; responses are funnelled
//! through a single writer task so frames for one request id keep their
//! order. Startup is fail-closed: [`GatewayServer::bind`] refuses to open
//! the listening socket unless the security requirements pass.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::auth::{AuthRequest, Authenticator};
use super::dispatch::{cancel_pair, Dispatcher, InFlight, Outbound, RequestContext};
use super::handshake::{negotiate_protocol, protocol_mismatch_details, Admission, ConnState, ConnectionInfo, ConnectionRegistry};
use super::methods::{builtin_registry, MethodDeps};
use super::pairing::PairingStore;
use super::protocol::{
    close_codes, ConnectParams, ErrorShape, GatewayFrame, HelloOk, RequestFrame, ResponseFrame, Role, ServerInfo,
    PAIRING_REQUIRED_REASON,
};
use crate::config::{devices_dir, ensure_security_requirements, Config, GatewayConfig};
use crate::error::{Error, Result};
use crate::sessions::SessionStore;

/// Capabilities this gateway can grant
pub const SERVER_CAPABILITIES: &[&str] = &["idempotency", "streaming", "pairing"];

/// Outbound frames buffered per connection
const OUTBOUND_QUEUE: usize = 256;

/// How often idle rate-limit entries are swept
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state of a running gateway
#[derive(Clone)]
pub struct GatewayState {
    config: Arc<GatewayConfig>,
    authenticator: Arc<Authenticator>,
    pairing: Arc<PairingStore>,
    sessions: Arc<SessionStore>,
    dispatcher: Dispatcher,
    connections: ConnectionRegistry,
}

impl GatewayState {
    /// Build stores and the method registry from configuration
    pub fn new(config: &Config) -> Self {
        let pairing = Arc::new(PairingStore::new(devices_dir(&config.resolved_state_dir())));
        let sessions = Arc::new(SessionStore::from_config(config));
        let connections = ConnectionRegistry::new();

        let registry = builtin_registry(&MethodDeps {
            pairing: pairing.clone(),
            sessions: sessions.clone(),
            connections: connections.clone(),
            started: Instant::now(),
        });
        let dispatcher = Dispatcher::new(
            registry,
            config.gateway.idempotency_ttl,
            config.gateway.idempotency_capacity,
        );

        GatewayState {
            config: Arc::new(config.gateway.clone()),
            authenticator: Arc::new(Authenticator::new(config.gateway.auth.clone())),
            pairing,
            sessions,
            dispatcher,
            connections,
        }
    }

    /// Device pairing tables
    pub fn pairing(&self) -> &Arc<PairingStore> {
        &self.pairing
    }

    /// Session store
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Live connections
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Authenticator
    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }
}

/// A bound, not yet serving, gateway
pub struct GatewayServer {
    listener: TcpListener,
    state: GatewayState,
}

impl GatewayServer {
    /// Validate security requirements, then bind the listening socket
    ///
    /// Nothing is bound when validation fails.
    pub async fn bind(config: &Config) -> Result<Self> {
        ensure_security_requirements(config)?;

        let state = GatewayState::new(config);
        let addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            addr = %listener.local_addr()?,
            auth_mode = ?config.gateway.auth.mode,
            "gateway listening"
        );

        Ok(GatewayServer { listener, state })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Serve until the process is stopped
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let authenticator = self.state.authenticator.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                authenticator.limiter().cleanup();
            }
        });

        let app = router(self.state);
        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        sweeper.abort();
        info!("gateway stopped");
        Ok(result?)
    }
}

/// HTTP routes: the WebSocket endpoint (`/` and `/ws`) and `/health`
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": crate::VERSION,
        "connections": state.connections.count().await,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    // Hard transport cap; frames between max_payload and this get a 1009 close
    let hard_limit = state.config.max_payload_bytes.saturating_mul(2);
    ws.max_message_size(hard_limit)
        .on_upgrade(move |socket| handle_socket(socket, remote, headers, state))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, headers: HeaderMap, state: GatewayState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Response(frame) => encode(&GatewayFrame::Response(frame)),
                Outbound::Event(event) => encode(&GatewayFrame::Event(event)),
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            let Some(message) = message else { continue };
            if let Err(e) = sink.send(message).await {
                debug!(conn_id = %writer_conn, error = %e, "socket write failed");
                break;
            }
        }
    });

    let connection = Connection {
        conn_id: conn_id.clone(),
        remote,
        headers,
        state: state.clone(),
        outbound: tx,
        conn_state: ConnState::Connecting,
    };
    connection.run(stream).await;

    state.connections.unregister(&conn_id).await;
    let _ = writer.await;
    debug!(conn_id = %conn_id, remote = %remote, "connection closed");
}

fn encode(frame: &GatewayFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            error!(error = %e, "failed to encode frame");
            None
        }
    }
}

/// One inbound read
enum Inbound {
    Request(RequestFrame),
    Invalid { id: Option<String>, message: String },
    TooBig,
    Closed,
}

async fn next_inbound(stream: &mut SplitStream<WebSocket>, max_payload: usize) -> Inbound {
    loop {
        let message = match stream.next().await {
            None => return Inbound::Closed,
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                return Inbound::Closed;
            }
            Some(Ok(message)) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > max_payload {
                    return Inbound::TooBig;
                }
                return parse_inbound(text.as_str());
            }
            Message::Binary(bytes) => {
                if bytes.len() > max_payload {
                    return Inbound::TooBig;
                }
                return match std::str::from_utf8(&bytes) {
                    Ok(text) => parse_inbound(text),
                    Err(_) => Inbound::Invalid {
                        id: None,
                        message: "frames must be UTF-8 JSON".into(),
                    },
                };
            }
            Message::Close(_) => return Inbound::Closed,
            Message::Ping(_) | Message::Pong(_) => continue,
        }
    }
}

fn parse_inbound(text: &str) -> Inbound {
    match serde_json::from_str::<GatewayFrame>(text) {
        Ok(GatewayFrame::Request(frame)) => Inbound::Request(frame),
        Ok(_) => Inbound::Invalid {
            id: None,
            message: "only `req` frames are accepted".into(),
        },
        Err(e) => Inbound::Invalid {
            id: serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string)),
            message: format!("malformed frame: {}", e),
        },
    }
}

/// Close code and reason for a failed handshake
fn handshake_close(err: &Error) -> (u16, &'static str) {
    match err {
        Error::PairingRequired(_) => (close_codes::POLICY_VIOLATION, PAIRING_REQUIRED_REASON),
        Error::AuthFailed(_) | Error::Unauthorized(_) => (close_codes::POLICY_VIOLATION, "unauthorized"),
        Error::RateLimit { .. } => (close_codes::POLICY_VIOLATION, "rate limited"),
        Error::InvalidInput(_) | Error::Protocol(_) => (close_codes::INVALID_HANDSHAKE, "invalid handshake"),
        _ => (close_codes::INTERNAL_ERROR, "internal error"),
    }
}

/// Granted capabilities: what the client asked for, or everything when it asked for nothing
fn grant_capabilities(requested: &[String]) -> Vec<String> {
    SERVER_CAPABILITIES
        .iter()
        .filter(|cap| requested.is_empty() || requested.iter().any(|r| r == *cap))
        .map(|cap| cap.to_string())
        .collect()
}

/// Identity established by a successful handshake
struct Session {
    role: Role,
    user: Option<String>,
}

struct Connection {
    conn_id: String,
    remote: SocketAddr,
    headers: HeaderMap,
    state: GatewayState,
    outbound: mpsc::Sender<Outbound>,
    conn_state: ConnState,
}

impl Connection {
    async fn send(&self, outbound: Outbound) {
        // A closed queue means the writer is gone; the read loop will notice
        let _ = self.outbound.send(outbound).await;
    }

    async fn respond(&self, frame: ResponseFrame) {
        self.send(Outbound::Response(frame)).await;
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.conn_state = self.conn_state.on_close();
        self.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        })
        .await;
    }

    async fn run(mut self, mut stream: SplitStream<WebSocket>) {
        self.conn_state = match self.conn_state.on_open() {
            Ok(next) => next,
            Err(e) => {
                error!(conn_id = %self.conn_id, error = %e, "connection state error");
                return;
            }
        };

        let max_payload = self.state.config.max_payload_bytes;
        let first = tokio::time::timeout(
            self.state.config.handshake_timeout,
            next_inbound(&mut stream, max_payload),
        )
        .await;

        let session = match first {
            Err(_) => {
                info!(conn_id = %self.conn_id, remote = %self.remote, "handshake timed out");
                self.close(close_codes::HANDSHAKE_TIMEOUT, "handshake timeout").await;
                return;
            }
            Ok(Inbound::Closed) => return,
            Ok(Inbound::TooBig) => {
                self.close(close_codes::MESSAGE_TOO_BIG, "payload too large").await;
                return;
            }
            Ok(Inbound::Invalid { id, message }) => {
                self.respond(ResponseFrame::error(id.unwrap_or_default(), ErrorShape::invalid_request(message)))
                    .await;
                self.close(close_codes::INVALID_HANDSHAKE, "invalid handshake").await;
                return;
            }
            Ok(Inbound::Request(frame)) => match self.handshake(frame).await {
                Some(session) => session,
                None => return,
            },
        };

        self.serve_requests(stream, session).await;
    }

    /// Run `connect`; on failure the error response and close are already queued
    async fn handshake(&mut self, frame: RequestFrame) -> Option<Session> {
        if let Admission::Reject { reason, .. } = self.conn_state.admit(&frame.method) {
            self.respond(ResponseFrame::error(frame.id, ErrorShape::invalid_request(reason)))
                .await;
            self.close(close_codes::INVALID_HANDSHAKE, "invalid handshake").await;
            return None;
        }

        let params: ConnectParams = match serde_json::from_value(frame.params) {
            Ok(params) => params,
            Err(e) => {
                self.respond(ResponseFrame::error(
                    frame.id,
                    ErrorShape::invalid_request(format!("invalid connect params: {}", e)),
                ))
                .await;
                self.close(close_codes::INVALID_HANDSHAKE, "invalid handshake").await;
                return None;
            }
        };

        let Some(protocol) = negotiate_protocol(params.min_protocol, params.max_protocol) else {
            info!(
                conn_id = %self.conn_id,
                min = params.min_protocol,
                max = params.max_protocol,
                "protocol mismatch"
            );
            let shape = ErrorShape::invalid_request("protocol mismatch").with_details(protocol_mismatch_details(&params));
            self.respond(ResponseFrame::error(frame.id, shape)).await;
            self.close(close_codes::PROTOCOL_MISMATCH, "protocol mismatch").await;
            return None;
        };

        match self.authorize(&params).await {
            Ok(user) => {
                self.conn_state = match self.conn_state.on_authenticated() {
                    Ok(next) => next,
                    Err(e) => {
                        error!(conn_id = %self.conn_id, error = %e, "connection state error");
                        return None;
                    }
                };

                let capabilities = grant_capabilities(&params.caps);
                self.state
                    .connections
                    .register(ConnectionInfo {
                        conn_id: self.conn_id.clone(),
                        remote: self.remote,
                        protocol,
                        role: params.role,
                        client: params.client.clone(),
                        caps: capabilities.clone(),
                        user: user.clone(),
                        device_id: params.device.as_ref().map(|d| d.id.clone()),
                        connected_at: chrono::Utc::now().timestamp_millis(),
                    })
                    .await;

                let hello = HelloOk {
                    protocol,
                    capabilities,
                    role: params.role,
                    server: ServerInfo {
                        version: crate::VERSION.to_string(),
                        conn_id: self.conn_id.clone(),
                    },
                    max_payload: self.state.config.max_payload_bytes,
                };
                match serde_json::to_value(&hello) {
                    Ok(result) => self.respond(ResponseFrame::success(frame.id, result)).await,
                    Err(e) => {
                        error!(conn_id = %self.conn_id, error = %e, "failed to encode hello");
                        self.close(close_codes::INTERNAL_ERROR, "internal error").await;
                        return None;
                    }
                }

                info!(
                    conn_id = %self.conn_id,
                    remote = %self.remote,
                    protocol,
                    role = %params.role,
                    client = %params.client.id,
                    "client connected"
                );
                Some(Session {
                    role: params.role,
                    user,
                })
            }
            Err(err) => {
                let (code, reason) = handshake_close(&err);
                if code == close_codes::INTERNAL_ERROR {
                    error!(conn_id = %self.conn_id, error = %err, "handshake failed");
                }
                self.respond(ResponseFrame::error(frame.id, err.to_shape())).await;
                self.close(code, reason).await;
                None
            }
        }
    }

    /// Shared credentials first, then device pairing
    async fn authorize(&self, params: &ConnectParams) -> Result<Option<String>> {
        let outcome = self.state.authenticator.check_access(&AuthRequest {
            remote: self.remote,
            headers: &self.headers,
            auth: params.auth.as_ref(),
        })?;

        if let Some(device) = &params.device {
            self.state
                .pairing
                .authorize_device(device, params.role, &params.client, Some(self.remote.ip().to_string()))
                .await
                .inspect_err(|e| {
                    info!(conn_id = %self.conn_id, device_id = %device.id, error = %e, "device not authorized");
                })?;
        }
        Ok(outcome.user)
    }

    async fn serve_requests(mut self, mut stream: SplitStream<WebSocket>, session: Session) {
        let max_payload = self.state.config.max_payload_bytes;
        let in_flight = InFlight::new();
        let (cancel, _) = cancel_pair();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                inbound = next_inbound(&mut stream, max_payload) => match inbound {
                    Inbound::Closed => break,
                    Inbound::TooBig => {
                        self.close(close_codes::MESSAGE_TOO_BIG, "payload too large").await;
                        break;
                    }
                    Inbound::Invalid { id, message } => {
                        self.respond(ResponseFrame::error(id.unwrap_or_default(), ErrorShape::invalid_request(message)))
                            .await;
                    }
                    Inbound::Request(frame) => match self.conn_state.admit(&frame.method) {
                        Admission::Dispatch => {
                            let Some(guard) = in_flight.begin(&frame.id) else {
                                self.respond(ResponseFrame::error(
                                    frame.id.clone(),
                                    ErrorShape::invalid_request(format!("request id {} is already in flight", frame.id)),
                                ))
                                .await;
                                continue;
                            };

                            let ctx = RequestContext::new(
                                self.conn_id.clone(),
                                frame.id.clone(),
                                session.role,
                                session.user.clone(),
                                self.outbound.clone(),
                                cancel.signal(),
                            );
                            let dispatcher = self.state.dispatcher.clone();
                            let outbound = self.outbound.clone();
                            tasks.spawn(async move {
                                let _guard = guard;
                                let response = dispatcher.dispatch(ctx, frame).await;
                                let _ = outbound.send(Outbound::Response(response)).await;
                            });
                        }
                        Admission::Reject { reason, close } => {
                            self.respond(ResponseFrame::error(frame.id, ErrorShape::invalid_request(reason)))
                                .await;
                            if close {
                                self.close(close_codes::POLICY_VIOLATION, "protocol violation").await;
                                break;
                            }
                        }
                        Admission::Handshake => {
                            self.respond(ResponseFrame::error(
                                frame.id,
                                ErrorShape::invalid_request("connection already established"),
                            ))
                            .await;
                        }
                    },
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(conn_id = %self.conn_id, error = %e, "request task failed");
                    }
                }
            }
        }

        // Best-effort cancellation of whatever is still running
        self.conn_state = self.conn_state.on_close();
        if !tasks.is_empty() {
            debug!(conn_id = %self.conn_id, in_flight = in_flight.len(), "cancelling in-flight requests");
        }
        cancel.cancel();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        self.conn_state = self.conn_state.on_closed();
        debug_assert!(in_flight.is_empty());
    }
}
