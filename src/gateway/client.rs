//! Gateway WebSocket client
//!
//! A one-shot client: each call opens a socket, performs the `connect`
//! handshake, sends one request, collects its responses up to the final one
//! and closes. Failures of any stage are reported as [`GatewayCallError`],
//! the same `{code, message}` shape the server sends, plus the close code
//! when the server ended the connection.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::pairing::GatewayCaller;
use super::protocol::{
    close_codes, ClientInfo, ConnectAuth, ConnectParams, DeviceParams, ErrorCode, ErrorShape, GatewayFrame,
    RequestFrame, ResponseFrame, Role, CONNECT_METHOD, PAIRING_REQUIRED_REASON, PROTOCOL_VERSION,
    SUPPORTED_PROTOCOLS,
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Error returned by a gateway call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayCallError {
    /// Wire error code
    pub code: ErrorCode,
    /// Server (or transport) message
    pub message: String,
    /// WebSocket close code, when the server closed the connection
    pub close_code: Option<u16>,
    /// Cooldown hint from a RATE_LIMITED response
    pub retry_after_ms: Option<u64>,
}

impl GatewayCallError {
    /// Create an error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        GatewayCallError {
            code,
            message: message.into(),
            close_code: None,
            retry_after_ms: None,
        }
    }

    /// From an error response
    pub fn from_shape(shape: ErrorShape) -> Self {
        GatewayCallError {
            code: shape.code,
            message: shape.message,
            close_code: None,
            retry_after_ms: shape.retry_after_ms,
        }
    }

    /// From a close frame received before the final response
    pub fn from_close(code: u16, reason: &str) -> Self {
        let error_code = match code {
            close_codes::POLICY_VIOLATION if reason.to_lowercase().contains(PAIRING_REQUIRED_REASON) => {
                ErrorCode::PairingRequired
            }
            close_codes::POLICY_VIOLATION => ErrorCode::Unauthorized,
            close_codes::PROTOCOL_MISMATCH | close_codes::INVALID_HANDSHAKE | close_codes::MESSAGE_TOO_BIG => {
                ErrorCode::InvalidRequest
            }
            _ => ErrorCode::Unavailable,
        };
        let message = if reason.is_empty() {
            format!("gateway closed the connection ({})", code)
        } else {
            format!("gateway closed the connection ({}): {}", code, reason)
        };
        GatewayCallError {
            close_code: Some(code),
            ..Self::new(error_code, message)
        }
    }

    /// Transport-level failure
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    fn attach_close(mut self, close_code: Option<u16>) -> Self {
        if self.close_code.is_none() {
            self.close_code = close_code;
        }
        self
    }
}

/// Whether `url` points at this machine
pub fn is_loopback_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    match parsed.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Connection settings for [`GatewayClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Gateway URL, e.g. `ws://127.0.0.1:18789/ws`
    pub url: String,
    /// Shared token
    pub token: Option<String>,
    /// Shared password
    pub password: Option<String>,
    /// Requested role
    pub role: Role,
    /// Client description
    pub client: ClientInfo,
    /// Capabilities to announce
    pub caps: Vec<String>,
    /// Device identity
    pub device: Option<DeviceParams>,
    /// Protocol range to offer
    pub min_protocol: u32,
    /// Protocol range to offer
    pub max_protocol: u32,
    /// Whole-call deadline
    pub timeout: Duration,
}

impl ClientOptions {
    /// Options for `url` with defaults for everything else
    pub fn new(url: impl Into<String>) -> Self {
        ClientOptions {
            url: url.into(),
            token: None,
            password: None,
            role: Role::Operator,
            client: ClientInfo {
                id: "opengate-client".to_string(),
                version: crate::VERSION.to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: "cli".to_string(),
                instance_id: None,
            },
            caps: Vec::new(),
            device: None,
            min_protocol: SUPPORTED_PROTOCOLS.first().copied().unwrap_or(PROTOCOL_VERSION),
            max_protocol: PROTOCOL_VERSION,
            timeout: Duration::from_secs(30),
        }
    }

    /// Use token auth
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Use password auth
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Request a role
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Present a device identity
    pub fn with_device(mut self, id: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.device = Some(DeviceParams {
            id: id.into(),
            public_key: public_key.into(),
        });
        self
    }

    /// Offer a specific protocol range
    pub fn with_protocol_range(mut self, min: u32, max: u32) -> Self {
        self.min_protocol = min;
        self.max_protocol = max;
        self
    }

    fn connect_params(&self) -> ConnectParams {
        let auth = (self.token.is_some() || self.password.is_some()).then(|| ConnectAuth {
            token: self.token.clone(),
            password: self.password.clone(),
        });
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            caps: self.caps.clone(),
            role: self.role,
            auth,
            device: self.device.clone(),
        }
    }
}

/// Everything a call produced
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    /// Handshake result (`hello-ok`)
    pub hello: Value,
    /// Intermediate results, in arrival order
    pub intermediate: Vec<Value>,
    /// Final result
    pub result: Value,
}

/// One-shot gateway client
#[derive(Debug, Clone)]
pub struct GatewayClient {
    options: ClientOptions,
}

impl GatewayClient {
    /// Create a client
    pub fn new(options: ClientOptions) -> Self {
        GatewayClient { options }
    }

    /// Client options
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Call `method` and return its final result
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayCallError> {
        self.request_with(method, params, None).await.map(|out| out.result)
    }

    /// Call `method` and return every response it produced
    pub async fn request_with(
        &self,
        method: &str,
        params: Value,
        idempotency_key: Option<&str>,
    ) -> Result<CallOutput, GatewayCallError> {
        let call = self.exchange(method, params, idempotency_key);
        match tokio::time::timeout(self.options.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayCallError::unavailable(format!(
                "gateway call {} timed out after {:?}",
                method, self.options.timeout
            ))),
        }
    }

    async fn exchange(
        &self,
        method: &str,
        params: Value,
        idempotency_key: Option<&str>,
    ) -> Result<CallOutput, GatewayCallError> {
        let (mut socket, _) = connect_async(self.options.url.as_str())
            .await
            .map_err(|e| GatewayCallError::unavailable(format!("connect to {} failed: {}", self.options.url, e)))?;

        let connect_params = serde_json::to_value(self.options.connect_params())
            .map_err(|e| GatewayCallError::new(ErrorCode::InvalidRequest, e.to_string()))?;
        let connect = RequestFrame::new(format!("connect-{}", uuid::Uuid::new_v4()), CONNECT_METHOD, connect_params);
        let (hello, _) = roundtrip(&mut socket, connect).await?;

        let mut request = RequestFrame::new(uuid::Uuid::new_v4().to_string(), method, params);
        if let Some(key) = idempotency_key {
            request = request.with_idempotency_key(key);
        }
        let (result, intermediate) = roundtrip(&mut socket, request).await?;

        let _ = socket
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await;

        Ok(CallOutput {
            hello,
            intermediate,
            result,
        })
    }
}

async fn send_frame(socket: &mut Socket, frame: RequestFrame) -> Result<String, GatewayCallError> {
    let id = frame.id.clone();
    let text = serde_json::to_string(&GatewayFrame::Request(frame))
        .map_err(|e| GatewayCallError::new(ErrorCode::InvalidRequest, e.to_string()))?;
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| GatewayCallError::unavailable(format!("send failed: {}", e)))?;
    Ok(id)
}

/// Send one request and read until its final response
async fn roundtrip(socket: &mut Socket, frame: RequestFrame) -> Result<(Value, Vec<Value>), GatewayCallError> {
    let id = send_frame(socket, frame).await?;
    let mut intermediate = Vec::new();
    // A close frame right after an error response refines the error with its code
    let mut pending_error: Option<GatewayCallError> = None;

    while let Some(message) = socket.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                return Err(pending_error
                    .unwrap_or_else(|| GatewayCallError::unavailable(format!("connection lost: {}", e))))
            }
        };

        match message {
            Message::Text(text) => {
                let Ok(GatewayFrame::Response(response)) = serde_json::from_str::<GatewayFrame>(text.as_str()) else {
                    continue;
                };
                if response.id != id {
                    continue;
                }
                match into_outcome(response) {
                    Outcome::Intermediate(value) => intermediate.push(value),
                    Outcome::Final(value) => return Ok((value, intermediate)),
                    Outcome::Failed(err) => {
                        // Wait briefly for a close frame that may follow
                        pending_error = Some(err);
                        match tokio::time::timeout(Duration::from_millis(250), socket.next()).await {
                            Ok(Some(Ok(Message::Close(Some(frame))))) => {
                                let code = u16::from(frame.code);
                                return Err(pending_error
                                    .take()
                                    .map(|e| e.attach_close(Some(code)))
                                    .unwrap_or_else(|| GatewayCallError::from_close(code, frame.reason.as_str())));
                            }
                            _ => return Err(pending_error.take().unwrap_or_else(|| GatewayCallError::unavailable("request failed"))),
                        }
                    }
                }
            }
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((close_codes::NORMAL, String::new()));
                return Err(match pending_error {
                    Some(err) => err.attach_close(Some(code)),
                    None => GatewayCallError::from_close(code, &reason),
                });
            }
            _ => {}
        }
    }

    Err(pending_error.unwrap_or_else(|| GatewayCallError::unavailable("connection closed before a final response")))
}

enum Outcome {
    Intermediate(Value),
    Final(Value),
    Failed(GatewayCallError),
}

fn into_outcome(response: ResponseFrame) -> Outcome {
    if !response.ok {
        let shape = response
            .error
            .unwrap_or_else(|| ErrorShape::new(ErrorCode::Internal, "request failed"));
        return Outcome::Failed(GatewayCallError::from_shape(shape));
    }
    let value = response.result.unwrap_or(Value::Null);
    if response.is_final {
        Outcome::Final(value)
    } else {
        Outcome::Intermediate(value)
    }
}

#[async_trait]
impl GatewayCaller for GatewayClient {
    fn url(&self) -> &str {
        &self.options.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayCallError> {
        self.request(method, params).await
    }
}
