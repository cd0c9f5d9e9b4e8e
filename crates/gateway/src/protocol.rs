// OpenClaw WebSocket Protocol
//
// Frame types exchanged with the gateway, as seen from the client side.
//
// Protocol flow:
// 1. Gateway pushes a "connect.challenge" event (optionally with a nonce)
// 2. Client sends a signed "connect" request
// 3. Gateway answers with a "hello-ok" payload
// 4. Bi-directional request/response traffic plus pushed events

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: u32 = 3;
/// Fixed client identifier covered by the device signature
pub const CLIENT_ID: &str = "gateway-client";
/// Fixed client mode covered by the device signature
pub const CLIENT_MODE: &str = "backend";
pub const CONNECT_METHOD: &str = "connect";
pub const CHALLENGE_EVENT: &str = "connect.challenge";
/// `type` of the payload answering a successful `connect`
pub const HELLO_OK_TYPE: &str = "hello-ok";
pub const DEFAULT_ROLE: &str = "operator";
pub const DEFAULT_SCOPES: &[&str] = &["operator.admin"];

/// Gateway frame - top-level message type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(GatewayRequest),

    #[serde(rename = "res")]
    Response(GatewayResponse),

    #[serde(rename = "event")]
    Event(GatewayEvent),
}

/// Request frame (either direction)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Unique request ID
    pub id: String,

    /// Method name (e.g., "connect", "health", "chat.send")
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: JsonValue,
}

impl GatewayRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: JsonValue) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Response frame answering a request with the same id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Request ID being responded to
    pub id: String,

    /// Success flag
    pub ok: bool,

    /// Response payload (if ok)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,

    /// Error details (if not ok)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl GatewayResponse {
    pub fn ok(id: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Error carried by a failed response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    /// Machine-readable code, e.g. `UNAUTHORIZED`
    pub code: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,

    /// Backoff hint for retryable errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub const INVALID_REQUEST: &'static str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &'static str = "UNAUTHORIZED";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }
}

/// Event frame pushed by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Event name (e.g., "connect.challenge", "tick", "presence")
    pub event: String,

    #[serde(default)]
    pub payload: JsonValue,

    /// Event sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl GatewayEvent {
    pub fn new(event: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event: event.into(),
            payload,
            seq: None,
        }
    }
}

/// Payload of the `connect.challenge` event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChallengePayload {
    #[serde(default)]
    pub nonce: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

/// Parameters of the `connect` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    pub device: DeviceProof,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

/// Client metadata sent with `connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    /// Fresh per connection
    pub instance_id: String,
}

/// Signed proof of the device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    pub id: String,
    /// Raw public key, URL-safe base64 without padding
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Payload of a successful `connect` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOkPayload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Negotiated protocol version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<JsonValue>,

    /// Device token granted to this device, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<GatewayPolicy>,
}

/// Device token grant inside `hello-ok`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub device_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<i64>,
}

/// Limits advertised by the gateway in `hello-ok`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_buffered_bytes: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
}
