//! Wire protocol for the tether bridge.
//!
//! One JSON object per newline-terminated line, internally tagged with
//! `"type"`. Node clients send hello/pair/event/request frames; the bridge
//! answers with auth results, RPC responses, and server-pushed events.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port the bridge listens on.
pub const DEFAULT_PORT: u16 = 18790;

/// Upper bound for forwarding a node RPC to the backend gateway.
pub const RPC_TIMEOUT_MS: u64 = 30_000;

/// Interval between periodic presence beacons, per connected node.
pub const PRESENCE_INTERVAL_SECS: u64 = 180;

/// `agent.request` messages longer than this are dropped.
pub const MAX_AGENT_MESSAGE_CHARS: usize = 20_000;

pub mod error_codes {
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    /// Pairing denied by the approval gate. Lower-case on the wire.
    pub const PAIRING_REJECTED: &str = "rejected";
}

/// Event names the bridge pushes to nodes.
pub mod server_events {
    pub const CHAT: &str = "chat";
    pub const HEALTH: &str = "health";
    pub const SEQ_GAP: &str = "seqGap";
    pub const TICK: &str = "tick";
}

// ── Error shape ──────────────────────────────────────────────────────────────

/// Structured error carried by failure frames and RPC error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ── Client → server frames ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
}

/// Fire-and-forget event, either direction. No reply is ever sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// RPC request; expects exactly one response correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Hello(Hello),
    Pair(PairRequest),
    Event(EventFrame),
    Request(RpcRequest),
}

// ── Server → client frames ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape::new(code, message)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Plain auth success; carries nothing.
    AuthOk,
    /// Hello carried no known pairing. The connection stays open and a
    /// `pair` frame is expected next.
    NotPaired,
    /// Pairing success; carries the freshly minted bearer token.
    PairOk { token: String },
    /// Handshake failure. The connection closes after this frame.
    AuthError(ErrorShape),
    Event(EventFrame),
    Response(RpcResponse),
}

// ── Node event dispatch ──────────────────────────────────────────────────────

/// Payload of an `agent.request` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub message: String,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub deliver: bool,
}

/// A node-originated event, decoded from the open wire name into a closed
/// set at the boundary. Unrecognized names become `Unknown`, which the
/// coordinator ignores — unknown events must never error or close the
/// connection.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    ChatSubscribe { session_key: String },
    ChatUnsubscribe { session_key: String },
    VoiceTranscript { text: String, session_key: Option<String> },
    AgentRequest(AgentRequest),
    Unknown,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionKeyPayload {
    session_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptPayload {
    text: String,
    #[serde(default)]
    session_key: Option<String>,
}

impl NodeEvent {
    /// Decode an event frame. Returns `None` when a known event's payload is
    /// missing or does not decode (the frame is then dropped).
    pub fn decode(frame: &EventFrame) -> Option<Self> {
        fn payload<T: serde::de::DeserializeOwned>(frame: &EventFrame) -> Option<T> {
            serde_json::from_value(frame.payload.clone()?).ok()
        }

        match frame.event.as_str() {
            "chat.subscribe" => payload::<SessionKeyPayload>(frame).map(|p| Self::ChatSubscribe {
                session_key: p.session_key,
            }),
            "chat.unsubscribe" => {
                payload::<SessionKeyPayload>(frame).map(|p| Self::ChatUnsubscribe {
                    session_key: p.session_key,
                })
            },
            "voice.transcript" => payload::<TranscriptPayload>(frame).map(|p| {
                Self::VoiceTranscript {
                    text: p.text,
                    session_key: p.session_key,
                }
            }),
            "agent.request" => payload::<AgentRequest>(frame).map(Self::AgentRequest),
            _ => Some(Self::Unknown),
        }
    }
}

// ── RPC method allowlist ─────────────────────────────────────────────────────

/// The closed set of RPC methods nodes may forward to the gateway. Anything
/// else is answered with FORBIDDEN without contacting the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    ChatHistory,
    ChatSend,
    Health,
}

impl RpcMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "chat.history" => Some(Self::ChatHistory),
            "chat.send" => Some(Self::ChatSend),
            "health" => Some(Self::Health),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatHistory => "chat.history",
            Self::ChatSend => "chat.send",
            Self::Health => "health",
        }
    }
}

// ── Gateway pushes ───────────────────────────────────────────────────────────

/// A push received from the backend gateway's event stream. Never mutated by
/// the bridge, only re-delivered to subscribed nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayPush {
    /// Initial state snapshot; only the health portion is relayed.
    Snapshot { health: Value },
    /// Named event with an optional payload (health, tick, chat, …).
    Event {
        event: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    /// The subscriber missed pushes and should treat local state as stale.
    SeqGap,
}

// ── String hygiene ───────────────────────────────────────────────────────────

/// Trim and discard empty strings. Client-supplied identifiers go through
/// this before any use.
pub fn trimmed_non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
