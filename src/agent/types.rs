//! Wire types for the agent bridge
//!
//! Defines the message shapes exchanged between:
//! - Bridge ↔ Agent (newline-delimited JSON-RPC over stdio)
//! - Bridge → Transport (event envelopes `{type, payload}`)
//! - Transport → Bridge (subscription and review commands)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version tag written on every outgoing line
pub const JSONRPC_VERSION: &str = "2.0";

/// Agent protocol version announced during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Agent method names used by the bridge
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_CANCEL: &str = "session/cancel";
    pub const SESSION_UPDATE: &str = "session/update";
    pub const REQUEST_PERMISSION: &str = "session/request_permission";
}

/// JSON-RPC "method not found"
pub const METHOD_NOT_FOUND: i64 = -32601;

// =============================================================================
// Agent → Bridge messages
// =============================================================================

/// One classified line read from the agent
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response(Response),
    Notification(Notification),
    IncomingCall(IncomingCall),
}

/// Answer to a call the bridge issued
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: std::result::Result<Value, RpcErrorObject>,
}

/// One-way message from the agent (no id)
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// Request issued by the agent back to the bridge
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Permissive view of any line, used only for classification.
///
/// `id` is an explicit option: a present id of zero is `Some(0)`, an absent
/// id is `None`.
#[derive(Debug, Deserialize)]
pub(crate) struct RawMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

// =============================================================================
// Bridge → Agent messages
// =============================================================================

/// Outgoing call
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingCall<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Outgoing notification
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Outgoing response to an incoming call
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingResponse<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a RpcErrorObject>,
}

// =============================================================================
// Agent protocol payloads
// =============================================================================

/// Result of the `initialize` handshake
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    #[serde(default)]
    pub protocol_version: Value,
    #[serde(default)]
    pub agent_capabilities: Value,
    #[serde(default)]
    pub auth_methods: Vec<Value>,
}

/// Result of `session/new`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: String,
}

/// Result of `session/prompt`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Params of a `session/update` notification
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: SessionUpdate,
}

/// One session update, tagged by `sessionUpdate`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk {
        content: ContentBlock,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        #[serde(default)]
        title: String,
        #[serde(default = "default_tool_kind")]
        kind: String,
        #[serde(default = "default_tool_status")]
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        #[serde(default)]
        status: Option<String>,
    },
    /// Thoughts, plans, command lists and kinds added after this bridge was written
    #[serde(other)]
    Other,
}

fn default_tool_kind() -> String {
    "other".to_string()
}

fn default_tool_status() -> String {
    "pending".to_string()
}

/// Message content block
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Params of a `session/request_permission` call
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_call: PermissionToolCall,
    pub options: Vec<PermissionOption>,
}

/// Tool invocation a permission request is about
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionToolCall {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub raw_input: Map<String, Value>,
}

/// One choice offered by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
}

/// Reply payload for a permission request
pub fn permission_selected(option_id: &str) -> Value {
    serde_json::json!({
        "outcome": {
            "outcome": "selected",
            "optionId": option_id,
        }
    })
}

/// Reply payload when no option is chosen
pub fn permission_cancelled() -> Value {
    serde_json::json!({
        "outcome": {
            "outcome": "cancelled",
        }
    })
}

// =============================================================================
// Bridge → Transport events
// =============================================================================

/// Event published to the subscribers of one conversation.
///
/// Serialized as `{"type": <kind>, "payload": {"conversation_id": ..., ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DomainEvent {
    #[serde(rename = "message_chunk")]
    TextChunk {
        conversation_id: String,
        chunk: String,
    },
    #[serde(rename = "tool_call")]
    ToolCallStarted {
        conversation_id: String,
        tool_call_id: String,
        title: String,
        kind: String,
        status: String,
    },
    #[serde(rename = "tool_call_update")]
    ToolCallUpdated {
        conversation_id: String,
        tool_call_id: String,
        status: String,
    },
    #[serde(rename = "turn_complete")]
    TurnComplete {
        conversation_id: String,
        stop_reason: String,
    },
    #[serde(rename = "permission_request")]
    PermissionRequested {
        conversation_id: String,
        request_id: String,
        tool_call_id: String,
        title: Option<String>,
        raw_input: Map<String, Value>,
        options: Vec<PermissionOption>,
        requested_at: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "permission_cancelled")]
    PermissionCancelled {
        conversation_id: String,
        request_id: String,
        reason: String,
    },
    #[serde(rename = "error")]
    Error {
        conversation_id: String,
        code: String,
        message: String,
    },
}

impl DomainEvent {
    /// Conversation this event belongs to
    pub fn conversation_id(&self) -> &str {
        match self {
            DomainEvent::TextChunk { conversation_id, .. }
            | DomainEvent::ToolCallStarted { conversation_id, .. }
            | DomainEvent::ToolCallUpdated { conversation_id, .. }
            | DomainEvent::TurnComplete { conversation_id, .. }
            | DomainEvent::PermissionRequested { conversation_id, .. }
            | DomainEvent::PermissionCancelled { conversation_id, .. }
            | DomainEvent::Error { conversation_id, .. } => conversation_id,
        }
    }

    /// Error event for a failed operation on a conversation
    pub fn from_error(conversation_id: &str, err: &crate::Error) -> Self {
        DomainEvent::Error {
            conversation_id: conversation_id.to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// =============================================================================
// Transport ↔ Bridge commands
// =============================================================================

/// Command sent by a transport connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportCommand {
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    PermissionResponse {
        request_id: String,
        #[serde(default)]
        option_id: Option<String>,
    },
}

/// Acknowledgement sent back to a transport
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportReply {
    Subscribed { session_id: String },
    Unsubscribed { session_id: String },
    Error { message: String },
}
