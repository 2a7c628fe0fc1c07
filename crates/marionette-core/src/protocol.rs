//! JSON-RPC 2.0 frames and the MCP payloads carried inside them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Value of the `jsonrpc` member on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision announced during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names consumed on the peer.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
}

/// Tool names selected through `tools/call`.
pub mod tools {
    pub const CONNECT: &str = "connect";
    pub const TAKE_SCREENSHOTS: &str = "take_screenshots";
    pub const GET_INTERACTIVE_ELEMENTS: &str = "get_interactive_elements";
    pub const TAP: &str = "tap";
}

/// Request identifier. Allocated per session, starting at 1, never reused.
pub type RequestId = u64;

/// An outbound call that expects exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget message. Carries no id and never gets a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    /// Interpret an arbitrary `error` value.
    ///
    /// Peers are supposed to send `{code, message, data?}`, but anything else
    /// is still a failure. Non-conforming values get code 0 and are kept
    /// verbatim in `data`.
    pub fn from_value(value: Value) -> Self {
        if let Ok(err) = serde_json::from_value::<RpcError>(value.clone()) {
            return err;
        }
        let message = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            code: 0,
            message,
            data: Some(value),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// A response frame. Only built locally when answering peer-initiated
/// requests; inbound responses go through [`Incoming::classify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// An inbound frame sorted by what the client has to do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response {
        id: RequestId,
        outcome: Result<Value, RpcError>,
    },
    /// Unsolicited message from the peer.
    Notification(Notification),
    /// The peer is asking us something and expects an answer.
    PeerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Valid JSON that is not a usable JSON-RPC frame.
    Anomaly { reason: &'static str, frame: Value },
}

impl Incoming {
    /// Classify a parsed frame.
    ///
    /// A present `error` member wins over `result`, so a response that
    /// carries both is treated as a failure.
    pub fn classify(frame: Value) -> Self {
        let Some(obj) = frame.as_object() else {
            return Self::Anomaly {
                reason: "frame is not a JSON object",
                frame,
            };
        };

        let method = obj.get("method").and_then(Value::as_str).map(str::to_owned);
        let params = obj.get("params").cloned();
        let id = obj.get("id").cloned();

        match (method, id) {
            (Some(method), None) => Self::Notification(Notification::new(method, params)),
            (Some(method), Some(id)) => Self::PeerRequest { id, method, params },
            (None, Some(id)) => {
                let Some(id) = id.as_u64() else {
                    return Self::Anomaly {
                        reason: "response id is not an unsigned integer",
                        frame,
                    };
                };
                // Some peers send `"error": null` alongside a result.
                if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
                    Self::Response {
                        id,
                        outcome: Err(RpcError::from_value(error.clone())),
                    }
                } else if let Some(result) = obj.get("result") {
                    Self::Response {
                        id,
                        outcome: Ok(result.clone()),
                    }
                } else {
                    Self::Anomaly {
                        reason: "response carries neither result nor error",
                        frame,
                    }
                }
            }
            (None, None) => Self::Anomaly {
                reason: "frame has neither method nor id",
                frame,
            },
        }
    }
}

/// Identity the client announces during `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

impl InitializeParams {
    /// Handshake parameters with the default protocol version and no
    /// client capabilities.
    pub fn new(client_info: ClientInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info,
        }
    }
}

/// Identity reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} {}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Parameters of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Value,
}

impl ToolCallParams {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// One entry of the `tools/list` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolList {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}
