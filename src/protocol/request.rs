use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 id. The protocol allows both numbers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    Str(String),
}

impl RpcId {
    /// Collision-free string key for correlation maps. Tagged so the
    /// numeric id 1 and the string id "1" never alias.
    pub fn key(&self) -> String {
        match self {
            Self::Number(n) => format!("n{n}"),
            Self::Str(s) => format!("s{s}"),
        }
    }
}

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Build a notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    /// Build a correlated request with an explicit id.
    pub fn with_id(id: RpcId, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// MCP `initialize` params.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(rename = "clientInfo")]
    pub client_info: Option<ClientInfo>,
}

/// Client information sent during `initialize`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Request metadata rider; carries the optional progress token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestMeta {
    #[serde(rename = "progressToken")]
    pub progress_token: Option<serde_json::Value>,
}

/// Parameters for `tools/call`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Option<serde_json::Value>,
    #[serde(rename = "_meta", default)]
    pub meta: Option<RequestMeta>,
}

/// Parameters for `resources/read`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
    #[serde(rename = "_meta", default)]
    pub meta: Option<RequestMeta>,
}

/// Parameters for `prompts/get`.
#[derive(Debug, Clone, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    pub arguments: Option<std::collections::BTreeMap<String, String>>,
    #[serde(rename = "_meta", default)]
    pub meta: Option<RequestMeta>,
}

/// Parameters for `notifications/cancelled`.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: RpcId,
    pub reason: Option<String>,
}
