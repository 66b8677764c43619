use anyhow::{bail, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SESSION_HEADER: &str = "mcp-session-id";
pub const ACCEPT_JSON_OR_STREAM: &str = "application/json, text/event-stream";
pub const EVENT_STREAM: &str = "text/event-stream";

/// Header names the session token is echoed under for server compatibility.
const SESSION_ECHO_HEADERS: [&str; 3] = ["X-Session-ID", "Session-ID", "MCP-Session-ID"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params: non_empty(params),
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params: non_empty(params),
        }
    }
}

/// Empty parameter objects are omitted from the envelope.
fn non_empty(params: Option<Value>) -> Option<Value> {
    params.filter(|value| match value {
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
        _ => true,
    })
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the `result`, turning a JSON-RPC error into `"{label} error: ..."`.
    pub fn into_result(self, label: &str) -> Result<Value> {
        if let Some(error) = self.error {
            bail!("{label} error: {}", error.message);
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Request headers for one call. The session token is attached to every
/// method except `initialize`.
pub fn build_mcp_headers(session_id: Option<&str>, method: &str, accept: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(accept) {
        headers.insert(ACCEPT, value);
    }

    if method == "initialize" {
        return headers;
    }
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        for name in SESSION_ECHO_HEADERS {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(name, value.clone());
            }
        }
    }
    headers
}

pub fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains(EVENT_STREAM))
}

/// Extract the first JSON payload from a buffered event-stream body.
pub fn parse_event_stream_body(body: &str) -> Result<JsonRpcResponse> {
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        match serde_json::from_str::<JsonRpcResponse>(data) {
            Ok(message) => return Ok(message),
            Err(error) => tracing::debug!(error = %error, line = %line, "skipping event-stream line"),
        }
    }
    bail!("No valid JSON messages found in SSE response")
}
