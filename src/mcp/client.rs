use super::jsonrpc::{
    build_mcp_headers, is_event_stream, parse_event_stream_body, session_id_from, JsonRpcRequest,
    JsonRpcResponse, RequestId, ACCEPT_JSON_OR_STREAM, PROTOCOL_VERSION,
};
use super::sse::{LegacySession, ENDPOINT_TIMEOUT, RESPONSE_TIMEOUT};
use super::transport::detect_transport;
use super::{Transport, TransportMode};
use crate::tools::validate_tool_definition;
use crate::types::{empty_object_schema, ToolDefinition};
use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const CLIENT_NAME: &str = "chatloop";

#[derive(Default)]
struct SessionState {
    server_url: String,
    transport: Option<Transport>,
    session_id: Option<String>,
    legacy: Option<Arc<LegacySession>>,
    tools: Vec<ToolDefinition>,
    connected: bool,
}

/// Client for one remote tool server. All methods take `&self` so tool calls
/// from one dispatch round can run concurrently.
pub struct McpClient {
    http: reqwest::Client,
    mode: TransportMode,
    endpoint_timeout: Duration,
    request_timeout: Duration,
    next_id: AtomicU64,
    state: Mutex<SessionState>,
}

impl McpClient {
    pub fn new(server_url: impl Into<String>, mode: TransportMode) -> Self {
        Self {
            http: reqwest::Client::new(),
            mode,
            endpoint_timeout: ENDPOINT_TIMEOUT,
            request_timeout: RESPONSE_TIMEOUT,
            next_id: AtomicU64::new(1),
            state: Mutex::new(SessionState {
                server_url: server_url.into().trim().to_string(),
                ..SessionState::default()
            }),
        }
    }

    /// Override the endpoint discovery and request round-trip bounds.
    pub fn with_timeouts(mut self, endpoint: Duration, request: Duration) -> Self {
        self.endpoint_timeout = endpoint;
        self.request_timeout = request;
        self
    }

    pub fn server_url(&self) -> String {
        self.state().server_url.clone()
    }

    pub fn transport(&self) -> Option<Transport> {
        self.state().transport
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.state().tools.clone()
    }

    /// Negotiate the transport, run the handshake and list tools. On failure
    /// every piece of session state is torn down again.
    pub async fn connect(&self) -> Result<Vec<ToolDefinition>> {
        match self.handshake().await {
            Ok(tools) => Ok(tools),
            Err(error) => {
                tracing::warn!(url = %self.server_url(), error = %error, "remote tool server connection failed");
                self.disconnect();
                Err(error)
            }
        }
    }

    async fn handshake(&self) -> Result<Vec<ToolDefinition>> {
        let configured_url = self.server_url();
        tracing::info!(url = %configured_url, mode = ?self.mode, "connecting to remote tool server");

        let transport = match self.mode.fixed() {
            Some(transport) => transport,
            None => {
                let probe = detect_transport(&self.http, &configured_url).await?;
                tracing::info!(
                    transport = %probe.transport,
                    confidence = ?probe.confidence,
                    url = %probe.url,
                    "transport negotiated"
                );
                if probe.url != configured_url {
                    self.state().server_url = probe.url.clone();
                }
                probe.transport
            }
        };
        self.state().transport = Some(transport);

        if transport == Transport::SseLegacy {
            let session = LegacySession::open(
                &self.http,
                &self.server_url(),
                self.endpoint_timeout,
                self.request_timeout,
            )
            .await?;
            let mut state = self.state();
            if let Some(id) = session.session_id() {
                state.session_id = Some(id.to_string());
            }
            state.legacy = Some(Arc::new(session));
        }

        let init = self
            .send_request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") }
                })),
            )
            .await?
            .into_result("Initialize")?;
        if let Some(session_id) = init.get("sessionId").and_then(Value::as_str) {
            tracing::debug!(session_id = %session_id, "session id assigned by initialize");
            self.state().session_id = Some(session_id.to_string());
        }
        tracing::debug!("initialize complete");

        self.send_notification("notifications/initialized", None)
            .await?;

        let listed = self
            .send_request("tools/list", None)
            .await?
            .into_result("Tools list")?;
        let tools = parse_tool_list(&listed)?;
        tracing::info!(tools = tools.len(), transport = %transport, "remote tool server connected");

        let mut state = self.state();
        state.tools = tools.clone();
        state.connected = true;
        Ok(tools)
    }

    /// Invoke a remote tool and coalesce its content into one string.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if !self.is_connected() {
            bail!("Not connected to MCP server");
        }
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        let result = self
            .send_request("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await?
            .into_result("Tool call")?;
        Ok(Value::String(coalesce_content(result.get("content"))))
    }

    /// Abort the stream, fail pending requests, drop the session and tools. Idempotent.
    pub fn disconnect(&self) {
        let mut state = self.state();
        if let Some(legacy) = state.legacy.take() {
            legacy.close();
        }
        let was_connected = state.connected;
        state.session_id = None;
        state.tools.clear();
        state.connected = false;
        if was_connected {
            tracing::info!(url = %state.server_url, "remote tool server disconnected");
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_request_id();
        let envelope = JsonRpcRequest::request(RequestId::Number(id), method, params);
        let (transport, session_id, legacy) = {
            let state = self.state();
            (state.transport, state.session_id.clone(), state.legacy.clone())
        };
        tracing::debug!(method = %method, id, "sending remote request");

        match transport {
            Some(Transport::SseLegacy) => {
                let legacy =
                    legacy.ok_or_else(|| anyhow!("SSE Legacy: No message endpoint available"))?;
                let rx = legacy.register(id);
                let posted = self
                    .bounded(
                        method,
                        self.post(
                            legacy.endpoint(),
                            &envelope,
                            session_id.as_deref(),
                            method,
                            "application/json",
                        ),
                    )
                    .await;
                if let Err(error) = posted {
                    legacy.forget(id);
                    return Err(error);
                }
                legacy.wait(id, rx).await
            }
            Some(Transport::StreamableHttp) => {
                let url = self.server_url();
                self.bounded(method, async {
                    let response = self
                        .post(&url, &envelope, session_id.as_deref(), method, ACCEPT_JSON_OR_STREAM)
                        .await?;
                    self.capture_session_id(response.headers());
                    read_rpc_response(response).await
                })
                .await
            }
            None => bail!("Transport not negotiated; call connect first"),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let envelope = JsonRpcRequest::notification(method, params);
        let (transport, session_id, legacy, url) = {
            let state = self.state();
            (
                state.transport,
                state.session_id.clone(),
                state.legacy.clone(),
                state.server_url.clone(),
            )
        };

        match transport {
            Some(Transport::SseLegacy) => {
                let legacy =
                    legacy.ok_or_else(|| anyhow!("SSE Legacy: No message endpoint available"))?;
                self.bounded(
                    method,
                    self.post(
                        legacy.endpoint(),
                        &envelope,
                        session_id.as_deref(),
                        method,
                        "application/json",
                    ),
                )
                .await?;
            }
            Some(Transport::StreamableHttp) => {
                self.bounded(
                    method,
                    self.post(&url, &envelope, session_id.as_deref(), method, ACCEPT_JSON_OR_STREAM),
                )
                .await?;
            }
            None => bail!("Transport not negotiated; call connect first"),
        }
        Ok(())
    }

    async fn bounded<T>(&self, method: &str, request: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| anyhow!("Request timeout for {method} after {:?}", self.request_timeout))?
    }

    async fn post(
        &self,
        url: &str,
        envelope: &JsonRpcRequest,
        session_id: Option<&str>,
        method: &str,
        accept: &str,
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .headers(build_mcp_headers(session_id, method, accept))
            .json(envelope)
            .send()
            .await
            .map_err(|error| anyhow!("Network error posting {method} to '{url}': {error}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("HTTP {}: {}", status.as_u16(), body.trim());
        }
        Ok(response)
    }

    fn capture_session_id(&self, headers: &reqwest::header::HeaderMap) {
        let Some(session_id) = session_id_from(headers) else {
            return;
        };
        let mut state = self.state();
        if state.session_id.as_deref() != Some(session_id.as_str()) {
            tracing::debug!(session_id = %session_id, "captured session id");
            state.session_id = Some(session_id);
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn read_rpc_response(response: reqwest::Response) -> Result<JsonRpcResponse> {
    if is_event_stream(response.headers()) {
        let body = response.text().await.context("Failed to read event-stream reply")?;
        return parse_event_stream_body(&body);
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if content_type.contains("application/json") {
        return response
            .json::<JsonRpcResponse>()
            .await
            .context("Failed to decode JSON-RPC reply");
    }
    bail!("Unexpected content type: {content_type}")
}

/// Translate a `tools/list` result into remote-tagged definitions. A missing
/// schema becomes the empty object schema; tools that still fail validation
/// are dropped.
pub fn parse_tool_list(result: &Value) -> Result<Vec<ToolDefinition>> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .context("Tools list error: result has no tools array")?;

    Ok(tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(Value::as_str)?;
            let description = tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let parameters = tool
                .get("inputSchema")
                .filter(|schema| schema.is_object())
                .cloned()
                .unwrap_or_else(empty_object_schema);
            let definition = ToolDefinition::function(name, description, parameters).remote();
            match validate_tool_definition(&definition) {
                Ok(()) => Some(definition),
                Err(error) => {
                    tracing::warn!(tool = %name, error = %error, "dropping invalid remote tool");
                    None
                }
            }
        })
        .collect())
}

/// Join content items as `text`, else `content`, else their JSON, separated by spaces.
pub fn coalesce_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                if let Some(text) = item.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()) {
                    return text.to_string();
                }
                match item.get("content") {
                    Some(Value::String(text)) if !text.is_empty() => text.clone(),
                    Some(value) if is_truthy(value) => value.to_string(),
                    _ => item.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolSource;

    #[test]
    fn test_tool_list_defaults_missing_schema_and_drops_invalid_tools() {
        let result = json!({"tools": [
            {"name": "multiply_numbers", "description": "Multiply", "inputSchema": {"type": "object", "properties": {"a": {"type": "number"}}}},
            {"name": "schemaless", "description": "No schema"},
            {"name": "bare"},
            {"name": "listy", "description": "Array schema", "inputSchema": {"type": "array"}},
            {"description": "nameless"}
        ]});
        let tools = parse_tool_list(&result).unwrap();
        let names: Vec<&str> = tools.iter().map(|tool| tool.name()).collect();
        assert_eq!(names, vec!["multiply_numbers", "schemaless"]);
        assert_eq!(tools[0].source, ToolSource::Remote);
        assert_eq!(tools[1].function.parameters, empty_object_schema());
        assert!(parse_tool_list(&json!({})).is_err());
    }

    #[test]
    fn test_content_items_are_coalesced() {
        let content = json!([
            {"type": "text", "text": "6.0"},
            {"type": "resource", "content": "inline"},
            {"data": "abc"}
        ]);
        assert_eq!(
            coalesce_content(Some(&content)),
            r#"6.0 inline {"data":"abc"}"#
        );
        assert_eq!(coalesce_content(Some(&json!({"a": 1}))), r#"{"a":1}"#);
        assert_eq!(coalesce_content(None), "");
    }

    #[tokio::test]
    async fn test_call_tool_requires_connection() {
        let client = McpClient::new("http://127.0.0.1:9/mcp", TransportMode::StreamableHttp);
        let error = client.call_tool("x", Value::Null).await.unwrap_err();
        assert_eq!(error.to_string(), "Not connected to MCP server");
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
    }
}
