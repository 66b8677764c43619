use chatloop::mcp::{
    detect_transport, Confidence, McpClient, McpStatus, McpToolSource, Transport, TransportMode,
};
use chatloop::tools::{register_builtin_tools, ToolDispatcher};
use chatloop::types::{ToolCall, ToolResultState, ToolSource};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rpc_result(id: Value, result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

/// Streamable HTTP server that issues `sess-1` on initialize and demands it afterwards.
async fn mount_streamable_server(server: &MockServer, tools: Value) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "ping"})))
        .respond_with(rpc_result(json!("transport-test"), json!({})))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            rpc_result(
                json!(1),
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "1.0"}
                }),
            )
            .insert_header("mcp-session-id", "sess-1"),
        )
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .and(header("x-session-id", "sess-1"))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;

    let list_body = format!(
        "event: message\ndata: {}\n\n",
        json!({"jsonrpc": "2.0", "id": 2, "result": {"tools": tools}})
    );
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .and(header("mcp-session-id", "sess-1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(list_body, "text/event-stream"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": {"name": "remote_echo", "arguments": {"text": "hi"}}
        })))
        .and(header("session-id", "sess-1"))
        .respond_with(rpc_result(
            json!(3),
            json!({"content": [{"type": "text", "text": "echo:"}, {"type": "text", "text": "hi"}]}),
        ))
        .mount(server)
        .await;
}

fn echo_tools() -> Value {
    json!([
        {
            "name": "remote_echo",
            "description": "Echo text back",
            "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
        },
        {"name": "add_numbers", "description": "Remote adder"}
    ])
}

#[tokio::test]
async fn test_streamable_handshake_lists_tools_and_proxies_calls() {
    let server = MockServer::start().await;
    mount_streamable_server(&server, echo_tools()).await;

    let client = McpClient::new(format!("{}/mcp", server.uri()), TransportMode::Auto);
    let tools = client.connect().await.expect("connect");

    assert_eq!(client.transport(), Some(Transport::StreamableHttp));
    assert_eq!(client.session_id().as_deref(), Some("sess-1"));
    assert!(client.is_connected());
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].name(), "remote_echo");
    assert_eq!(tools[0].source, ToolSource::Remote);

    let output = client
        .call_tool("remote_echo", json!({"text": "hi"}))
        .await
        .expect("call");
    assert_eq!(output, json!("echo: hi"));

    client.disconnect();
    assert!(!client.is_connected());
    assert!(client.session_id().is_none());
    assert!(client.tools().is_empty());
}

#[tokio::test]
async fn test_initialize_request_carries_no_session_headers() {
    let server = MockServer::start().await;
    mount_streamable_server(&server, echo_tools()).await;

    let client = McpClient::new(format!("{}/mcp", server.uri()), TransportMode::StreamableHttp);
    client.connect().await.expect("connect");

    let requests = server.received_requests().await.expect("recording enabled");
    let init = requests
        .iter()
        .find(|request| {
            serde_json::from_slice::<Value>(&request.body)
                .map(|body| body["method"] == "initialize")
                .unwrap_or(false)
        })
        .expect("initialize sent");
    assert!(init.headers.get("x-session-id").is_none());

    let body: Value = serde_json::from_slice(&init.body).unwrap();
    assert_eq!(body["params"]["protocolVersion"], "2024-11-05");
    assert_eq!(body["params"]["clientInfo"]["name"], "chatloop");
    // A fixed transport skips the ping probe.
    assert!(requests.iter().all(|request| {
        serde_json::from_slice::<Value>(&request.body)
            .map(|body| body["method"] != "ping")
            .unwrap_or(true)
    }));
}

#[tokio::test]
async fn test_sse_suffix_selects_legacy_without_probing() {
    let server = MockServer::start().await;
    let http = reqwest::Client::new();

    let probe = detect_transport(&http, &format!("{}/sse", server.uri()))
        .await
        .expect("detect");

    assert_eq!(probe.transport, Transport::SseLegacy);
    assert_eq!(probe.confidence, Confidence::Assumed);
    assert!(server
        .received_requests()
        .await
        .expect("recording enabled")
        .is_empty());
}

#[tokio::test]
async fn test_legacy_candidate_beats_inferred_streamable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Bad Request: Missing session ID"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("event: endpoint\ndata: /messages\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let http = reqwest::Client::new();
    let probe = detect_transport(&http, &format!("{}/mcp", server.uri()))
        .await
        .expect("detect");

    assert_eq!(probe.transport, Transport::SseLegacy);
    assert_eq!(probe.confidence, Confidence::Confirmed);
    assert_eq!(probe.url, format!("{}/sse", server.uri()));
}

#[tokio::test]
async fn test_session_error_infers_streamable_when_no_legacy_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "missing session id"})))
        .mount(&server)
        .await;

    let http = reqwest::Client::new();
    let probe = detect_transport(&http, &format!("{}/mcp", server.uri()))
        .await
        .expect("detect");

    assert_eq!(probe.transport, Transport::StreamableHttp);
    assert_eq!(probe.confidence, Confidence::Inferred);
}

#[tokio::test]
async fn test_no_transport_is_a_connection_error() {
    let server = MockServer::start().await;
    let http = reqwest::Client::new();

    let error = detect_transport(&http, &format!("{}/mcp", server.uri()))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("No supported MCP transport"));
}

#[tokio::test]
async fn test_tool_source_merges_remote_tools_with_local_precedence() {
    let server = MockServer::start().await;
    mount_streamable_server(&server, echo_tools()).await;

    let dispatcher = Arc::new(ToolDispatcher::new(Duration::from_secs(5)));
    register_builtin_tools(&dispatcher).unwrap();
    let mut source = McpToolSource::new(Arc::clone(&dispatcher), TransportMode::Auto);

    let status = source
        .set_url(Some(&format!("{}/mcp", server.uri())))
        .await
        .clone();
    assert_eq!(
        status,
        McpStatus::Connected {
            transport: Transport::StreamableHttp,
            tools: 2
        }
    );

    let definitions = dispatcher.definitions();
    assert_eq!(definitions.len(), 4);
    let adder = definitions
        .iter()
        .find(|d| d.name() == "add_numbers")
        .unwrap();
    assert_eq!(adder.source, ToolSource::Local);

    let results = dispatcher
        .execute(&[
            ToolCall::new(0, "call_r", "remote_echo", r#"{"text":"hi"}"#),
            ToolCall::new(1, "call_l", "add_numbers", r#"{"a":2,"b":3}"#),
        ])
        .await;
    assert_eq!(results[0].state, ToolResultState::OutputAvailable);
    assert_eq!(results[0].output, Some(json!("echo: hi")));
    assert_eq!(results[1].output.as_ref().unwrap()["result"], json!(5));

    source.set_url(None).await;
    assert_eq!(source.status(), &McpStatus::Disconnected);
    assert_eq!(dispatcher.definitions().len(), 3);
}

#[tokio::test]
async fn test_tool_source_failure_yields_zero_remote_tools() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let dispatcher = Arc::new(ToolDispatcher::new(Duration::from_secs(5)));
    let mut source = McpToolSource::new(Arc::clone(&dispatcher), TransportMode::StreamableHttp);
    let status = source
        .set_url(Some(&format!("{}/mcp", server.uri())))
        .await
        .clone();

    match status {
        McpStatus::Error(message) => assert!(message.contains("HTTP 500")),
        other => panic!("unexpected status: {other:?}"),
    }
    assert!(dispatcher.definitions().is_empty());
    assert!(source.client().is_none());
}

#[tokio::test]
async fn test_unresponsive_streamable_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(rpc_result(json!(1), json!({})).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let client = McpClient::new(format!("{}/mcp", server.uri()), TransportMode::StreamableHttp)
        .with_timeouts(Duration::from_millis(300), Duration::from_millis(300));
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect must give up on its own");

    let error = outcome.unwrap_err();
    assert!(error.to_string().contains("Request timeout for initialize"), "{error}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_unresponsive_legacy_stream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("event: endpoint\ndata: /messages\n\n", "text/event-stream")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let client = McpClient::new(format!("{}/sse", server.uri()), TransportMode::SseLegacy)
        .with_timeouts(Duration::from_millis(300), Duration::from_millis(300));
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect must give up on its own");

    let error = outcome.unwrap_err();
    assert!(error.to_string().contains("Timeout connecting to SSE stream"), "{error}");
    assert!(client.tools().is_empty());
}

/// One POST the legacy server received: path, `x-session-id` header and JSON-RPC method.
#[derive(Debug, Clone)]
struct LegacyPost {
    path: String,
    session_header: Option<String>,
    method: String,
}

#[derive(Default)]
struct LegacyServerState {
    stream_tx: Option<mpsc::UnboundedSender<String>>,
    posts: Vec<LegacyPost>,
}

struct RawRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawRequest {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Option<RawRequest> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.ok()? == 0 {
        return None;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await.ok()?;
    Some(RawRequest {
        method,
        path,
        headers,
        body,
    })
}

fn legacy_reply(id: &Value, method: &str, params: &Value) -> Option<Value> {
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "legacy", "version": "1.0"}
        }),
        "tools/list" => json!({"tools": echo_tools()}),
        "tools/call" => json!({"content": [
            {"type": "text", "text": "echo:"},
            {"type": "text", "text": params["arguments"]["text"].as_str().unwrap_or_default()}
        ]}),
        _ => return None,
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

/// Serves `GET /sse` as a held-open event stream announcing a relative
/// `/messages` endpoint, and answers each POST over that stream.
async fn spawn_legacy_server() -> (String, Arc<Mutex<LegacyServerState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let state = Arc::new(Mutex::new(LegacyServerState::default()));
    let server_state = Arc::clone(&state);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let state = Arc::clone(&server_state);
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut reader = BufReader::new(read);
                while let Some(request) = read_request(&mut reader).await {
                    if request.method == "GET" && request.path == "/sse" {
                        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                        state.lock().unwrap().stream_tx = Some(tx);
                        let head = concat!(
                            "HTTP/1.1 200 OK\r\n",
                            "Content-Type: text/event-stream\r\n",
                            "Cache-Control: no-cache\r\n",
                            "mcp-session-id: legacy-1\r\n",
                            "\r\n",
                            "event: endpoint\ndata: /messages?session_id=abc\n\n",
                        );
                        if write.write_all(head.as_bytes()).await.is_err() {
                            return;
                        }
                        while let Some(event) = rx.recv().await {
                            if write.write_all(event.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }

                    let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
                    let method = body["method"].as_str().unwrap_or_default().to_string();
                    let reply = legacy_reply(&body["id"], &method, &body["params"]);
                    let stream_tx = {
                        let mut state = state.lock().unwrap();
                        state.posts.push(LegacyPost {
                            path: request.path.clone(),
                            session_header: request.header("x-session-id"),
                            method,
                        });
                        state.stream_tx.clone()
                    };
                    if write
                        .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n")
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if let (Some(reply), Some(tx)) = (reply, stream_tx) {
                        let _ = tx.send(format!("event: message\ndata: {reply}\n\n"));
                    }
                }
            });
        }
    });

    (format!("http://{address}/sse"), state)
}

#[tokio::test]
async fn test_legacy_handshake_routes_replies_over_event_stream() {
    let (url, state) = spawn_legacy_server().await;

    let client = McpClient::new(url, TransportMode::Auto);
    let tools = tokio::time::timeout(Duration::from_secs(10), client.connect())
        .await
        .expect("handshake finishes")
        .expect("connect");

    assert_eq!(client.transport(), Some(Transport::SseLegacy));
    assert_eq!(client.session_id().as_deref(), Some("legacy-1"));
    let names: Vec<&str> = tools.iter().map(|tool| tool.name()).collect();
    assert_eq!(names, vec!["remote_echo", "add_numbers"]);

    let output = client
        .call_tool("remote_echo", json!({"text": "hi"}))
        .await
        .expect("call");
    assert_eq!(output, json!("echo: hi"));

    let posts = state.lock().unwrap().posts.clone();
    let methods: Vec<&str> = posts.iter().map(|post| post.method.as_str()).collect();
    assert_eq!(
        methods,
        vec!["initialize", "notifications/initialized", "tools/list", "tools/call"]
    );
    assert!(posts.iter().all(|post| post.path == "/messages?session_id=abc"));
    assert_eq!(posts[0].session_header, None);
    assert!(posts[1..]
        .iter()
        .all(|post| post.session_header.as_deref() == Some("legacy-1")));

    client.disconnect();
    assert!(!client.is_connected());
    assert!(client.session_id().is_none());
}
