use super::jsonrpc::{session_id_from, JsonRpcResponse, RequestId, EVENT_STREAM};
use crate::util::resolve_against;
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(15);
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type EndpointSender = oneshot::Sender<Result<String, String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Line decoder for `event:`/`data:` framed streams. Each `data:` line is
/// emitted immediately under the most recent `event:` name (default `message`).
#[derive(Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
}

impl EventStreamDecoder {
    pub fn process(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let raw = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 1;
            let line = raw.strip_suffix('\r').unwrap_or(&raw);

            if let Some(name) = line.strip_prefix("event:") {
                self.event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                events.push(SseEvent {
                    event: self.event.take().unwrap_or_else(|| "message".to_string()),
                    data: data.to_string(),
                });
            } else if line.trim().is_empty() {
                self.event = None;
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        events
    }
}

/// A live legacy-transport connection: the background reader owning the GET
/// stream, the announced POST endpoint and the requests awaiting replies.
pub struct LegacySession {
    endpoint: String,
    session_id: Option<String>,
    pending: PendingMap,
    response_timeout: Duration,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl LegacySession {
    /// Open the event stream and wait for its `endpoint` announcement. The
    /// GET and the announcement share one `endpoint_timeout` deadline;
    /// replies are awaited for at most `response_timeout`.
    pub async fn open(
        http: &reqwest::Client,
        server_url: &str,
        endpoint_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        tracing::info!(url = %server_url, "opening legacy event stream");
        let deadline = Instant::now() + endpoint_timeout;
        let request = http
            .get(server_url)
            .header(ACCEPT, EVENT_STREAM)
            .header(CACHE_CONTROL, "no-cache")
            .send();
        let response = tokio::time::timeout_at(deadline, request)
            .await
            .map_err(|_| anyhow!("Timeout connecting to SSE stream at '{server_url}'"))?
            .map_err(|error| anyhow!("SSE connection to '{server_url}' failed: {error}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("SSE connection failed: {status}");
        }

        let session_id = session_id_from(response.headers());
        match &session_id {
            Some(id) => tracing::debug!(session_id = %id, "captured session id from stream headers"),
            None => tracing::debug!("no session id header on event stream"),
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_events(
            response.bytes_stream(),
            Arc::clone(&pending),
            endpoint_tx,
            cancel.clone(),
        ));

        let announced = match tokio::time::timeout_at(deadline, endpoint_rx).await {
            Ok(Ok(Ok(endpoint))) => endpoint,
            Ok(Ok(Err(error))) => {
                cancel.cancel();
                bail!("SSE stream failed before endpoint event: {error}");
            }
            Ok(Err(_)) => {
                cancel.cancel();
                bail!("SSE stream ended before endpoint event");
            }
            Err(_) => {
                cancel.cancel();
                reader.abort();
                bail!("Timeout waiting for SSE \"endpoint\" event");
            }
        };

        let endpoint = resolve_against(server_url, &announced)
            .ok_or_else(|| anyhow!("Invalid SSE endpoint '{announced}'"))?;
        tracing::info!(endpoint = %endpoint, "received message endpoint");

        Ok(Self {
            endpoint,
            session_id,
            pending,
            response_timeout,
            cancel,
            reader,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Register interest in the reply to `id` before the request is posted.
    pub fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        register(&self.pending, id)
    }

    pub fn forget(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    pub async fn wait(&self, id: u64, rx: oneshot::Receiver<JsonRpcResponse>) -> Result<JsonRpcResponse> {
        await_response(&self.pending, id, rx, self.response_timeout).await
    }

    /// Stop reading the stream and fail every waiter. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.reader.abort();
        lock(&self.pending).clear();
    }
}

impl Drop for LegacySession {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn register(pending: &PendingMap, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
    let (tx, rx) = oneshot::channel();
    lock(pending).insert(id, tx);
    rx
}

/// Waits for the reply routed to `id`. The pending entry is always gone when this returns.
async fn await_response(
    pending: &PendingMap,
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    timeout: Duration,
) -> Result<JsonRpcResponse> {
    let outcome = tokio::time::timeout(timeout, rx).await;
    lock(pending).remove(&id);
    match outcome {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => bail!("SSE stream closed before response to request {id}"),
        Err(_) => bail!("SSE response timeout for request {id}"),
    }
}

async fn read_events<S>(
    stream: S,
    pending: PendingMap,
    endpoint_tx: EndpointSender,
    cancel: CancellationToken,
) where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let mut stream = Box::pin(stream);
    let mut decoder = EventStreamDecoder::default();
    let mut endpoint_tx = Some(endpoint_tx);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(chunk)) => {
                for event in decoder.process(&chunk) {
                    dispatch_event(event, &pending, &mut endpoint_tx);
                }
            }
            Some(Err(error)) => {
                tracing::warn!(error = %error, "legacy event stream read failed");
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(Err(error.to_string()));
                }
                break;
            }
            None => {
                tracing::debug!("legacy event stream ended");
                break;
            }
        }
    }

    lock(&pending).clear();
}

fn dispatch_event(event: SseEvent, pending: &PendingMap, endpoint_tx: &mut Option<EndpointSender>) {
    match event.event.as_str() {
        "endpoint" => {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(Ok(event.data.trim().to_string()));
            }
        }
        "message" => {
            let message = match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                Ok(message) => message,
                Err(error) => {
                    tracing::debug!(error = %error, data = %event.data, "unparsable event-stream message");
                    return;
                }
            };
            let Some(RequestId::Number(id)) = message.id else {
                return;
            };
            if let Some(tx) = lock(pending).remove(&id) {
                let _ = tx.send(message);
            }
        }
        other => tracing::debug!(event = %other, "ignoring event-stream event"),
    }
}
