use crate::api::client::{ByteStream, Completion, CompletionParams, MockStreamProducer};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted reply. Streaming and non-streaming calls consume the same queue.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// `data:` payloads delivered in order, then end-of-body.
    Stream(Vec<String>),
    /// Payloads followed by a transport error mid-stream.
    StreamError(Vec<String>, String),
    /// Payloads followed by a body that never ends.
    Hang(Vec<String>),
    /// The request itself fails.
    RequestError(String),
    /// Non-streaming reply.
    Completion(Completion),
}

#[derive(Clone)]
pub struct MockApiClient {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<CompletionParams>>>,
    models: Option<Vec<String>>,
}

impl MockApiClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
            models: None,
        }
    }

    /// Shorthand for a queue of plain streamed replies.
    pub fn streams(responses: Vec<Vec<String>>) -> Self {
        Self::new(responses.into_iter().map(MockResponse::Stream).collect())
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = Some(models);
        self
    }

    /// Every request received so far, streaming or not.
    pub fn requests(&self) -> Vec<CompletionParams> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self, params: &CompletionParams) -> Result<MockResponse> {
        self.requests.lock().unwrap().push(params.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("MockApiClient: No more responses configured"))
    }
}

fn framed(chunks: Vec<String>) -> Vec<Result<Bytes>> {
    chunks
        .into_iter()
        .map(|s| {
            let framed = if s.starts_with("data:") || s.starts_with(':') {
                s
            } else {
                format!("data: {s}")
            };
            let framed = if framed.ends_with("\n\n") {
                framed
            } else {
                format!("{framed}\n\n")
            };
            Ok(Bytes::from(framed))
        })
        .collect()
}

impl MockStreamProducer for MockApiClient {
    fn create_mock_stream(&self, params: &CompletionParams) -> Result<ByteStream> {
        match self.next_response(params)? {
            MockResponse::Stream(chunks) => Ok(Box::pin(stream::iter(framed(chunks)))),
            MockResponse::StreamError(chunks, error) => {
                let mut items = framed(chunks);
                items.push(Err(anyhow!(error)));
                Ok(Box::pin(stream::iter(items)))
            }
            MockResponse::Hang(chunks) => Ok(Box::pin(
                stream::iter(framed(chunks)).chain(stream::pending()),
            )),
            MockResponse::RequestError(error) => Err(anyhow!(error)),
            MockResponse::Completion(_) => Err(anyhow!(
                "MockApiClient: streaming request received a non-streaming response"
            )),
        }
    }

    fn create_mock_completion(&self, params: &CompletionParams) -> Result<Completion> {
        match self.next_response(params)? {
            MockResponse::Completion(completion) => Ok(completion),
            MockResponse::RequestError(error) => Err(anyhow!(error)),
            other => Err(anyhow!(
                "MockApiClient: non-streaming request received {other:?}"
            )),
        }
    }

    fn mock_models(&self) -> Result<Vec<String>> {
        self.models
            .clone()
            .ok_or_else(|| anyhow!("MockApiClient: models endpoint unavailable"))
    }
}
