use super::logging::{debug_payload_enabled, emit_debug_payload};
use super::stream::CompletionStream;
use crate::config::Config;
use crate::types::{
    ApiMessage, CompletionRequest, CompletionResponse, ToolCall, ToolChoice, ToolDefinition,
};
use crate::util::{is_local_endpoint_url, preview};
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
#[cfg(test)]
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[cfg(test)]
pub trait MockStreamProducer: Send + Sync {
    fn create_mock_stream(&self, params: &CompletionParams) -> Result<ByteStream>;

    fn create_mock_completion(&self, _params: &CompletionParams) -> Result<Completion> {
        Err(anyhow!("mock: no non-streaming response configured"))
    }

    fn mock_models(&self) -> Result<Vec<String>> {
        Err(anyhow!("mock: no model list configured"))
    }
}

/// Everything one completion request needs, independent of streaming mode.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub parallel_tool_calls: bool,
}

impl CompletionParams {
    pub fn new(model: impl Into<String>, messages: Vec<ApiMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            parallel_tool_calls: true,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    fn to_request(&self, stream: bool) -> CompletionRequest<'_> {
        // Tool options are only meaningful when tools are offered.
        let has_tools = !self.tools.is_empty();
        CompletionRequest {
            model: &self.model,
            messages: &self.messages,
            stream,
            tools: has_tools.then_some(self.tools.as_slice()),
            tool_choice: has_tools.then_some(self.tool_choice),
            parallel_tool_calls: has_tools.then_some(self.parallel_tool_calls),
        }
    }
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
    app_title: String,
    app_referer: Option<String>,
    stream_update_every: usize,
    #[cfg(test)]
    mock_stream_producer: Option<Arc<dyn MockStreamProducer>>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            app_title: config.app_title.clone(),
            app_referer: config.app_referer.clone(),
            stream_update_every: config.stream_update_every.max(1),
            #[cfg(test)]
            mock_stream_producer: None,
        })
    }

    #[cfg(test)]
    pub fn new_mock(mock_producer: Arc<dyn MockStreamProducer>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: Some("mock-key".to_string()),
            api_url: "http://localhost:8000/v1".to_string(),
            app_title: crate::config::DEFAULT_APP_TITLE.to_string(),
            app_referer: None,
            stream_update_every: 1,
            mock_stream_producer: Some(mock_producer),
        }
    }

    #[cfg(test)]
    pub fn without_api_key(mut self) -> Self {
        self.api_key = None;
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.trim().is_empty())
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Open a streamed completion. The returned stream stops early when
    /// `cancel` fires.
    pub async fn create_stream(
        &self,
        params: &CompletionParams,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        #[cfg(test)]
        {
            if let Some(producer) = &self.mock_stream_producer {
                let bytes = producer.create_mock_stream(params)?;
                return Ok(CompletionStream::new(bytes, self.stream_update_every, cancel));
            }
        }

        let request_url = self.completions_url();
        let payload = serde_json::to_value(params.to_request(true))?;
        if debug_payload_enabled() {
            emit_debug_payload(&request_url, &payload);
        }
        tracing::debug!(
            model = %params.model,
            messages = params.messages.len(),
            tools = params.tools.len(),
            "opening completion stream"
        );

        let request = async {
            let response = self
                .post(&request_url)
                .json(&payload)
                .send()
                .await
                .map_err(|error| map_api_request_error(error, &request_url))?;
            ensure_success(response, &request_url).await
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("completion request cancelled"),
            result = request => result?,
        };

        let request_url_for_stream = request_url.clone();
        let bytes = response.bytes_stream().map(move |item| {
            item.map_err(|error| map_api_request_error(error, &request_url_for_stream))
        });
        Ok(CompletionStream::new(
            Box::pin(bytes),
            self.stream_update_every,
            cancel,
        ))
    }

    /// Single-shot completion used when streaming fails.
    pub async fn complete(
        &self,
        params: &CompletionParams,
        cancel: CancellationToken,
    ) -> Result<Completion> {
        #[cfg(test)]
        {
            if let Some(producer) = &self.mock_stream_producer {
                return producer.create_mock_completion(params);
            }
        }

        let request_url = self.completions_url();
        let payload = serde_json::to_value(params.to_request(false))?;
        if debug_payload_enabled() {
            emit_debug_payload(&request_url, &payload);
        }

        let request = async {
            let response = self
                .post(&request_url)
                .json(&payload)
                .send()
                .await
                .map_err(|error| map_api_request_error(error, &request_url))?;
            let response = ensure_success(response, &request_url).await?;
            let body: CompletionResponse = response
                .json()
                .await
                .map_err(|error| map_api_request_error(error, &request_url))?;
            Ok::<_, anyhow::Error>(completion_from_response(body))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("completion request cancelled")),
            result = request => result,
        }
    }

    pub(super) fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.with_headers(self.http.get(url))
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.with_headers(self.http.post(url))
            .header("content-type", "application/json")
    }

    fn with_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(api_key) = &self.api_key {
            request = request.header("authorization", format!("Bearer {api_key}"));
        }
        if let Some(referer) = &self.app_referer {
            request = request.header("HTTP-Referer", referer);
        }
        request.header("X-Title", &self.app_title)
    }

    #[cfg(test)]
    pub(super) fn mock_producer(&self) -> Option<&Arc<dyn MockStreamProducer>> {
        self.mock_stream_producer.as_ref()
    }

    fn completions_url(&self) -> String {
        adapt_to_chat_completions_url(&self.api_url)
    }
}

fn completion_from_response(body: CompletionResponse) -> Completion {
    let Some(message) = body.choices.into_iter().next().and_then(|c| c.message) else {
        return Completion::default();
    };

    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, mut call)| {
            call.index = index;
            call
        })
        .filter(ToolCall::is_complete)
        .collect();

    Completion {
        content: message.content.unwrap_or_default(),
        tool_calls,
    }
}

pub(super) async fn ensure_success(
    response: reqwest::Response,
    request_url: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!(
        "API endpoint '{}' returned HTTP {}: {}",
        request_url,
        status,
        preview(body.trim(), 500)
    )
}

pub(super) fn map_api_request_error(error: reqwest::Error, request_url: &str) -> anyhow::Error {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return anyhow!(
            "cannot reach local API endpoint '{}': {}. Start your local server or update CHATLOOP_API_URL.",
            request_url,
            error
        );
    }
    if error.is_connect() {
        return anyhow!("cannot reach API endpoint '{}': {}", request_url, error);
    }
    if error.is_timeout() {
        return anyhow!("API request to '{}' timed out: {}", request_url, error);
    }
    if let Some(status) = error.status() {
        return anyhow!(
            "API endpoint '{}' returned HTTP {}: {}",
            request_url,
            status,
            error
        );
    }
    anyhow!("API request to '{}' failed: {}", request_url, error)
}

fn adapt_to_chat_completions_url(api_url: &str) -> String {
    let normalized = api_url.trim_end_matches('/');
    if normalized.ends_with("/chat/completions") {
        return normalized.to_string();
    }
    format!("{normalized}/chat/completions")
}
