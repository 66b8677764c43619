use super::{McpClient, Transport, TransportMode};
use crate::tools::{ToolDispatcher, ToolHandler};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpStatus {
    Disconnected,
    Connected { transport: Transport, tools: usize },
    Error(String),
}

struct RemoteToolHandler {
    client: Arc<McpClient>,
    name: String,
}

#[async_trait]
impl ToolHandler for RemoteToolHandler {
    async fn call(&self, arguments: Value) -> Result<Value> {
        self.client.call_tool(&self.name, arguments).await
    }
}

/// Owns at most one remote tool client and keeps the dispatcher's remote
/// table in step with it.
pub struct McpToolSource {
    dispatcher: Arc<ToolDispatcher>,
    mode: TransportMode,
    client: Option<Arc<McpClient>>,
    status: McpStatus,
}

impl McpToolSource {
    pub fn new(dispatcher: Arc<ToolDispatcher>, mode: TransportMode) -> Self {
        Self {
            dispatcher,
            mode,
            client: None,
            status: McpStatus::Disconnected,
        }
    }

    pub fn status(&self) -> &McpStatus {
        &self.status
    }

    pub fn client(&self) -> Option<&Arc<McpClient>> {
        self.client.as_ref()
    }

    /// Point the source at a new server (or none). The previous client is
    /// always disconnected first; a failed connection leaves zero remote tools.
    pub async fn set_url(&mut self, url: Option<&str>) -> &McpStatus {
        self.disconnect();

        let Some(url) = url.map(str::trim).filter(|url| !url.is_empty()) else {
            return &self.status;
        };

        let client = Arc::new(McpClient::new(url, self.mode));
        match client.connect().await {
            Ok(tools) => {
                let handlers: Vec<(_, Arc<dyn ToolHandler>)> = tools
                    .into_iter()
                    .map(|definition| {
                        let handler: Arc<dyn ToolHandler> = Arc::new(RemoteToolHandler {
                            client: Arc::clone(&client),
                            name: definition.name().to_string(),
                        });
                        (definition, handler)
                    })
                    .collect();
                let count = self.dispatcher.set_remote_tools(handlers);
                self.status = McpStatus::Connected {
                    transport: client.transport().unwrap_or(Transport::StreamableHttp),
                    tools: count,
                };
                self.client = Some(client);
            }
            Err(error) => {
                self.status = McpStatus::Error(error.to_string());
            }
        }
        &self.status
    }

    pub fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            client.disconnect();
        }
        self.dispatcher.clear_remote_tools();
        self.status = McpStatus::Disconnected;
    }
}

impl Drop for McpToolSource {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            client.disconnect();
        }
    }
}
