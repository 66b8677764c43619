use super::ToolHandler;
use crate::types::{ToolCall, ToolDefinition, ToolResult};
use anyhow::{bail, Result};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Default)]
struct ToolTables {
    local: Vec<RegisteredTool>,
    remote: Vec<RegisteredTool>,
}

impl ToolTables {
    /// Local handlers win on name collision.
    fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.local
            .iter()
            .chain(self.remote.iter())
            .find(|tool| tool.definition.name() == name)
            .map(|tool| Arc::clone(&tool.handler))
    }
}

/// Resolves tool calls to local or remote handlers and runs each round concurrently.
pub struct ToolDispatcher {
    tables: RwLock<ToolTables>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(ToolTables::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register or replace a local tool. Invalid definitions are refused.
    pub fn register_local(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        validate_tool_definition(&definition)?;
        let mut tables = self.write_tables();
        tables
            .local
            .retain(|tool| tool.definition.name() != definition.name());
        tables.local.push(RegisteredTool {
            definition,
            handler,
        });
        Ok(())
    }

    /// Replace the whole remote table. Definitions that fail validation are
    /// skipped; returns how many were accepted.
    pub fn set_remote_tools(&self, tools: Vec<(ToolDefinition, Arc<dyn ToolHandler>)>) -> usize {
        let accepted: Vec<RegisteredTool> = tools
            .into_iter()
            .filter(|(definition, _)| match validate_tool_definition(definition) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(tool = %definition.name(), error = %error, "skipping invalid remote tool");
                    false
                }
            })
            .map(|(definition, handler)| RegisteredTool {
                definition: definition.remote(),
                handler,
            })
            .collect();
        let count = accepted.len();
        self.write_tables().remote = accepted;
        count
    }

    pub fn clear_remote_tools(&self) {
        self.write_tables().remote.clear();
    }

    /// Definitions advertised to the model: locals, then remotes not shadowed by a local.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tables = self.read_tables();
        let mut definitions: Vec<ToolDefinition> = tables
            .local
            .iter()
            .map(|tool| tool.definition.clone())
            .collect();
        for tool in &tables.remote {
            if !definitions
                .iter()
                .any(|existing| existing.name() == tool.definition.name())
            {
                definitions.push(tool.definition.clone());
            }
        }
        definitions
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.read_tables();
        tables.local.is_empty() && tables.remote.is_empty()
    }

    /// One result per call, in call order. Never fails as a whole.
    pub async fn execute(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let resolved: Vec<(ToolCall, Option<Arc<dyn ToolHandler>>)> = {
            let tables = self.read_tables();
            calls
                .iter()
                .map(|call| (call.clone(), tables.resolve(&call.function.name)))
                .collect()
        };

        let timeout = self.timeout;
        join_all(
            resolved
                .into_iter()
                .map(|(call, handler)| execute_one(call, handler, timeout)),
        )
        .await
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, ToolTables> {
        self.tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, ToolTables> {
        self.tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn parse_arguments(arguments: &str) -> Result<Value, serde_json::Error> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments)
}

async fn execute_one(
    call: ToolCall,
    handler: Option<Arc<dyn ToolHandler>>,
    timeout: Duration,
) -> ToolResult {
    let tool_name = call.function.name.clone();
    let input = match parse_arguments(&call.function.arguments) {
        Ok(input) => input,
        Err(error) => {
            tracing::warn!(tool = %tool_name, error = %error, "tool arguments are not valid JSON");
            return ToolResult::error(
                &call,
                json!({ "_raw": call.function.arguments }),
                format!("Invalid JSON arguments for {tool_name}: {error}"),
            );
        }
    };

    let Some(handler) = handler else {
        tracing::warn!(tool = %tool_name, "no handler registered");
        return ToolResult::error(&call, input, format!("Unknown tool: {tool_name}"));
    };

    tracing::debug!(tool = %tool_name, call_id = %call.id, "dispatching tool call");
    let task_input = input.clone();
    let mut task = tokio::spawn(async move { handler.call(task_input).await });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(output))) => ToolResult::available(&call, input, output),
        Ok(Ok(Err(error))) => {
            tracing::warn!(tool = %tool_name, error = %error, "tool handler failed");
            ToolResult::error(&call, input, error.to_string())
        }
        Ok(Err(join_error)) => {
            tracing::warn!(tool = %tool_name, error = %join_error, "tool task aborted");
            ToolResult::error(
                &call,
                input,
                format!("Tool execution task failed for {tool_name}: {join_error}"),
            )
        }
        Err(_) => {
            task.abort();
            tracing::warn!(tool = %tool_name, "tool handler timed out");
            ToolResult::error(
                &call,
                input,
                format!(
                    "Tool execution timed out after {}s for {tool_name}",
                    timeout.as_secs()
                ),
            )
        }
    }
}

/// Checks the structural contract a definition must meet before it is advertised.
pub fn validate_tool_definition(definition: &ToolDefinition) -> Result<()> {
    if definition.kind != "function" {
        bail!(
            "Tool '{}' has type '{}'; expected 'function'",
            definition.name(),
            definition.kind
        );
    }
    if definition.function.name.trim().is_empty() {
        bail!("Tool definition is missing a name");
    }
    if definition.function.description.trim().is_empty() {
        bail!("Tool '{}' is missing a description", definition.name());
    }
    let parameters = &definition.function.parameters;
    if !parameters.is_object()
        || parameters.get("type").and_then(Value::as_str) != Some("object")
    {
        bail!(
            "Tool '{}' parameters must be an object schema",
            definition.name()
        );
    }
    Ok(())
}

pub fn validate_tool_definitions(definitions: &[ToolDefinition]) -> Result<()> {
    definitions.iter().try_for_each(validate_tool_definition)
}
