use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    ToolExecution,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::ToolExecution => "tool_execution",
        }
    }
}

/// One entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Role-specific payload. Each variant carries exactly the fields its role requires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum MessageBody {
    User {
        content: String,
    },
    System {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        content: String,
        tool_call_id: String,
        tool_name: String,
    },
    /// Display-only pairing of a call with its result; never sent to the model.
    ToolExecution {
        tool_call: ToolExecutionCall,
        tool_result: ToolResult,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolExecutionCall {
    pub name: String,
    pub arguments: Value,
}

impl Message {
    fn with_body(body: MessageBody) -> Self {
        Self {
            id: format!("msg-{}", Uuid::new_v4()),
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::User {
            content: content.into(),
        })
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::System {
            content: content.into(),
        })
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        })
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::with_body(MessageBody::Assistant {
            content: content.into(),
            tool_calls,
        })
    }

    pub fn tool(result: &ToolResult) -> Self {
        Self::with_body(MessageBody::Tool {
            content: result.content_for_model(),
            tool_call_id: result.tool_call_id.clone(),
            tool_name: result.tool_name.clone(),
        })
    }

    /// Display record pairing a call with its result. Arguments are shown as
    /// the dispatcher parsed them.
    pub fn tool_execution(call: &ToolCall, result: &ToolResult) -> Self {
        Self::with_body(MessageBody::ToolExecution {
            tool_call: ToolExecutionCall {
                name: call.function.name.clone(),
                arguments: result.input.clone(),
            },
            tool_result: result.clone(),
        })
    }

    pub fn role(&self) -> Role {
        match &self.body {
            MessageBody::User { .. } => Role::User,
            MessageBody::System { .. } => Role::System,
            MessageBody::Assistant { .. } => Role::Assistant,
            MessageBody::Tool { .. } => Role::Tool,
            MessageBody::ToolExecution { .. } => Role::ToolExecution,
        }
    }

    pub fn content(&self) -> &str {
        match &self.body {
            MessageBody::User { content }
            | MessageBody::System { content }
            | MessageBody::Assistant { content, .. }
            | MessageBody::Tool { content, .. } => content,
            MessageBody::ToolExecution { .. } => "",
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.body {
            MessageBody::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    /// Merge key for streamed fragments; not part of the request wire shape.
    #[serde(default, skip_serializing)]
    pub index: usize,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// JSON-encoded arguments, accumulated incrementally while streaming.
    #[serde(default)]
    pub arguments: String,
}

pub(crate) fn function_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(index: usize, id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            index,
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.function.name.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ToolResultState {
    OutputAvailable,
    OutputError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(rename = "tool_call_id")]
    pub tool_call_id: String,
    pub tool_name: String,
    pub state: ToolResultState,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ToolResult {
    pub fn available(call: &ToolCall, input: Value, output: Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.function.name.clone(),
            state: ToolResultState::OutputAvailable,
            input,
            output: Some(output),
            error_text: None,
        }
    }

    pub fn error(call: &ToolCall, input: Value, error_text: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.function.name.clone(),
            state: ToolResultState::OutputError,
            input,
            output: None,
            error_text: Some(error_text.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.state == ToolResultState::OutputError
    }

    /// Text fed back to the model as the `tool` message content.
    pub fn content_for_model(&self) -> String {
        match (&self.state, &self.output) {
            (ToolResultState::OutputAvailable, Some(Value::String(text))) => text.clone(),
            (ToolResultState::OutputAvailable, Some(value)) => {
                serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
            }
            (ToolResultState::OutputAvailable, None) => "null".to_string(),
            (ToolResultState::OutputError, _) => self
                .error_text
                .clone()
                .unwrap_or_else(|| "Tool execution failed".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolSource {
    #[default]
    Local,
    Remote,
}

/// Contract advertised to the model for one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionDefinition,
    #[serde(skip)]
    pub source: ToolSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

pub fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {}, "required": [] })
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: function_kind(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            source: ToolSource::Local,
        }
    }

    pub fn remote(mut self) -> Self {
        self.source = ToolSource::Remote;
        self
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}
