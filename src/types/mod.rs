pub mod api;
pub mod message;

pub use api::{
    ApiMessage, ChunkChoice, ChunkDelta, CompletionRequest, CompletionResponse, FunctionDelta,
    ModelInfo, ModelsResponse, StreamChunk, ToolCallDelta, ToolChoice,
};
pub use message::{
    empty_object_schema, FunctionCall, FunctionDefinition, Message, MessageBody, Role, ToolCall,
    ToolDefinition, ToolExecutionCall, ToolResult, ToolResultState, ToolSource,
};
