pub mod conversation;

pub use conversation::{
    summarize_tool_result, ChatError, ConversationManager, ConversationStatus, ConversationUpdate,
    SendOptions, TurnOutcome, DEFAULT_MAX_TOOL_ROUNDS,
};
