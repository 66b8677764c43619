mod core;
mod history;
mod state;
mod streaming;
mod tools;


pub use state::{
    ChatError, ConversationManager, ConversationStatus, ConversationUpdate, SendOptions,
    TurnOutcome, DEFAULT_MAX_TOOL_ROUNDS,
};
pub use tools::summarize_tool_result;

#[cfg(test)]
use history::*;
