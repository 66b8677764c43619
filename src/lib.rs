pub mod api;
pub mod app;
pub mod config;
pub mod mcp;
pub mod state;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(test)]
pub mod test_support;

pub use app::App;
pub use config::Config;
pub use state::{ChatError, ConversationManager, ConversationUpdate, SendOptions, TurnOutcome};
