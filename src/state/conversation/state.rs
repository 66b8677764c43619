use crate::api::ApiClient;
use crate::tools::ToolDispatcher;
use crate::types::{Message, ToolCall, ToolResult};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use crate::config::DEFAULT_MAX_TOOL_ROUNDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationStatus {
    #[default]
    Idle,
    Sending,
    Streaming,
    NonStreaming,
    AwaitingTools,
    Error,
}

/// Published to the host while a turn is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    Status(ConversationStatus),
    /// Full accumulated assistant text for the current round.
    ContentDelta(String),
    ToolCallProgress(Vec<ToolCall>),
    ToolCalls(Vec<ToolCall>),
    ToolResults(Vec<ToolResult>),
    Messages(Vec<Message>),
    RoundLimitReached { rounds: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { content: String, rounds: usize },
    /// The loop stopped issuing requests; history is left as it was.
    RoundLimitReached { rounds: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("API key is not configured")]
    MissingCredential,
    #[error("message is empty")]
    EmptyMessage,
    #[error("a message is already being processed")]
    Busy,
    #[error("conversation was cleared while the turn was in flight")]
    Cleared,
    #[error("completion failed: {0}")]
    Completion(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub model: String,
    pub system_prompt: Option<String>,
}

impl SendOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }
}

#[derive(Default)]
pub(super) struct ConversationState {
    pub(super) messages: Vec<Message>,
    pub(super) status: ConversationStatus,
    pub(super) last_error: Option<String>,
    /// Bumped by `clear_messages`; a turn holding an older epoch is abandoned.
    pub(super) epoch: u64,
    pub(super) turn_active: bool,
    pub(super) cancel: Option<CancellationToken>,
}

pub struct ConversationManager {
    pub(super) client: Arc<ApiClient>,
    pub(super) dispatcher: Arc<ToolDispatcher>,
    pub(super) max_tool_rounds: usize,
    pub(super) state: Mutex<ConversationState>,
}

impl ConversationManager {
    pub fn new(client: ApiClient, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            client: Arc::new(client),
            dispatcher,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            state: Mutex::new(ConversationState::default()),
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    pub fn client(&self) -> Arc<ApiClient> {
        Arc::clone(&self.client)
    }

    pub fn dispatcher(&self) -> Arc<ToolDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Copy of the current history, including display-only records.
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock_state().messages.clone()
    }

    pub fn status(&self) -> ConversationStatus {
        self.lock_state().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock_state().turn_active
    }

    /// Drop all history and error state. Any in-flight turn is cancelled and
    /// its late results are discarded.
    pub fn clear_messages(&self) {
        let mut state = self.lock_state();
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.messages.clear();
        state.status = ConversationStatus::Idle;
        state.last_error = None;
        state.turn_active = false;
        state.epoch = state.epoch.wrapping_add(1);
        tracing::debug!(epoch = state.epoch, "conversation cleared");
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, ConversationState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
