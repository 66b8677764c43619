use super::state::{ConversationState, ConversationStatus};
use super::{ChatError, ConversationManager};
use crate::types::{ApiMessage, Message, MessageBody, ToolCall};

/// Request history for the completion endpoint. Display-only records and
/// empty assistant placeholders are left out; the system prompt goes first.
pub(super) fn build_api_history(messages: &[Message], system_prompt: Option<&str>) -> Vec<ApiMessage> {
    let mut history = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        history.push(ApiMessage::text("system", prompt));
    }

    for message in messages {
        match &message.body {
            MessageBody::User { content } => history.push(ApiMessage::text("user", content.as_str())),
            MessageBody::System { content } => {
                history.push(ApiMessage::text("system", content.as_str()))
            }
            MessageBody::Assistant {
                content,
                tool_calls,
            } => {
                if content.is_empty() && tool_calls.is_empty() {
                    continue;
                }
                history.push(ApiMessage {
                    role: "assistant".to_string(),
                    content: content.clone(),
                    tool_calls: (!tool_calls.is_empty()).then(|| tool_calls.clone()),
                    tool_call_id: None,
                });
            }
            MessageBody::Tool {
                content,
                tool_call_id,
                ..
            } => history.push(ApiMessage {
                role: "tool".to_string(),
                content: content.clone(),
                tool_calls: None,
                tool_call_id: Some(tool_call_id.clone()),
            }),
            MessageBody::ToolExecution { .. } => {}
        }
    }
    history
}

impl ConversationManager {
    /// Run `apply` against the state if the turn started at `epoch` is still current.
    pub(super) fn with_turn<T>(
        &self,
        epoch: u64,
        apply: impl FnOnce(&mut ConversationState) -> T,
    ) -> Result<T, ChatError> {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return Err(ChatError::Cleared);
        }
        Ok(apply(&mut state))
    }

    /// Replace the trailing assistant placeholder's text.
    pub(super) fn set_placeholder_content(&self, epoch: u64, content: &str) -> Result<(), ChatError> {
        self.with_turn(epoch, |state| {
            if let Some(Message {
                body: MessageBody::Assistant { content: current, tool_calls },
                ..
            }) = state.messages.last_mut()
            {
                if tool_calls.is_empty() {
                    current.clear();
                    current.push_str(content);
                }
            }
        })
    }

    /// Swap the trailing placeholder for an assistant message carrying `calls`.
    pub(super) fn attach_tool_calls(
        &self,
        epoch: u64,
        content: &str,
        calls: Vec<ToolCall>,
    ) -> Result<(), ChatError> {
        self.with_turn(epoch, |state| {
            if matches!(
                state.messages.last().map(|m| &m.body),
                Some(MessageBody::Assistant { tool_calls, .. }) if tool_calls.is_empty()
            ) {
                state.messages.pop();
            }
            state
                .messages
                .push(Message::assistant_with_tool_calls(content, calls));
        })
    }

    pub(super) fn finish_turn(
        &self,
        epoch: u64,
        status: ConversationStatus,
        error: Option<String>,
    ) -> Result<(), ChatError> {
        self.with_turn(epoch, |state| {
            state.status = status;
            state.last_error = error;
            state.turn_active = false;
            state.cancel = None;
        })
    }
}

#[cfg(test)]
pub(super) fn api_roles(history: &[ApiMessage]) -> Vec<&str> {
    history.iter().map(|m| m.role.as_str()).collect()
}
