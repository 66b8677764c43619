use super::state::ConversationStatus;
use super::streaming::emit_stream_update;
use super::{ChatError, ConversationManager, ConversationUpdate};
use crate::types::{Message, ToolCall, ToolResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

impl ConversationManager {
    /// Execute every call from one round and append the results to history:
    /// one `tool` message per call for the model, then one display record per call.
    pub(super) async fn run_tool_round(
        &self,
        calls: &[ToolCall],
        epoch: u64,
        cancel: &CancellationToken,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<Vec<ToolResult>, ChatError> {
        self.set_status(epoch, ConversationStatus::AwaitingTools, stream_delta_tx)?;
        emit_stream_update(stream_delta_tx, ConversationUpdate::ToolCalls(calls.to_vec()));

        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cleared),
            results = self.dispatcher.execute(calls) => results,
        };

        let failed = results.iter().filter(|r| r.is_error()).count();
        tracing::debug!(calls = calls.len(), failed, "tool round finished");

        self.with_turn(epoch, |state| {
            state.messages.extend(results.iter().map(Message::tool));
            state.messages.extend(
                calls
                    .iter()
                    .zip(&results)
                    .map(|(call, result)| Message::tool_execution(call, result)),
            );
        })?;

        emit_stream_update(stream_delta_tx, ConversationUpdate::ToolResults(results.clone()));
        self.publish_snapshot(stream_delta_tx);
        Ok(results)
    }
}

/// One-line summary of a tool result for hosts that print transcripts.
pub fn summarize_tool_result(result: &ToolResult) -> String {
    let body = crate::util::preview(&result.content_for_model(), 160);
    if result.is_error() {
        format!("{} failed: {body}", result.tool_name)
    } else {
        format!("{} -> {body}", result.tool_name)
    }
}
