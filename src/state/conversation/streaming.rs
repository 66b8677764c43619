use super::state::ConversationStatus;
use super::{ChatError, ConversationManager, ConversationUpdate};
use crate::api::{CompletionParams, StreamEvent};
use crate::types::ToolCall;
use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What one completion round produced, whichever path delivered it.
#[derive(Debug, Default)]
pub(super) struct RoundReply {
    pub(super) content: String,
    pub(super) tool_calls: Vec<ToolCall>,
}

#[derive(Debug)]
pub(super) enum RoundFailure {
    Cleared,
    Transport(anyhow::Error),
}

impl ConversationManager {
    /// Stream one round into the trailing placeholder.
    pub(super) async fn stream_round(
        &self,
        params: &CompletionParams,
        epoch: u64,
        cancel: &CancellationToken,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<RoundReply, RoundFailure> {
        let failure = |error: anyhow::Error| {
            if cancel.is_cancelled() {
                RoundFailure::Cleared
            } else {
                RoundFailure::Transport(error)
            }
        };

        let mut stream = self
            .client
            .create_stream(params, cancel.clone())
            .await
            .map_err(failure)?;
        self.set_status(epoch, ConversationStatus::Streaming, stream_delta_tx)
            .map_err(|_| RoundFailure::Cleared)?;

        while let Some(event) = stream.next().await {
            match event.map_err(failure)? {
                StreamEvent::ContentDelta(text) => {
                    self.set_placeholder_content(epoch, &text)
                        .map_err(|_| RoundFailure::Cleared)?;
                    emit_stream_update(stream_delta_tx, ConversationUpdate::ContentDelta(text));
                }
                StreamEvent::ToolCallProgress(calls) => {
                    emit_stream_update(stream_delta_tx, ConversationUpdate::ToolCallProgress(calls));
                }
                StreamEvent::Done {
                    content,
                    tool_calls,
                } => {
                    return Ok(RoundReply {
                        content,
                        tool_calls: tool_calls.unwrap_or_default(),
                    });
                }
            }
        }

        Err(failure(anyhow!("completion stream ended without a terminal event")))
    }

    /// Same request as [`Self::stream_round`], issued as one blocking call.
    pub(super) async fn fallback_round(
        &self,
        params: &CompletionParams,
        epoch: u64,
        cancel: &CancellationToken,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<RoundReply, RoundFailure> {
        self.set_status(epoch, ConversationStatus::NonStreaming, stream_delta_tx)
            .map_err(|_| RoundFailure::Cleared)?;

        match self.client.complete(params, cancel.clone()).await {
            Ok(completion) => Ok(RoundReply {
                content: completion.content,
                tool_calls: completion
                    .tool_calls
                    .into_iter()
                    .filter(ToolCall::is_complete)
                    .collect(),
            }),
            Err(_) if cancel.is_cancelled() => Err(RoundFailure::Cleared),
            Err(error) => Err(RoundFailure::Transport(error)),
        }
    }

    pub(super) fn set_status(
        &self,
        epoch: u64,
        status: ConversationStatus,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<(), ChatError> {
        self.with_turn(epoch, |state| state.status = status)?;
        emit_stream_update(stream_delta_tx, ConversationUpdate::Status(status));
        Ok(())
    }

    pub(super) fn publish_snapshot(
        &self,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) {
        if stream_delta_tx.is_some() {
            emit_stream_update(stream_delta_tx, ConversationUpdate::Messages(self.snapshot()));
        }
    }
}

pub(super) fn emit_stream_update(
    stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    update: ConversationUpdate,
) {
    if let Some(tx) = stream_delta_tx {
        let _ = tx.send(update);
    }
}
