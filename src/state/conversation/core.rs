use super::history::build_api_history;
use super::state::ConversationStatus;
use super::streaming::{emit_stream_update, RoundFailure, RoundReply};
use super::{ChatError, ConversationManager, ConversationUpdate, SendOptions, TurnOutcome};
use crate::api::CompletionParams;
use crate::types::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

impl ConversationManager {
    /// Run one user turn to completion: stream a reply, execute any tool
    /// calls, and repeat until the model answers in plain text or the round
    /// limit is hit.
    pub async fn send_message(
        &self,
        content: &str,
        options: &SendOptions,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<TurnOutcome, ChatError> {
        let (epoch, cancel) = self.begin_turn(content, stream_delta_tx)?;
        let result = self
            .run_rounds(options, epoch, &cancel, stream_delta_tx)
            .await;
        if matches!(result, Err(ChatError::Cleared)) {
            tracing::debug!(epoch, "turn abandoned after clear");
        }
        result
    }

    fn begin_turn(
        &self,
        content: &str,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<(u64, CancellationToken), ChatError> {
        let mut state = self.lock_state();
        let rejection = if !self.client.has_api_key() {
            Some(ChatError::MissingCredential)
        } else if content.trim().is_empty() {
            Some(ChatError::EmptyMessage)
        } else if state.turn_active {
            Some(ChatError::Busy)
        } else {
            None
        };

        if let Some(error) = rejection {
            state.last_error = Some(error.to_string());
            // The running turn keeps its status.
            if error != ChatError::Busy {
                state.status = ConversationStatus::Error;
                emit_stream_update(stream_delta_tx, ConversationUpdate::Status(state.status));
            }
            tracing::debug!(error = %error, "send rejected");
            return Err(error);
        }

        let cancel = CancellationToken::new();
        state.turn_active = true;
        state.cancel = Some(cancel.clone());
        state.status = ConversationStatus::Sending;
        state.last_error = None;
        state.messages.push(Message::user(content));
        let epoch = state.epoch;
        drop(state);

        emit_stream_update(
            stream_delta_tx,
            ConversationUpdate::Status(ConversationStatus::Sending),
        );
        self.publish_snapshot(stream_delta_tx);
        Ok((epoch, cancel))
    }

    async fn run_rounds(
        &self,
        options: &SendOptions,
        epoch: u64,
        cancel: &CancellationToken,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<TurnOutcome, ChatError> {
        let tools = self.dispatcher.definitions();

        for round in 1..=self.max_tool_rounds {
            let messages = self.with_turn(epoch, |state| {
                let history = build_api_history(&state.messages, options.system_prompt.as_deref());
                state.messages.push(Message::assistant(""));
                history
            })?;
            if round > 1 {
                self.set_status(epoch, ConversationStatus::Sending, stream_delta_tx)?;
            }
            tracing::info!(round, messages = messages.len(), tools = tools.len(), "completion round");

            let params = CompletionParams::new(options.model.clone(), messages).with_tools(tools.clone());
            let reply = match self.complete_round(&params, epoch, cancel, stream_delta_tx).await {
                Ok(reply) => reply,
                Err(RoundFailure::Cleared) => return Err(ChatError::Cleared),
                Err(RoundFailure::Transport(error)) => {
                    let message = format!("{error:#}");
                    tracing::error!(error = %message, "completion failed after fallback");
                    self.set_placeholder_content(epoch, &format!("Error: {message}"))?;
                    self.finish_turn(epoch, ConversationStatus::Error, Some(message.clone()))?;
                    emit_stream_update(
                        stream_delta_tx,
                        ConversationUpdate::Status(ConversationStatus::Error),
                    );
                    self.publish_snapshot(stream_delta_tx);
                    return Err(ChatError::Completion(message));
                }
            };

            if reply.tool_calls.is_empty() {
                self.set_placeholder_content(epoch, &reply.content)?;
                self.finish_turn(epoch, ConversationStatus::Idle, None)?;
                emit_stream_update(
                    stream_delta_tx,
                    ConversationUpdate::Status(ConversationStatus::Idle),
                );
                self.publish_snapshot(stream_delta_tx);
                return Ok(TurnOutcome::Completed {
                    content: reply.content,
                    rounds: round,
                });
            }

            self.attach_tool_calls(epoch, &reply.content, reply.tool_calls.clone())?;
            self.run_tool_round(&reply.tool_calls, epoch, cancel, stream_delta_tx)
                .await?;
        }

        let rounds = self.max_tool_rounds;
        tracing::warn!(rounds, "tool round limit reached; stopping without a final answer");
        self.finish_turn(epoch, ConversationStatus::Idle, None)?;
        emit_stream_update(stream_delta_tx, ConversationUpdate::RoundLimitReached { rounds });
        emit_stream_update(
            stream_delta_tx,
            ConversationUpdate::Status(ConversationStatus::Idle),
        );
        Ok(TurnOutcome::RoundLimitReached { rounds })
    }

    /// Streaming first; a transport failure retries the same request without streaming.
    async fn complete_round(
        &self,
        params: &CompletionParams,
        epoch: u64,
        cancel: &CancellationToken,
        stream_delta_tx: Option<&mpsc::UnboundedSender<ConversationUpdate>>,
    ) -> Result<RoundReply, RoundFailure> {
        match self.stream_round(params, epoch, cancel, stream_delta_tx).await {
            Err(RoundFailure::Transport(error)) => {
                let reason = format!("{error:#}");
                tracing::warn!(error = %reason, "stream failed, falling back to non-streaming request");
                self.fallback_round(params, epoch, cancel, stream_delta_tx).await
            }
            other => other,
        }
    }
}
