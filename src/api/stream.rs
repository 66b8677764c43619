use super::client::ByteStream;
use super::logging::emit_stream_parse_error;
use crate::types::{StreamChunk, ToolCall, ToolCallDelta};
use anyhow::{anyhow, Result};
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use tokio_util::sync::CancellationToken;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const TOOL_CALLS_FINISH_REASON: &str = "tool_calls";

/// Events surfaced to the consumer of a completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Full accumulated assistant text so far (not the delta).
    ContentDelta(String),
    /// Snapshot of the tool calls merged so far, ordered by index.
    ToolCallProgress(Vec<ToolCall>),
    /// Terminal event. `tool_calls` is `None` when no complete call was produced.
    Done {
        content: String,
        tool_calls: Option<Vec<ToolCall>>,
    },
}

#[derive(Debug)]
pub enum Frame {
    Chunk(StreamChunk),
    Done,
}

/// Splits a byte stream into `data:` frames. Partial lines stay buffered
/// until their newline arrives.
#[derive(Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 1;
            if let Some(frame) = parse_line(&line) {
                let is_done = matches!(frame, Frame::Done);
                frames.push(frame);
                if is_done {
                    break;
                }
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        frames
    }

    /// Flush a trailing line that arrived without a newline before end-of-body.
    pub fn finish(&mut self) -> Vec<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<Frame> {
    let trimmed = line.trim();
    let data = trimmed.strip_prefix(DATA_PREFIX)?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == DONE_SENTINEL {
        return Some(Frame::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) if chunk.kind.as_deref() == Some("comment") => None,
        Ok(chunk) => Some(Frame::Chunk(chunk)),
        Err(error) => {
            emit_stream_parse_error(data, &error);
            None
        }
    }
}

/// Accumulates content and merges tool-call fragments by index.
pub struct StreamAssembler {
    content: String,
    tool_calls: BTreeMap<usize, ToolCall>,
    content_frames: usize,
    update_every: usize,
    finished: bool,
}

impl StreamAssembler {
    pub fn new(update_every: usize) -> Self {
        Self {
            content: String::new(),
            tool_calls: BTreeMap::new(),
            content_frames: 0,
            update_every: update_every.max(1),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn apply(&mut self, chunk: StreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(delta) = choice.delta {
            if let Some(text) = delta.content.filter(|text| !text.is_empty()) {
                self.content.push_str(&text);
                self.content_frames += 1;
                if self.content_frames % self.update_every == 0 {
                    events.push(StreamEvent::ContentDelta(self.content.clone()));
                }
            }

            if let Some(fragments) = delta.tool_calls {
                for fragment in fragments {
                    self.merge_tool_call(fragment);
                }
                events.push(StreamEvent::ToolCallProgress(
                    self.tool_calls.values().cloned().collect(),
                ));
            }
        }

        if choice.finish_reason.as_deref() == Some(TOOL_CALLS_FINISH_REASON)
            && !self.tool_calls.is_empty()
        {
            events.extend(self.finish());
        }

        events
    }

    fn merge_tool_call(&mut self, fragment: ToolCallDelta) {
        let index = fragment.index.unwrap_or(self.tool_calls.len());
        let entry = self
            .tool_calls
            .entry(index)
            .or_insert_with(|| ToolCall::new(index, "", "", ""));

        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            entry.id = id;
        }
        if let Some(kind) = fragment.kind.filter(|kind| !kind.is_empty()) {
            entry.kind = kind;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name.filter(|name| !name.is_empty()) {
                if entry.function.name.is_empty() {
                    entry.function.name = name;
                }
            }
            if let Some(arguments) = function.arguments {
                entry.function.arguments.push_str(&arguments);
            }
        }
    }

    /// Produce the terminal event once; later calls return `None`.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;

        let complete: Vec<ToolCall> = std::mem::take(&mut self.tool_calls)
            .into_values()
            .filter(ToolCall::is_complete)
            .collect();
        Some(StreamEvent::Done {
            content: self.content.clone(),
            tool_calls: if complete.is_empty() {
                None
            } else {
                Some(complete)
            },
        })
    }
}

/// Lazy, non-restartable sequence of [`StreamEvent`]s read from a response body.
pub struct CompletionStream {
    bytes: ByteStream,
    parser: StreamParser,
    assembler: StreamAssembler,
    pending: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    exhausted: bool,
}

impl CompletionStream {
    pub fn new(bytes: ByteStream, update_every: usize, cancel: CancellationToken) -> Self {
        Self {
            bytes,
            parser: StreamParser::new(),
            assembler: StreamAssembler::new(update_every),
            pending: VecDeque::new(),
            cancel,
            exhausted: false,
        }
    }

    /// Next event, or `None` after the terminal `Done` (or an error) was returned.
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if matches!(event, StreamEvent::Done { .. }) {
                    self.pending.clear();
                    self.exhausted = true;
                }
                return Some(Ok(event));
            }
            if self.exhausted {
                return None;
            }

            let item = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.exhausted = true;
                    return Some(Err(anyhow!("completion stream cancelled")));
                }
                item = self.bytes.next() => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    let frames = self.parser.process(&chunk);
                    self.absorb(frames);
                }
                Some(Err(error)) => {
                    self.exhausted = true;
                    return Some(Err(error));
                }
                None => {
                    let frames = self.parser.finish();
                    self.absorb(frames);
                    self.pending.extend(self.assembler.finish());
                }
            }
        }
    }

    fn absorb(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Chunk(chunk) => self.pending.extend(self.assembler.apply(chunk)),
                Frame::Done => self.pending.extend(self.assembler.finish()),
            }
            if self.assembler.is_finished() {
                break;
            }
        }
    }
}
