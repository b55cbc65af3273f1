//! The streaming translation core. Consumes the upstream event stream and
//! emits OpenAI-shaped SSE frames into a channel whose receiver becomes the
//! client response body. A dropped receiver is a disconnected client, so
//! every send doubles as a liveness check.
//!
//! Framing contract: the role-only opener precedes everything, at most one
//! finish chunk is emitted, and `data: [DONE]` terminates the stream exactly
//! once, on every exit path.

use std::ops::ControlFlow;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::{
    config::{ProxyConfig, ThinkTagsMode},
    format::{ChatCompletionChunk, UpstreamEvent},
    sse::{parse_line, SseLine, SseLineBuffer},
    thinking::transform_thinking,
};

pub type FrameSender = flume::Sender<Bytes>;
pub type FrameReceiver = flume::Receiver<Bytes>;

/// Channel carrying finished SSE frames to the response body.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    flume::unbounded()
}

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpenerPending,
    Streaming,
    Terminating,
    /// Absorbing: all further input is discarded.
    Closed,
}

/// Per-request translator. Lives on the pump task's stack and is destroyed
/// when the upstream stream ends.
pub struct StreamTranslator {
    chunk_id: String,
    model: String,
    created: i64,
    think_tags_mode: ThinkTagsMode,
    check_interval: u32,
    check_disabled: bool,
    buffer_capacity: usize,
    tx: FrameSender,

    state: State,
    sent_initial_answer: bool,
    in_think_block: bool,
    buffered_think: String,
    check_counter: u32,
}

impl StreamTranslator {
    pub fn new(config: &ProxyConfig, request_id: &str, model: &str, tx: FrameSender) -> Self {
        Self {
            chunk_id: format!("chatcmpl-{request_id}"),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            think_tags_mode: config.think_tags_mode,
            check_interval: config.connection_check_interval.max(1),
            check_disabled: config.connection_check_disabled,
            buffer_capacity: config.stream_buffer_bytes,
            tx,
            state: State::OpenerPending,
            sent_initial_answer: false,
            in_think_block: false,
            buffered_think: String::new(),
            check_counter: 0,
        }
    }

    /// Drive the translation to completion. The deadline bounds the read
    /// loop; expiry is treated like upstream EOF and still terminates the
    /// output cleanly.
    pub async fn run<S, E>(mut self, body: S, deadline: tokio::time::Instant)
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let opener = ChatCompletionChunk::opener(&self.chunk_id, self.created, &self.model);
        self.emit_chunk(opener).await;

        let mut body = Box::pin(body);
        let mut lines = SseLineBuffer::with_capacity(self.buffer_capacity);
        if tokio::time::timeout_at(deadline, self.pump(&mut body, &mut lines))
            .await
            .is_err()
        {
            tracing::debug!("stream deadline reached, terminating");
        }

        self.terminal_flush().await;
    }

    async fn pump<S, E>(&mut self, body: &mut S, lines: &mut SseLineBuffer)
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    // Treated like EOF: the terminal flush still runs.
                    tracing::warn!(%error, "upstream body read failed");
                    break;
                }
            };

            lines.push(&chunk);
            while let Some(line) = lines.next_line() {
                if self.state == State::OpenerPending {
                    self.state = State::Streaming;
                }
                if self.process_line(&line).await.is_break() {
                    return;
                }
            }

            if !self.probe_client().await {
                return;
            }
        }

        // Upstream EOF with an unterminated final line: process it as if the
        // newline had arrived.
        if let Some(line) = lines.take_partial() {
            let _ = self.process_line(&line).await;
        }
    }

    async fn process_line(&mut self, line: &str) -> ControlFlow<()> {
        match parse_line(line) {
            None => ControlFlow::Continue(()),
            Some(SseLine::Done) => {
                self.terminal_flush().await;
                ControlFlow::Break(())
            }
            Some(SseLine::Event(event)) => self.handle_event(*event).await,
        }
    }

    async fn handle_event(&mut self, event: UpstreamEvent) -> ControlFlow<()> {
        if self.state == State::Closed {
            return ControlFlow::Break(());
        }

        if let Some(error) = event.error_value() {
            tracing::warn!(%error, "upstream reported an error event");
            self.finish_and_close().await;
            return ControlFlow::Break(());
        }

        // Alternative dialect: OpenAI-style deltas where thinking arrives as
        // a separate reasoning_content field. Reasoning is buffered and
        // wrapped, answer content flushes the buffer first.
        for choice in &event.choices {
            if let Some(reasoning) = choice
                .delta
                .reasoning_content
                .as_deref()
                .filter(|text| !text.is_empty())
            {
                self.in_think_block = true;
                self.buffered_think.push_str(reasoning);
            }

            if let Some(content) = choice.delta.content.clone().filter(|text| !text.is_empty()) {
                if !self.flush_think_buffer().await || !self.emit_content(&content).await {
                    return ControlFlow::Break(());
                }
            }
        }

        let data = &event.data;

        // First answer splice: content the upstream inlined after the closing
        // details tag of the first answer-phase edit block. Fires at most
        // once per request.
        if !self.sent_initial_answer && data.phase == "answer" && !data.edit_content.is_empty() {
            if let Some((_, spliced)) = data.edit_content.split_once("</details>") {
                let spliced = spliced.to_string();
                self.sent_initial_answer = true;
                if !spliced.is_empty()
                    && (!self.flush_think_buffer().await || !self.emit_content(&spliced).await)
                {
                    return ControlFlow::Break(());
                }
            }
        }

        if !data.delta_content.is_empty() {
            if data.phase == "thinking" {
                let text = transform_thinking(&data.delta_content, self.think_tags_mode);
                if !text.is_empty() && !self.emit_reasoning(&text).await {
                    return ControlFlow::Break(());
                }
            } else {
                let text = data.delta_content.clone();
                if !self.flush_think_buffer().await || !self.emit_content(&text).await {
                    return ControlFlow::Break(());
                }
            }
        }

        if event.is_done() {
            self.finish_and_close().await;
            return ControlFlow::Break(());
        }

        ControlFlow::Continue(())
    }

    /// Done or error seen: finish chunk, then the terminator.
    async fn finish_and_close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Terminating;
        self.flush_think_buffer().await;
        let finish = ChatCompletionChunk::finish(&self.chunk_id, self.created, &self.model);
        self.emit_chunk(finish).await;
        self.emit_frame(Bytes::from_static(DONE_FRAME)).await;
        self.state = State::Closed;
    }

    /// Stream ended without a done marker (upstream `[DONE]`, EOF, deadline):
    /// flush anything buffered and terminate.
    async fn terminal_flush(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Terminating;
        self.flush_think_buffer().await;
        self.emit_frame(Bytes::from_static(DONE_FRAME)).await;
        self.state = State::Closed;
    }

    /// Buffered reasoning must reach the client before any answer content or
    /// terminal frame. Returns false once the client is unreachable.
    async fn flush_think_buffer(&mut self) -> bool {
        if self.in_think_block && !self.buffered_think.is_empty() {
            let wrapped = format!("<think>{}</think>", self.buffered_think);
            self.in_think_block = false;
            self.buffered_think.clear();
            self.emit_content(&wrapped).await
        } else {
            self.in_think_block = false;
            true
        }
    }

    /// Periodic zero-byte probe. Returns false when the client went away;
    /// no further frames are produced after that.
    async fn probe_client(&mut self) -> bool {
        if self.check_disabled || self.state == State::Closed {
            return true;
        }

        self.check_counter += 1;
        if self.check_counter % self.check_interval == 0
            && self.tx.send_async(Bytes::new()).await.is_err()
        {
            tracing::debug!("client disconnected, stopping translation");
            self.state = State::Closed;
            return false;
        }

        true
    }

    async fn emit_content(&mut self, text: &str) -> bool {
        let chunk = ChatCompletionChunk::content(&self.chunk_id, self.created, &self.model, text);
        self.emit_chunk(chunk).await
    }

    async fn emit_reasoning(&mut self, text: &str) -> bool {
        let chunk = ChatCompletionChunk::reasoning(&self.chunk_id, self.created, &self.model, text);
        self.emit_chunk(chunk).await
    }

    async fn emit_chunk(&mut self, chunk: ChatCompletionChunk) -> bool {
        let json = match serde_json::to_string(&chunk) {
            Ok(json) => json,
            Err(error) => {
                tracing::error!(%error, "failed to serialize chunk");
                return true;
            }
        };
        self.emit_frame(Bytes::from(format!("data: {json}\n\n"))).await
    }

    /// Send one finished frame. Returns false when the receiver is gone,
    /// which marks the stream closed.
    async fn emit_frame(&mut self, frame: Bytes) -> bool {
        if self.state == State::Closed {
            return false;
        }
        if self.tx.send_async(frame).await.is_err() {
            // Client went away; writes fail silently from here on.
            self.state = State::Closed;
            return false;
        }
        true
    }
}
