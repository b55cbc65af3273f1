//! The non-streaming path: drain the upstream event stream into a single
//! assistant message. Parsing and termination rules match the streaming
//! translator; nothing is emitted until the upstream is done.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::{
    config::ProxyConfig,
    format::{ChatCompletionResponse, UpstreamEvent},
    sse::{parse_line, SseLine, SseLineBuffer},
    thinking::transform_thinking,
};

struct Accumulator<'a> {
    config: &'a ProxyConfig,
    content: String,
    buffered_think: String,
}

impl Accumulator<'_> {
    fn flush_think(&mut self) {
        if !self.buffered_think.is_empty() {
            self.content.push_str("<think>");
            self.content.push_str(&self.buffered_think);
            self.content.push_str("</think>");
            self.buffered_think.clear();
        }
    }

    /// Returns false once a terminal signal is seen.
    fn absorb(&mut self, event: &UpstreamEvent) -> bool {
        if let Some(error) = event.error_value() {
            tracing::warn!(%error, "upstream reported an error event");
            return false;
        }

        for choice in &event.choices {
            if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
                self.buffered_think.push_str(reasoning);
            }
            if let Some(content) = choice.delta.content.as_deref() {
                if !content.is_empty() {
                    self.flush_think();
                    self.content.push_str(content);
                }
            }
        }

        if !event.data.delta_content.is_empty() {
            if event.data.phase == "thinking" {
                let text = transform_thinking(&event.data.delta_content, self.config.think_tags_mode);
                self.content.push_str(&text);
            } else {
                self.flush_think();
                self.content.push_str(&event.data.delta_content);
            }
        }

        !event.is_done()
    }
}

/// Drain the upstream stream and build the complete response. The deadline
/// bounds the drain; on expiry whatever has accumulated is returned.
pub async fn collect_response<S, E>(
    body: S,
    config: &ProxyConfig,
    request_id: &str,
    model: &str,
    deadline: tokio::time::Instant,
) -> ChatCompletionResponse
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = Box::pin(body);
    let mut acc = Accumulator {
        config,
        content: String::new(),
        buffered_think: String::new(),
    };
    let mut lines = SseLineBuffer::with_capacity(config.stream_buffer_bytes);

    let drained = tokio::time::timeout_at(deadline, async {
        'read: while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    tracing::warn!(%error, "upstream body read failed");
                    break;
                }
            };

            lines.push(&chunk);
            while let Some(line) = lines.next_line() {
                match parse_line(&line) {
                    None => {}
                    Some(SseLine::Done) => break 'read,
                    Some(SseLine::Event(event)) => {
                        if !acc.absorb(&event) {
                            break 'read;
                        }
                    }
                }
            }
        }

        if let Some(line) = lines.take_partial() {
            if let Some(SseLine::Event(event)) = parse_line(&line) {
                acc.absorb(&event);
            }
        }
    })
    .await;

    if drained.is_err() {
        tracing::debug!("aggregation deadline reached, returning partial content");
    }

    acc.flush_think();
    ChatCompletionResponse::assistant(
        &format!("chatcmpl-{request_id}"),
        chrono::Utc::now().timestamp(),
        model,
        acc.content,
    )
}
