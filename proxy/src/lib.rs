//! zgate translation core. An OpenAI-compatible chat front end for the z.ai
//! event-stream dialect: admission control, anonymous-token bootstrap,
//! retrying upstream dispatch, and the streaming/aggregating translators.
//! The HTTP surface lives in the zgate-server crate; this crate can be
//! embedded anywhere a handler can call it.

use std::sync::Arc;

use bytes::Bytes;
use error_stack::{Report, ResultExt};

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod ids;
pub mod response;
pub mod sse;
pub mod stats;
pub mod streaming;
pub mod thinking;
pub mod token;

use admission::{AdmissionGate, AdmissionPermit};
use config::ProxyConfig;
pub use error::{Error, UpstreamError, UpstreamErrorKind};
use format::{ChatCompletionResponse, ClientRequest, UpstreamRequest};
use stats::ProxyStats;
use streaming::{FrameReceiver, StreamTranslator};

/// A client request translated into its upstream form, with the ids minted
/// for this conversation.
#[derive(Debug)]
pub struct PreparedRequest {
    pub chat_id: String,
    pub message_id: String,
    pub body: UpstreamRequest,
}

/// The proxy core. One per process; handlers share it through an `Arc`.
#[derive(Debug)]
pub struct Proxy {
    config: ProxyConfig,
    stats: Arc<ProxyStats>,
    gate: AdmissionGate,
    client: reqwest::Client,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        let stats = Arc::new(ProxyStats::new());
        let gate = AdmissionGate::new(config.max_concurrent, stats.clone());
        Self {
            config,
            stats,
            gate,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Non-blocking admission. `None` means reject with 503.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        self.gate.try_admit()
    }

    /// Mint conversation ids and build the upstream request body.
    pub fn prepare(&self, request: &ClientRequest) -> PreparedRequest {
        let chat_id = ids::new_chat_id();
        let message_id = ids::new_message_id();
        let body = UpstreamRequest::new(&self.config, request, &chat_id, &message_id);
        PreparedRequest {
            chat_id,
            message_id,
            body,
        }
    }

    /// The bearer used toward the upstream: a fresh anonymous token per
    /// request when enabled, else the configured fallback. Fetch failures
    /// are silent by design.
    pub async fn acquire_token(&self) -> String {
        if self.config.anon_token_enabled {
            if let Some(token) =
                token::fetch_anon_token(&self.client, &self.config.upstream_origin()).await
            {
                tracing::debug!("using anonymous visitor token");
                return token;
            }
            tracing::debug!("anonymous token unavailable, using configured token");
        }
        self.config.upstream_token.clone()
    }

    /// Send the prepared request upstream, bounded by `deadline`. Retries,
    /// backoff, and pacing happen inside; the result is a live event stream
    /// or a terminal error.
    pub async fn dispatch(
        &self,
        prepared: &PreparedRequest,
        deadline: tokio::time::Instant,
    ) -> Result<reqwest::Response, Report<Error>> {
        let body = serde_json::to_vec(&prepared.body).change_context(Error::BuildingRequest)?;
        let token = self.acquire_token().await;

        match tokio::time::timeout_at(
            deadline,
            dispatch::send_upstream(
                &self.client,
                &self.config,
                Bytes::from(body),
                &prepared.chat_id,
                &token,
            ),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(report)) => {
                Err(report.change_context(Error::UpstreamExhausted(self.config.retry_max)))
            }
            Err(_) => Err(Report::new(Error::Timeout)),
        }
    }

    /// Spawn the streaming translator over the upstream body. The returned
    /// receiver yields finished SSE frames and becomes the response body.
    /// The admission permit rides along with the task so the in-flight gauge
    /// covers the whole stream, and the response-time counter is settled when
    /// the stream finishes.
    pub fn stream_response(
        &self,
        response: reqwest::Response,
        request_id: &str,
        model: &str,
        deadline: tokio::time::Instant,
        started: std::time::Instant,
        permit: AdmissionPermit,
    ) -> FrameReceiver {
        let (tx, rx) = streaming::frame_channel();
        let translator = StreamTranslator::new(&self.config, request_id, model, tx);
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let _permit = permit;
            translator.run(response.bytes_stream(), deadline).await;
            stats.record_response_time(started.elapsed());
        });

        rx
    }

    /// Drain the upstream body into a single response.
    pub async fn aggregate_response(
        &self,
        response: reqwest::Response,
        request_id: &str,
        model: &str,
        deadline: tokio::time::Instant,
    ) -> ChatCompletionResponse {
        response::collect_response(
            response.bytes_stream(),
            &self.config,
            request_id,
            model,
            deadline,
        )
        .await
    }
}
