//! Upstream dispatch with retry. Each attempt either yields a live 200
//! response whose body is the upstream event stream, or consumes one unit of
//! the retry budget. Waits between attempts follow an exponential curve with
//! uniform jitter; throttle responses (429/403) use their own capped
//! schedule.

use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT,
};

use crate::{
    config::ProxyConfig,
    error::{UpstreamError, UpstreamErrorKind},
};

/// Throttle waits never exceed this, whatever the backoff curve says.
const MAX_THROTTLE_WAIT: Duration = Duration::from_millis(10_000);

const FE_VERSION: &str = "prod-fe-1.0.70";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
];

/// The header set that makes requests look like the upstream's own web
/// client. The UA is picked uniformly at random per call.
pub(crate) fn browser_headers(origin: &str, chat_id: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let ua = USER_AGENTS[rand::thread_rng().gen_range(0..USER_AGENTS.len())];
    headers.insert(USER_AGENT, HeaderValue::from_static(ua));
    headers.insert("x-fe-version", HeaderValue::from_static(FE_VERSION));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static("\"Chromium\";v=\"125\", \"Not.A/Brand\";v=\"24\""),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(ORIGIN, value);
    }
    let referer = match chat_id {
        Some(id) => format!("{origin}/c/{id}"),
        None => format!("{origin}/"),
    };
    if let Ok(value) = HeaderValue::from_str(&referer) {
        headers.insert(REFERER, value);
    }

    headers
}

/// Wait before the next attempt after `failed_attempts` ordinary failures:
/// `base * 2^(n-1)`.
fn backoff_wait(base: Duration, failed_attempts: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(failed_attempts.saturating_sub(1)))
}

/// Wait after a throttle response on attempt `n`: `base * 2^n`, capped.
fn throttle_wait(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_THROTTLE_WAIT)
}

fn jitter_wait(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Execute the upstream POST with the configured retry budget. The caller
/// bounds the whole call (attempts and waits included) with the request
/// deadline; dropping the future mid-sleep abandons the retry loop.
pub async fn send_upstream(
    client: &reqwest::Client,
    config: &ProxyConfig,
    body: Bytes,
    chat_id: &str,
    token: &str,
) -> Result<reqwest::Response, Report<UpstreamError>> {
    let origin = config.upstream_origin();
    let retry_max = config.retry_max.max(1);
    let mut attempt = 1u32;

    loop {
        let attempt_start = tokio::time::Instant::now();
        let result = client
            .post(&config.upstream_url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .headers(browser_headers(&origin, Some(chat_id)))
            .body(body.clone())
            .send()
            .await;

        let error = match result {
            Ok(response) => match UpstreamErrorKind::from_status_code(response.status()) {
                None => {
                    tracing::debug!(attempt, "upstream accepted request");
                    return Ok(response);
                }
                Some(kind) => {
                    let status = response.status();
                    // Read and close the body so the connection can be reused.
                    let error_body = response.json::<serde_json::Value>().await.ok();
                    Report::new(UpstreamError {
                        kind,
                        status_code: Some(status),
                        body: error_body,
                        latency: attempt_start.elapsed(),
                    })
                }
            },
            Err(error) => {
                let kind = UpstreamErrorKind::from_reqwest_send_error(&error);
                Report::new(error).change_context(UpstreamError {
                    kind,
                    status_code: None,
                    body: None,
                    latency: attempt_start.elapsed(),
                })
            }
        };

        let throttled = error.current_context().kind.is_throttle();
        tracing::warn!(attempt, throttled, err = ?error, "upstream attempt failed");

        if attempt >= retry_max {
            return Err(error.attach_printable(format!("giving up after {attempt} attempts")));
        }

        if throttled {
            tokio::time::sleep(throttle_wait(config.retry_base_delay, attempt)).await;
        } else {
            tokio::time::sleep(backoff_wait(config.retry_base_delay, attempt)).await;
            tokio::time::sleep(jitter_wait(config.jitter_min, config.jitter_max)).await;
        }

        attempt += 1;
    }
}
