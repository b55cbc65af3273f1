use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Upstream request failed after {0} attempts")]
    UpstreamExhausted(u32),
    #[error("Timed out waiting for upstream response")]
    Timeout,
    #[error("Error building upstream request")]
    BuildingRequest,
}

/// A single failed exchange with the upstream. Carries enough context to
/// decide how to wait before the next attempt and to explain the failure if
/// the retry budget runs out.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    /// The HTTP status code, if there was one.
    pub status_code: Option<StatusCode>,
    /// The returned body, if there was one
    pub body: Option<serde_json::Value>,
    /// How much time it took before we received the error
    pub latency: std::time::Duration,
}

#[derive(Debug, Error)]
pub enum UpstreamErrorKind {
    #[error("Failed while trying to send request")]
    Sending,
    #[error("Timed out waiting for upstream")]
    Timeout,
    #[error("Upstream encountered a server error")]
    Server,
    /// 429. Waits use the capped rate-limit schedule instead of the normal
    /// backoff curve.
    #[error("Upstream rate limited this request")]
    RateLimit,
    /// 403. The upstream throttles anonymous traffic this way, so it shares
    /// the rate-limit wait schedule.
    #[error("Upstream refused the request")]
    Forbidden,
    #[error("Upstream rejected the request")]
    Rejected,
}

impl UpstreamErrorKind {
    /// Classify a response status. Returns `None` for success.
    pub fn from_status_code(code: StatusCode) -> Option<Self> {
        if code.is_success() {
            return None;
        }

        let kind = match code {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimit,
            StatusCode::FORBIDDEN => Self::Forbidden,
            c if c.is_server_error() => Self::Server,
            _ => Self::Rejected,
        };

        Some(kind)
    }

    pub fn from_reqwest_send_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Sending
        }
    }

    /// Whether this failure should use the capped rate-limit wait rather than
    /// the exponential backoff curve.
    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Forbidden)
    }
}
