//! The frozen configuration snapshot. Everything here is derived once at
//! startup and never mutated afterwards, so the hot path can read it without
//! any synchronization.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

/// Named preset choosing the numeric retry/timeout defaults. Explicit
/// per-field overrides win over the preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    /// Few retries, short timeouts, minimal pacing.
    Fast,
    #[default]
    Balanced,
    /// Patient retries and wide jitter, for upstreams that throttle hard.
    Secure,
}

impl PerformanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Secure => "secure",
        }
    }
}

impl FromStr for PerformanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "secure" => Ok(Self::Secure),
            other => Err(format!("unknown performance mode {other}")),
        }
    }
}

/// How thinking-phase `<details>` tags are presented to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkTagsMode {
    /// Rewrite `<details>`/`</details>` to `<think>`/`</think>`.
    #[default]
    Think,
    /// Delete the tags, keep the text.
    Strip,
    /// Pass the tags through untouched.
    Raw,
}

impl ThinkTagsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Think => "think",
            Self::Strip => "strip",
            Self::Raw => "raw",
        }
    }
}

impl FromStr for ThinkTagsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "think" => Ok(Self::Think),
            "strip" => Ok(Self::Strip),
            "raw" => Ok(Self::Raw),
            other => Err(format!("unknown think tags mode {other}")),
        }
    }
}

/// The public model names this proxy advertises. All three map onto the same
/// upstream model; the name chosen by the client selects the feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicModels {
    pub primary: String,
    pub thinking: String,
    pub search: String,
}

impl Default for PublicModels {
    fn default() -> Self {
        Self {
            primary: "GLM-4.5".to_string(),
            thinking: "GLM-4.5-Thinking".to_string(),
            search: "GLM-4.5-Search".to_string(),
        }
    }
}

impl PublicModels {
    pub fn all(&self) -> [&str; 3] {
        [&self.primary, &self.thinking, &self.search]
    }
}

/// The process-wide configuration snapshot.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub performance_mode: PerformanceMode,

    // Preset-controlled numerics. `from_mode` fills these; the launcher may
    // override any of them individually.
    pub retry_max: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,

    pub max_concurrent: usize,
    /// Accepted and echoed, not yet enforced by the admission gate.
    pub connection_queue_size: usize,
    /// Accepted and echoed, not yet enforced by the admission gate.
    pub max_connection_time: Duration,
    pub memory_limit_mb: u64,

    pub stream_buffer_bytes: usize,
    pub connection_check_interval: u32,
    pub connection_check_disabled: bool,

    pub anon_token_enabled: bool,
    pub think_tags_mode: ThinkTagsMode,

    pub default_api_key: String,
    pub upstream_url: String,
    pub upstream_token: String,
    pub models: PublicModels,

    pub debug_mode: bool,
    pub enable_metrics: bool,
    pub enable_detailed_logging: bool,
    pub log_user_messages: bool,
    pub log_response_content: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from_mode(PerformanceMode::Balanced)
    }
}

impl ProxyConfig {
    /// Build a snapshot with the preset's numeric defaults filled in.
    pub fn from_mode(mode: PerformanceMode) -> Self {
        let (retry_max, base_ms, request_ms, stream_ms, jitter_min_ms, jitter_max_ms) = match mode {
            PerformanceMode::Fast => (2, 300, 30_000, 120_000, 50, 200),
            PerformanceMode::Balanced => (3, 1_000, 60_000, 300_000, 200, 800),
            PerformanceMode::Secure => (5, 2_000, 120_000, 600_000, 500, 2_000),
        };

        Self {
            performance_mode: mode,
            retry_max,
            retry_base_delay: Duration::from_millis(base_ms),
            request_timeout: Duration::from_millis(request_ms),
            stream_timeout: Duration::from_millis(stream_ms),
            jitter_min: Duration::from_millis(jitter_min_ms),
            jitter_max: Duration::from_millis(jitter_max_ms),
            max_concurrent: 100,
            connection_queue_size: 50,
            max_connection_time: Duration::from_millis(300_000),
            memory_limit_mb: 512,
            stream_buffer_bytes: 4096,
            connection_check_interval: 10,
            connection_check_disabled: false,
            anon_token_enabled: true,
            think_tags_mode: ThinkTagsMode::default(),
            default_api_key: "sk-123456".to_string(),
            upstream_url: "https://chat.z.ai/api/chat/completions".to_string(),
            upstream_token: String::new(),
            models: PublicModels::default(),
            debug_mode: false,
            enable_metrics: true,
            enable_detailed_logging: false,
            log_user_messages: false,
            log_response_content: false,
        }
    }

    /// The scheme and host of the upstream, used for the auth bootstrap
    /// endpoint and the browser Origin/Referer headers.
    pub fn upstream_origin(&self) -> String {
        reqwest::Url::parse(&self.upstream_url)
            .ok()
            .and_then(|u| {
                let host = u.host_str()?.to_string();
                Some(match u.port() {
                    Some(port) => format!("{}://{}:{}", u.scheme(), host, port),
                    None => format!("{}://{}", u.scheme(), host),
                })
            })
            .unwrap_or_else(|| "https://chat.z.ai".to_string())
    }
}
