use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::extract::Request;
use clap::Parser;
use error_stack::{Report, ResultExt};
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use zgate_proxy::Proxy;

mod config;
mod error;
mod server;

use error::Error;
use server::ServerState;

/// All configuration enters here, from flags or the environment, and is
/// frozen into the proxy config before the server starts.
#[derive(Parser)]
#[command(name = "zgate", version, about)]
pub struct Cli {
    /// The IP host to bind to
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// The TCP port to listen on
    #[clap(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// The bearer key clients must present
    #[clap(long, env = "DEFAULT_KEY", default_value = "sk-123456")]
    default_key: String,

    /// The upstream chat completions endpoint
    #[clap(
        long,
        env = "UPSTREAM_URL",
        default_value = "https://chat.z.ai/api/chat/completions"
    )]
    upstream_url: String,

    /// Fallback upstream bearer, used when the anonymous token is disabled
    /// or unavailable
    #[clap(long, env = "UPSTREAM_TOKEN", default_value = "")]
    upstream_token: String,

    /// Numeric preset: fast, balanced, or secure
    #[clap(long, env = "PERFORMANCE_MODE", default_value = "balanced")]
    performance_mode: String,

    /// Override the preset's retry budget
    #[clap(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Override the preset's base retry delay (ms)
    #[clap(long, env = "RETRY_DELAY")]
    retry_delay: Option<u64>,

    /// Override the preset's non-streaming deadline (ms)
    #[clap(long, env = "REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Override the preset's streaming deadline (ms)
    #[clap(long, env = "STREAM_TIMEOUT")]
    stream_timeout: Option<u64>,

    /// Override the preset's minimum retry jitter (ms)
    #[clap(long, env = "RANDOM_DELAY_MIN")]
    random_delay_min: Option<u64>,

    /// Override the preset's maximum retry jitter (ms)
    #[clap(long, env = "RANDOM_DELAY_MAX")]
    random_delay_max: Option<u64>,

    /// Admission gate capacity
    #[clap(long, env = "MAX_CONCURRENT_CONNECTIONS", default_value_t = 100)]
    max_concurrent_connections: usize,

    /// Reserved; accepted for compatibility but not enforced
    #[clap(long, env = "CONNECTION_QUEUE_SIZE", default_value_t = 50)]
    connection_queue_size: usize,

    /// Reserved; accepted for compatibility but not enforced (ms)
    #[clap(long, env = "MAX_CONNECTION_TIME", default_value_t = 300_000)]
    max_connection_time: u64,

    /// Memory threshold for the periodic usage warning (MB)
    #[clap(long, env = "MEMORY_LIMIT_MB", default_value_t = 512)]
    memory_limit_mb: u64,

    /// Initial capacity of the upstream line buffer (bytes)
    #[clap(long, env = "STREAM_BUFFER_SIZE", default_value_t = 4096)]
    stream_buffer_size: usize,

    /// Disable the client liveness probe entirely
    #[clap(long, env = "DISABLE_CONNECTION_CHECK", default_value_t = false, action = clap::ArgAction::Set)]
    disable_connection_check: bool,

    /// Probe the client every N read iterations
    #[clap(long, env = "CONNECTION_CHECK_INTERVAL", default_value_t = 10)]
    connection_check_interval: u32,

    /// Fetch a fresh anonymous upstream token per request
    #[clap(long, env = "ANON_TOKEN_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    anon_token_enabled: bool,

    /// How thinking tags are presented: think, strip, or raw
    #[clap(long, env = "THINK_TAGS_MODE", default_value = "think")]
    think_tags_mode: String,

    #[clap(long, env = "DEBUG_MODE", default_value_t = false, action = clap::ArgAction::Set)]
    debug_mode: bool,

    /// Run the periodic memory ticker
    #[clap(long, env = "ENABLE_METRICS", default_value_t = true, action = clap::ArgAction::Set)]
    enable_metrics: bool,

    #[clap(long, env = "ENABLE_DETAILED_LOGGING", default_value_t = false, action = clap::ArgAction::Set)]
    enable_detailed_logging: bool,

    #[clap(long, env = "LOG_USER_MESSAGES", default_value_t = false, action = clap::ArgAction::Set)]
    log_user_messages: bool,

    #[clap(long, env = "LOG_RESPONSE_CONTENT", default_value_t = false, action = clap::ArgAction::Set)]
    log_response_content: bool,

    /// Do not read the .env file
    #[clap(long)]
    no_dotenv: bool,
}

async fn serve(cli: Cli) -> Result<(), Report<Error>> {
    error_stack::Report::set_color_mode(error_stack::fmt::ColorMode::None);

    let proxy_config = config::build_config(&cli)?;

    let default_filter = if proxy_config.debug_mode {
        "zgate_server=debug,zgate_proxy=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if cli.no_dotenv {
        tracing::debug!("skipped .env loading");
    }

    let proxy = Proxy::new(proxy_config.clone());

    if proxy_config.enable_metrics {
        let stats = proxy.stats().clone();
        let limit_mb = proxy_config.memory_limit_mb;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let usage_mb = server::memory_usage_mb();
                if usage_mb > limit_mb {
                    tracing::warn!(usage_mb, limit_mb, "memory usage over the configured limit");
                } else {
                    tracing::debug!(
                        usage_mb,
                        connections = stats.current_connections(),
                        "memory snapshot"
                    );
                }
            }
        });
    }

    let state = Arc::new(ServerState::new(proxy));
    let app = server::build_app(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                let method = req.method();
                let uri = req.uri();
                tracing::info_span!("request", http.method = %method, http.uri = %uri)
            })
            .on_response(
                |res: &http::Response<axum::body::Body>, latency: Duration, _span: &tracing::Span| {
                    tracing::info!(
                        latency = %format!("{} ms", latency.as_millis()),
                        http.status_code = res.status().as_u16(),
                        "finished processing request"
                    );
                },
            )
            .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
    );

    let bind_ip = cli
        .host
        .parse::<IpAddr>()
        .change_context(Error::ServerStart)
        .attach_printable_lazy(|| format!("invalid bind host {}", cli.host))?;
    let bind_addr = SocketAddr::from((bind_ip, cli.port));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .change_context(Error::ServerStart)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %bind_addr,
        mode = proxy_config.performance_mode.as_str(),
        "zgate listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .change_context(Error::ServerStart)?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
}

fn main() -> Result<(), Report<Error>> {
    // The flag has to be honored before clap reads the environment.
    if !std::env::args().any(|arg| arg == "--no-dotenv") {
        dotenvy::dotenv().ok();
    }

    let cli = Cli::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building runtime")
        .block_on(serve(cli))
}
