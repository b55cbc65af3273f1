//! Assembles the frozen proxy configuration from the CLI/environment inputs:
//! the performance preset fills the numeric defaults, then every explicitly
//! provided value overrides its field.

use std::time::Duration;

use error_stack::Report;
use zgate_proxy::config::{PerformanceMode, ProxyConfig, ThinkTagsMode};

use crate::{error::Error, Cli};

pub fn build_config(cli: &Cli) -> Result<ProxyConfig, Report<Error>> {
    let mode = cli
        .performance_mode
        .parse::<PerformanceMode>()
        .map_err(|message| Report::new(Error::Config).attach_printable(message))?;

    let mut config = ProxyConfig::from_mode(mode);

    if let Some(value) = cli.max_retries {
        config.retry_max = value;
    }
    if let Some(value) = cli.retry_delay {
        config.retry_base_delay = Duration::from_millis(value);
    }
    if let Some(value) = cli.request_timeout {
        config.request_timeout = Duration::from_millis(value);
    }
    if let Some(value) = cli.stream_timeout {
        config.stream_timeout = Duration::from_millis(value);
    }
    if let Some(value) = cli.random_delay_min {
        config.jitter_min = Duration::from_millis(value);
    }
    if let Some(value) = cli.random_delay_max {
        config.jitter_max = Duration::from_millis(value);
    }

    config.max_concurrent = cli.max_concurrent_connections;
    config.connection_queue_size = cli.connection_queue_size;
    config.max_connection_time = Duration::from_millis(cli.max_connection_time);
    config.memory_limit_mb = cli.memory_limit_mb;

    config.stream_buffer_bytes = cli.stream_buffer_size;
    config.connection_check_disabled = cli.disable_connection_check;
    config.connection_check_interval = cli.connection_check_interval;

    config.anon_token_enabled = cli.anon_token_enabled;
    config.think_tags_mode = cli
        .think_tags_mode
        .parse::<ThinkTagsMode>()
        .map_err(|message| Report::new(Error::Config).attach_printable(message))?;

    config.default_api_key = cli.default_key.clone();
    config.upstream_url = cli.upstream_url.clone();
    config.upstream_token = cli.upstream_token.clone();

    config.debug_mode = cli.debug_mode;
    config.enable_metrics = cli.enable_metrics;
    config.enable_detailed_logging = cli.enable_detailed_logging;
    config.log_user_messages = cli.log_user_messages;
    config.log_response_content = cli.log_response_content;

    Ok(config)
}
