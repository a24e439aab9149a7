use log::{debug, LevelFilter};
use std::time::{SystemTime, UNIX_EPOCH};
use time::macros::format_description;
use tracing_subscriber::filter::EnvFilter as TracingEnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use url::Url;

use crate::cli::command::Commands;
use crate::cli::Cli;

const NOISY_TARGETS: &[&str] = &[
    "reqwest",
    "hyper",
    "hyper_util",
    "alloy",
    "libp2p",
    "libp2p_swarm",
    "libp2p_kad",
    "libp2p_mdns",
    "actix_server",
];

struct SimpleTimeFormatter;

impl FormatTime for SimpleTimeFormatter {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let datetime = time::OffsetDateTime::from_unix_timestamp(timestamp as i64)
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);

        let format = format_description!("[hour]:[minute]:[second]");
        let formatted = datetime
            .format(format)
            .unwrap_or_else(|_| String::from("??:??:??"));

        write!(w, "{formatted}")
    }
}

/// Installs the global subscriber. `log` records are bridged into tracing by
/// `init()`.
pub fn setup_logging(cli: Option<&Cli>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut log_level = LevelFilter::Info;
    let mut loki_url: Option<String> = None;
    let mut node_name: Option<String> = None;

    if let Some(Cli {
        command:
            Commands::Run {
                loki_url: cmd_loki_url,
                log_level: cmd_log_level,
                config,
                ..
            },
    }) = cli
    {
        loki_url = cmd_loki_url.clone();
        if let Some(level) = cmd_log_level {
            log_level = level.parse()?;
        }
        node_name = config
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
    }

    let mut env_filter =
        TracingEnvFilter::from_default_env().add_directive(format!("{log_level}").parse()?);
    for target in NOISY_TARGETS {
        env_filter = env_filter.add_directive(format!("{target}=warn").parse()?);
    }
    let env_filter = env_filter.add_directive("tracing::span=warn".parse()?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_timer(SimpleTimeFormatter)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if let Some(loki_url_str) = loki_url {
        let loki_url_parsed = Url::parse(&loki_url_str)?;

        let (loki_layer, task) = tracing_loki::builder()
            .label("app", "provider-node")?
            .label("version", env!("CARGO_PKG_VERSION"))?
            .label("config", node_name.unwrap_or_else(|| "default".to_string()))?
            .build_url(loki_url_parsed)?;

        tokio::spawn(task);
        registry.with(loki_layer).init();
        debug!("Logging to console and Loki at {loki_url_str}");
    } else {
        registry.init();
    }

    Ok(())
}
