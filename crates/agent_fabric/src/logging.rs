use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,agent_fabric=debug";

/// Log to a daily-rotated file under `logs_dir` (named `fabric.<date>`).
/// `RUST_LOG` overrides `filter`. Keep the returned guard alive for as long
/// as the process logs; dropping it flushes pending writes.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "fabric");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

/// Compact console logging, for agents running in a terminal.
pub fn init_console_logging(filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(fmt::layer().with_target(false).with_thread_ids(false).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

fn env_filter(fallback: &str) -> EnvFilter {
    filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(), fallback)
}

/// `directives` if it parses, `fallback` otherwise.
fn filter_from(directives: Option<&str>, fallback: &str) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}
