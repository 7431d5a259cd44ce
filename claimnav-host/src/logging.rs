use std::path::PathBuf;

use anyhow::Result;
use tracing::{warn, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn parse_level(raw: &str) -> Level {
    match raw.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn log_dir(custom: Option<&str>) -> PathBuf {
    match custom {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("claimnav")
            .join("logs"),
    }
}

/// Stderr plus a daily-rolling file. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init_logging(level: &str, custom_dir: Option<&str>) -> Result<WorkerGuard> {
    let level = parse_level(level);
    let dir = log_dir(custom_dir);
    let dir_error = std::fs::create_dir_all(&dir).err();

    let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily(&dir, "claimnav-host.log"));
    let filter = || {
        EnvFilter::from_default_env()
            .add_directive(level.into())
            .add_directive("tokio_tungstenite=warn".parse().expect("static directive"))
            .add_directive("tungstenite=warn".parse().expect("static directive"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter()),
        )
        .try_init()?;

    if let Some(e) = dir_error {
        warn!("Failed to create log directory: {}", e);
    }
    tracing::info!(dir = %dir.display(), "logging initialised");
    Ok(guard)
}
