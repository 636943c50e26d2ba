//! Keeps the `log` macro family wired into the tracing framework so that all
//! components share one stderr sink.

use anyhow::Context as _;
use anyhow::Result;
use tracing_log::AsTrace as _;
use tracing_log::LogTracer;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;

/// Installs the global logger. `level` comes from the `-v`/`-q` counting
/// arguments and bounds what reaches stderr; the `log` macros used throughout
/// the crate are forwarded into `tracing`.
pub fn init(level: log::LevelFilter) -> Result<()> {
    LogTracer::init().context("log-to-tracing bridge already installed")?;
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_filter(level.as_trace()),
    );
    tracing::subscriber::set_global_default(subscriber)
        .context("global tracing subscriber already installed")?;
    log::set_max_level(level);
    Ok(())
}
