use std::io;

use color_eyre::owo_colors::OwoColorize;
use eyre::Result;
use tracing_subscriber::EnvFilter;

pub mod cli;
pub mod config;
pub mod defs;
pub mod device;
pub mod emitter;
pub mod event_log;
pub mod queue;
pub mod scheduler;
pub mod server;

mod misc;

const DEFAULT_FILTER: &str = "breeze=info";

/// Installs the error report handler and the log subscriber. `RUST_LOG`
/// overrides the default filter.
pub fn init() -> Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    Ok(())
}

pub fn banner() {
    let target = match (option_env!("BREEZE_TARGET_ARCH"), option_env!("BREEZE_TARGET_OS")) {
        (Some(arch), Some(os)) => format!("{arch}-{os}"),
        _ => "unknown target".to_owned(),
    };

    eprintln!(
        "{} {} {}",
        env!("CARGO_PKG_NAME").bold(),
        env!("CARGO_PKG_VERSION"),
        format!("({target}, {})", option_env!("BREEZE_PROFILE").unwrap_or("unknown")).dimmed(),
    );
}

pub fn cli(opts: cli::CliOpts) -> Result<()> {
    cli::execute(opts)
}
