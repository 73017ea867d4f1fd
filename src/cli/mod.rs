use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::Result;

mod config;
mod run;
mod send;

#[derive(Parser)]
#[command(version, about)]
pub struct CliOpts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a configuration file and print it
    Config {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Run the simulated fan until interrupted
    Run {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Post a command to a running device over HTTP
    Send {
        #[arg(short, long, default_value = "http://127.0.0.1:5001")]
        url: String,
        #[arg(short, long)]
        device: String,
        /// Start, Stop or SetSpeed
        action: String,
        /// Speed for SetSpeed
        value: Option<f64>,
    },
}

#[tokio::main]
pub async fn execute(opts: CliOpts) -> Result<()> {
    match opts.command {
        Command::Config { config } => self::config::read_and_print(&config).await,
        Command::Run { config } => self::run::launch(&config).await,

        Command::Send {
            url,
            device,
            action,
            value,
        } => self::send::post_command(&url, &device, &action, value).await,
    }
}
