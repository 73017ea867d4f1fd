use clap::Parser;
use eyre::Result;

use breeze::cli::CliOpts;

fn main() -> Result<()> {
    let opts = CliOpts::parse();

    breeze::init()?;
    breeze::banner();

    breeze::cli(opts)
}
