use crate::cli::FlameTunnelCli;
use clap::Parser;

/// Initialise the CLI and logging for the flame tunnel runner.
pub fn init() -> FlameTunnelCli {
    env_logger::init();

    FlameTunnelCli::parse()
}
