use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(about, long_about = None)]
pub struct FlameTunnelCli {
    /// A TOML file overriding the session's commands, timings, scenarios and filters.
    ///
    /// Every field in the file is optional. Fields that are present replace the values the
    /// session defines in code.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// The directory under which each run creates its own output directory
    #[clap(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Only run the named scenario. Can be given multiple times, scenarios still run in the order
    /// the session defines them.
    #[clap(short, long)]
    pub scenario: Vec<String>,

    /// Override the profiling duration of every scenario, in seconds
    #[clap(long)]
    pub duration: Option<u64>,

    /// Start without asking for confirmation
    #[clap(short, long, default_value = "false")]
    pub yes: bool,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,

    /// Don't profile anything, re-run folding and rendering over the `.raw` files in this directory
    #[clap(long, value_name = "DIR")]
    pub analyze: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_scenarios() {
        let cli = FlameTunnelCli::parse_from([
            "tcp_server",
            "-s",
            "warm_up",
            "--scenario",
            "mixed",
            "--duration",
            "3",
            "-y",
        ]);

        assert_eq!(cli.scenario, vec!["warm_up", "mixed"]);
        assert_eq!(cli.duration, Some(3));
        assert!(cli.yes);
        assert!(!cli.no_progress);
        assert_eq!(cli.analyze, None);
    }
}
