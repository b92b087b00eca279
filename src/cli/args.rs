use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Block or impair network traffic of a process (or the whole host) from an interactive prompt"
)]
pub struct Args {
    /// Process to block: substring of the executable name on Windows, exact name on Linux
    #[arg(value_name = "TARGET")]
    pub target: Option<String>,

    /// Path to configuration file (TOML)
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Base name of the firewall rules created on Windows
    #[arg(long = "rule-name", value_name = "NAME")]
    pub rule_name: Option<String>,

    /// Wait for host-wide impairment rules to be installed before reporting success
    #[arg(long = "confirm")]
    pub confirm: bool,

    /// Print firewall commands instead of running them
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}
