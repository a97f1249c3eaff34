use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Runs video pipelines on edge devices and keeps them healthy.
#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Start every configured pipeline and supervise them until interrupted.
    #[command(name = "run")]
    Run(ConfigArgs),

    /// Load the configuration and report the pipelines that would be built.
    #[command(name = "check-config")]
    CheckConfig(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    /// Path to the configuration file.
    ///
    /// Settings can be overridden with `EDGEWATCH_`-prefixed environment variables, using `__` to separate nested
    /// keys (`EDGEWATCH_HEALTH__WARN_THRESHOLD_SECS=20`).
    #[arg(short = 'c', long, default_value = "/etc/edgewatch/config.yaml")]
    pub config: PathBuf,
}
