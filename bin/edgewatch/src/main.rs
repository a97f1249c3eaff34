//! Edge video pipeline daemon.
//!
//! Reads pipeline definitions from a configuration file, runs each pipeline on its own runtime thread, and keeps them
//! healthy by healing any pipeline whose heartbeat goes stale.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{path::Path, time::Instant};

use clap::Parser as _;
use edgewatch_app::prelude::*;
use edgewatch_config::{ConfigurationLoader, GenericConfiguration};
use edgewatch_error::{ErrorContext as _, GenericError};
use tracing::{error, info};

mod check;
use self::check::handle_check_config_command;

mod config;
use self::config::{Action, Cli};

mod run;
use self::run::handle_run_command;

const ENV_PREFIX: &str = "EDGEWATCH";

#[tokio::main]
async fn main() {
    let started = Instant::now();
    let cli = Cli::parse();

    let config_path = match &cli.action {
        Action::Run(args) | Action::CheckConfig(args) => args.config.clone(),
    };

    let configuration = load_configuration(&config_path).unwrap_or_else(|e| {
        fatal_and_exit(format!("failed to load configuration: {:?}", e));
    });

    let logging_config = LoggingConfiguration::from_configuration(&configuration).unwrap_or_else(|e| {
        fatal_and_exit(format!("failed to load logging configuration: {:?}", e));
    });

    let _guard = initialize_logging(&logging_config).unwrap_or_else(|e| {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    });

    let result = match cli.action {
        Action::Run(_) => handle_run_command(started, &configuration).await,
        Action::CheckConfig(_) => handle_check_config_command(&configuration),
    };

    match result {
        Ok(()) => info!("edgewatch stopped."),
        Err(e) => {
            error!("{:?}", e);
            drop(_guard);
            std::process::exit(1);
        }
    }
}

fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let configuration = ConfigurationLoader::default()
        .from_yaml(path)
        .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?
        .from_environment(ENV_PREFIX)
        .error_context("Failed to load configuration from environment.")?
        .into_generic();
    Ok(configuration)
}
