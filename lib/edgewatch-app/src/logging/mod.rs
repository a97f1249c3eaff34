//! Logging.

use std::path::Path;

use edgewatch_error::{generic_error, GenericError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

mod layer;
use self::layer::build_formatting_layer;

/// Keeps the background log writers alive.
///
/// Must be held until the application is about to exit so that buffered lines are flushed.
#[derive(Default)]
pub struct LoggingGuard {
    worker_guards: Vec<WorkerGuard>,
}

impl LoggingGuard {
    fn add_worker_guard(&mut self, guard: WorkerGuard) {
        self.worker_guards.push(guard);
    }
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered once by the configured level directives and then fanned out to every configured output: the
/// console (standard output) and, if set, a log file. Each output writes through a non-blocking background writer.
///
/// # Errors
///
/// If the log file cannot be opened, or the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let mut configured_layers = Vec::new();
    let mut logging_guard = LoggingGuard::default();

    if config.log_to_console {
        let (nb_stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
        logging_guard.add_worker_guard(guard);

        configured_layers.push(build_formatting_layer(config, nb_stdout));
    }

    if !config.log_file.is_empty() {
        let path = Path::new(&config.log_file);
        let file_name = path
            .file_name()
            .ok_or_else(|| generic_error!("Log file path '{}' has no file name.", config.log_file))?;
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(directory)
            .map_err(|e| generic_error!("Failed to create log directory '{}': {}", directory.display(), e))?;

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (nb_appender, guard) = tracing_appender::non_blocking(appender);
        logging_guard.add_worker_guard(guard);

        configured_layers.push(build_formatting_layer(config, nb_appender));
    }

    // Filter once, ahead of the fan-out.
    tracing_subscriber::registry()
        .with(configured_layers.with_filter(config.log_level.as_env_filter()))
        .try_init()?;

    Ok(logging_guard)
}
