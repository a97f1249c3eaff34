use edgewatch_config::{deser::PermissiveBool, GenericConfiguration};
use edgewatch_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use serde_with::serde_as;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_true() -> bool {
    true
}

/// Logging configuration.
///
/// Read from the top level of the application configuration, so `log_level: debug` in YAML and
/// `EDGEWATCH_LOG_LEVEL=debug` in the environment are equivalent.
#[serde_as]
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Level filtering directives, in `EnvFilter` syntax (`info`, `edgewatch_core=debug,info`).
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to emit JSON lines instead of the human-readable format.
    #[serde_as(as = "PermissiveBool")]
    #[serde(default)]
    pub log_format_json: bool,

    /// Whether to log to standard output.
    #[serde_as(as = "PermissiveBool")]
    #[serde(default = "default_true")]
    pub log_to_console: bool,

    /// Log file path. Empty disables file logging.
    #[serde(default)]
    pub log_file: String,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        config
            .as_typed()
            .error_context("Failed to load logging configuration.")
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
            log_to_console: true,
            log_file: String::new(),
        }
    }
}

/// Parsed level filtering directives.
#[derive(Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(EnvFilter);

impl LogLevel {
    /// Returns the filter for these directives.
    pub fn as_env_filter(&self) -> EnvFilter {
        // `EnvFilter` is not `Clone`, so rebuild it from its canonical string form.
        EnvFilter::builder().parse_lossy(self.0.to_string())
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use edgewatch_config::ConfigurationLoader;

    use super::*;

    fn load(contents: &str) -> Result<LoggingConfiguration, GenericError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let config = ConfigurationLoader::default().from_yaml(file.path())?.into_generic();
        LoggingConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults_when_absent() {
        let config = load("data_dir: /tmp\n").unwrap();
        assert_eq!(config.log_level.as_env_filter().to_string(), "info");
        assert!(!config.log_format_json);
        assert!(config.log_to_console);
        assert!(config.log_file.is_empty());
    }

    #[test]
    fn permissive_flags_and_directives() {
        let config = load("log_level: edgewatch_core=debug,warn\nlog_format_json: \"1\"\nlog_to_console: false\n").unwrap();
        assert!(config.log_format_json);
        assert!(!config.log_to_console);
        assert!(config.log_level.as_env_filter().to_string().contains("edgewatch_core=debug"));
    }

    #[test]
    fn empty_level_is_rejected() {
        assert!(load("log_level: \"\"\n").is_err());
    }
}
