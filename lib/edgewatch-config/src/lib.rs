//! Configuration loading and the typed engine configuration.
//!
//! Configuration is layered: a YAML file provides the base, and prefixed environment variables override it. The merged
//! result can be extracted as a typed value directly, or kept around as a [`GenericConfiguration`] so that different
//! subsystems (logging, the engine) can each pull out the part they care about.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, io, path::PathBuf, sync::Arc};

use edgewatch_error::GenericError;
use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider as _,
};
use serde::Deserialize;
use snafu::Snafu;
use tracing::debug;

pub mod deser;
mod engine;
pub use self::engine::{
    EdgewatchConfiguration, ElementDefinition, HealthConfiguration, TimelineConfiguration, DEFAULT_DATA_DIR,
};

mod provider;
use self::provider::YamlFile;

pub use figment::value;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A required field was missing.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing where the field can be set.
        ///
        /// Includes the environment variable spelling when environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// A field had a different data type than expected.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// A field had a value it does not support.
    #[snafu(display("Invalid value for field '{}': {}", field, reason))]
    InvalidValue {
        /// Name of the field.
        field: String,

        /// Why the value was rejected.
        reason: String,
    },

    /// A pipeline entry was not a mapping with exactly one element name.
    #[snafu(display("Pipeline element entries must map exactly one element name to its parameters, found {} keys.", keys))]
    InvalidElementEntry {
        /// Number of keys found in the entry.
        keys: usize,
    },

    /// A configuration file could not be read.
    #[snafu(display("Failed to read configuration file '{}': {}", path.display(), source))]
    ReadFile {
        /// Path of the file.
        path: PathBuf,

        /// Underlying I/O error.
        source: io::Error,
    },

    /// A configuration file is not valid YAML.
    #[snafu(display("Failed to parse configuration file '{}': {}", path.display(), source))]
    ParseFile {
        /// Path of the file.
        path: PathBuf,

        /// Underlying parse error.
        source: figment::Error,
    },

    /// Any other configuration failure.
    #[snafu(display("Failed to load configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&HashSet::new(), e)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // Prefix is already uppercased with its trailing underscore.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "__").to_uppercase()),
        }
    }
}

struct BoxedProvider(Box<dyn figment::Provider + Send + Sync>);

impl figment::Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// Sources added later take precedence over sources added earlier.
///
/// # Supported sources
///
/// - YAML file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let file = YamlFile::open(path)?;
        self.providers.push(BoxedProvider(Box::new(file)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable, and not being valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match YamlFile::open(&path) {
            Ok(file) => self.providers.push(BoxedProvider(Box::new(file))),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `edgewatch`
    /// matches `EDGEWATCH_LOG_LEVEL`. Nested keys are separated by a double underscore:
    /// `EDGEWATCH_HEALTH__WARN_THRESHOLD_SECS` maps to `health.warn_threshold_secs`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment could not be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` is not `Send + Sync`, so snapshot it into a serialized provider.
        let values = Env::prefixed(&prefix).split("__").data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    fn merged(&self) -> Figment {
        self.providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.merged()
            .extract()
            .map_err(|e| from_figment_error(&self.lookup_sources, e))
    }

    /// Consumes the loader and wraps the merged configuration in a [`GenericConfiguration`].
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.merged(),
                lookup_sources: self.lookup_sources,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// Merged configuration in its raw form.
///
/// Keys use `a.b.c` notation for nested values.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Gets a configuration value by key.
    ///
    /// ## Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract_inner(key)
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// ## Errors
    ///
    /// If the value exists but could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get_typed(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));
            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        nested: Nested,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Nested {
        value: u64,
    }

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn environment_overrides_yaml() {
        let file = yaml_file("name: from-file\nnested:\n  value: 1\n");
        std::env::set_var("EWCFGTEST_NESTED__VALUE", "42");

        let sample: Sample = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .from_environment("ewcfgtest")
            .unwrap()
            .into_typed()
            .unwrap();

        std::env::remove_var("EWCFGTEST_NESTED__VALUE");
        assert_eq!(sample.name, "from-file");
        assert_eq!(sample.nested.value, 42);
    }

    #[test]
    fn missing_yaml_file_is_error_unless_optional() {
        let missing = std::path::Path::new("/nonexistent/edgewatch.yaml");
        assert!(ConfigurationLoader::default().from_yaml(missing).is_err());

        let config = ConfigurationLoader::default().try_from_yaml(missing).into_generic();
        assert!(config.try_get_typed::<String>("name").unwrap().is_none());
    }

    #[test]
    fn missing_field_mentions_environment_spelling() {
        std::env::set_var("EWCFGMISSING_UNRELATED", "1");
        let error = ConfigurationLoader::default()
            .from_environment("ewcfgmissing")
            .unwrap()
            .into_generic()
            .get_typed::<String>("name")
            .unwrap_err();
        std::env::remove_var("EWCFGMISSING_UNRELATED");

        match error {
            ConfigurationError::MissingField { help_text, field } => {
                assert_eq!(field, "name");
                assert!(help_text.contains("EWCFGMISSING_NAME"), "help text was: {}", help_text);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }
}
