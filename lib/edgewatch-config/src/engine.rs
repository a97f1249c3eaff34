use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use figment::value::{Dict, Tag, Value};
use serde::{de::DeserializeOwned, Deserialize};
use serde_with::serde_as;

use crate::{deser::Seconds, ConfigurationError};

/// Default root directory for detections and the timeline.
pub const DEFAULT_DATA_DIR: &str = "./data";

const fn default_warn_threshold() -> Duration {
    Duration::from_secs(10)
}

const fn default_terminal_threshold() -> Duration {
    Duration::from_secs(60)
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_process_heartbeat_threshold() -> Duration {
    Duration::from_secs(180)
}

const fn default_timeline_max_bytes() -> u64 {
    100 * 1024
}

const fn default_timeline_backups() -> usize {
    100
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct EdgewatchConfiguration {
    /// Root directory for everything the engine writes.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Health polling and healing thresholds.
    #[serde(default)]
    pub health: HealthConfiguration,

    /// Timeline event log settings.
    #[serde(default)]
    pub timeline: TimelineConfiguration,

    /// Named source definitions that pipelines can reference.
    #[serde(default)]
    pub sources: BTreeMap<String, Value>,

    /// Pipelines by name, each an ordered list of element definitions.
    #[serde(default)]
    pub pipelines: BTreeMap<String, Vec<ElementDefinition>>,
}

/// Health polling and healing thresholds.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct HealthConfiguration {
    /// Time without a heartbeat after which a pipeline is healed.
    #[serde_as(as = "Seconds")]
    #[serde(rename = "warn_threshold_secs", default = "default_warn_threshold")]
    pub warn_threshold: Duration,

    /// Time without a heartbeat after which a pipeline is reported as unrecoverable.
    #[serde_as(as = "Seconds")]
    #[serde(rename = "terminal_threshold_secs", default = "default_terminal_threshold")]
    pub terminal_threshold: Duration,

    /// How often pipeline health is polled.
    #[serde_as(as = "Seconds")]
    #[serde(rename = "poll_interval_secs", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Time without any pipeline heartbeat after which the whole server is healed.
    #[serde_as(as = "Seconds")]
    #[serde(
        rename = "process_heartbeat_threshold_secs",
        default = "default_process_heartbeat_threshold"
    )]
    pub process_heartbeat_threshold: Duration,
}

impl Default for HealthConfiguration {
    fn default() -> Self {
        Self {
            warn_threshold: default_warn_threshold(),
            terminal_threshold: default_terminal_threshold(),
            poll_interval: default_poll_interval(),
            process_heartbeat_threshold: default_process_heartbeat_threshold(),
        }
    }
}

/// Timeline event log settings.
#[derive(Clone, Debug, Deserialize)]
pub struct TimelineConfiguration {
    /// Path of the event log. Relative to `data_dir` when not absolute. Defaults to `timeline-event-log.yaml`.
    #[serde(default)]
    pub event_log: Option<PathBuf>,

    /// Size past which the event log is rolled over.
    #[serde(default = "default_timeline_max_bytes")]
    pub max_bytes: u64,

    /// Number of rolled over files to keep.
    #[serde(default = "default_timeline_backups")]
    pub backups: usize,
}

impl Default for TimelineConfiguration {
    fn default() -> Self {
        Self {
            event_log: None,
            max_bytes: default_timeline_max_bytes(),
            backups: default_timeline_backups(),
        }
    }
}

impl TimelineConfiguration {
    /// Resolves the event log path against the data directory.
    pub fn event_log_path(&self, data_dir: &std::path::Path) -> PathBuf {
        match &self.event_log {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => data_dir.join(path),
            None => data_dir.join("timeline-event-log.yaml"),
        }
    }
}

/// One `(element type, element parameters)` entry of a pipeline.
///
/// Written in YAML as a single-key mapping, for example `- save_detections: { positive_interval: 2 }`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "BTreeMap<String, Value>")]
pub struct ElementDefinition {
    name: String,
    params: Value,
}

impl ElementDefinition {
    /// Creates a new `ElementDefinition`.
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Element type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw element parameters.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Deserializes the parameters as `T`.
    ///
    /// An element listed without parameters deserializes as an empty mapping, so `T` can rely on field defaults.
    ///
    /// # Errors
    ///
    /// If the parameters do not match `T`, an error is returned.
    pub fn params_as<T>(&self) -> Result<T, ConfigurationError>
    where
        T: DeserializeOwned,
    {
        let result = match &self.params {
            Value::Empty(..) => Value::Dict(Tag::Default, Dict::new()).deserialize(),
            params => params.deserialize(),
        };
        result.map_err(Into::into)
    }
}

impl TryFrom<BTreeMap<String, Value>> for ElementDefinition {
    type Error = ConfigurationError;

    fn try_from(entry: BTreeMap<String, Value>) -> Result<Self, Self::Error> {
        let keys = entry.len();
        let mut entries = entry.into_iter();
        match (entries.next(), keys) {
            (Some((name, params)), 1) => Ok(Self { name, params }),
            _ => Err(ConfigurationError::InvalidElementEntry { keys }),
        }
    }
}
