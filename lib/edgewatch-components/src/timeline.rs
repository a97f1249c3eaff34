//! Pipeline event timeline.
//!
//! Notable pipeline events (saved detections, for now) are appended to a YAML file as list items, so the whole file
//! always parses as a single list. The file is rolled over once it grows past a size limit, keeping a fixed number of
//! numbered backups (`<name>.1` being the most recent).

use std::{
    fs::{self, File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use edgewatch_config::TimelineConfiguration;
use edgewatch_error::{ErrorContext as _, GenericError};
use serde::Serialize;
use tracing::debug;

#[derive(Serialize)]
struct TimelineEvent<'a, A> {
    id: String,
    message: &'a str,
    created: f64,
    priority: &'static str,
    args: &'a A,
    pipeline_context: &'a PipelineContext,
}

struct RollingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: Option<File>,
    written: u64,
}

impl RollingFile {
    fn write(&mut self, record: &[u8]) -> Result<(), GenericError> {
        if self.max_bytes > 0 && self.written > 0 && self.written + record.len() as u64 > self.max_bytes {
            self.roll_over()?;
        }

        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_error_context(|| format!("Failed to open event log '{}'.", self.path.display()))?;
            self.written = file.metadata().map(|metadata| metadata.len()).unwrap_or(0);
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(record)
                .with_error_context(|| format!("Failed to write to event log '{}'.", self.path.display()))?;
        }
        self.written += record.len() as u64;
        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn roll_over(&mut self) -> Result<(), GenericError> {
        self.file = None;
        self.written = 0;

        if self.backups == 0 {
            return File::create(&self.path)
                .map(drop)
                .with_error_context(|| format!("Failed to truncate event log '{}'.", self.path.display()));
        }

        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))
                    .with_error_context(|| format!("Failed to rotate '{}'.", from.display()))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))
            .with_error_context(|| format!("Failed to rotate event log '{}'.", self.path.display()))?;

        debug!(path = %self.path.display(), "Rolled over event log.");
        Ok(())
    }
}

/// Append-only event log shared by every pipeline.
pub struct EventLog {
    path: PathBuf,
    inner: Mutex<RollingFile>,
}

impl EventLog {
    /// Opens the event log at `path`, creating its parent directories.
    ///
    /// # Errors
    ///
    /// If the parent directories cannot be created, an error is returned.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> Result<Self, GenericError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_error_context(|| format!("Failed to create event log directory '{}'.", parent.display()))?;
        }
        debug!(path = %path.display(), "Timeline events directed to event log.");

        Ok(Self {
            inner: Mutex::new(RollingFile {
                path: path.clone(),
                max_bytes,
                backups,
                file: None,
                written: fs::metadata(&path).map(|metadata| metadata.len()).unwrap_or(0),
            }),
            path,
        })
    }

    /// Opens the event log described by the timeline configuration.
    ///
    /// # Errors
    ///
    /// If the parent directories cannot be created, an error is returned.
    pub fn from_configuration(config: &TimelineConfiguration, data_dir: &Path) -> Result<Self, GenericError> {
        Self::open(config.event_log_path(data_dir), config.max_bytes, config.backups)
    }

    /// Path of the current log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// If the event cannot be serialized or written, an error is returned.
    pub fn record<A>(&self, context: &PipelineContext, message: &str, args: &A) -> Result<(), GenericError>
    where
        A: Serialize,
    {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        let event = TimelineEvent {
            id: uuid::Uuid::new_v4().simple().to_string(),
            message,
            created,
            priority: "INFO",
            args,
            pipeline_context: context,
        };
        let record = serde_yaml::to_string(&[event]).error_context("Failed to serialize timeline event.")?;

        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(record.as_bytes())
    }
}

/// What a pipeline's elements need to know about the pipeline they run in.
#[derive(Clone, Serialize)]
pub struct PipelineContext {
    pipeline_name: String,
    data_dir: PathBuf,
    #[serde(skip)]
    event_log: Option<Arc<EventLog>>,
}

impl PipelineContext {
    /// Creates a new `PipelineContext`.
    pub fn new(pipeline_name: impl Into<String>, data_dir: impl Into<PathBuf>, event_log: Option<Arc<EventLog>>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            data_dir: data_dir.into(),
            event_log,
        }
    }

    /// Name of the pipeline.
    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Root directory for anything the pipeline writes.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Records a timeline event for this pipeline. Does nothing when there is no event log.
    ///
    /// # Errors
    ///
    /// If the event cannot be written, an error is returned.
    pub fn record_event<A>(&self, message: &str, args: &A) -> Result<(), GenericError>
    where
        A: Serialize,
    {
        match &self.event_log {
            Some(event_log) => event_log.record(self, message, args),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("pipeline_name", &self.pipeline_name)
            .field("data_dir", &self.data_dir)
            .field("event_log", &self.event_log.as_ref().map(|log| log.path()))
            .finish()
    }
}

/// Reads every event from an event log file.
///
/// # Errors
///
/// If the file cannot be read or is not a YAML list, an error is returned.
pub fn read_events(path: &Path) -> Result<Vec<serde_yaml::Value>, GenericError> {
    let contents =
        fs::read_to_string(path).with_error_context(|| format!("Failed to read event log '{}'.", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&contents).with_error_context(|| format!("Event log '{}' is malformed.", path.display()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    fn context(dir: &Path, event_log: &Arc<EventLog>) -> PipelineContext {
        PipelineContext::new("front_door", dir, Some(Arc::clone(event_log)))
    }

    #[test]
    fn events_append_as_one_yaml_list() {
        let dir = tempfile::tempdir().unwrap();
        let event_log = Arc::new(EventLog::open(dir.path().join("logs/timeline.yaml"), 0, 0).unwrap());
        let context = context(dir.path(), &event_log);

        context
            .record_event("Detection Event", &json!({ "rel_dir": "detections/1" }))
            .unwrap();
        context.record_event("Detection Event", &json!({ "rel_dir": "detections/2" })).unwrap();

        let events = read_events(event_log.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["message"], serde_yaml::Value::from("Detection Event"));
        assert_eq!(events[1]["args"]["rel_dir"], serde_yaml::Value::from("detections/2"));
        assert_eq!(
            events[0]["pipeline_context"]["pipeline_name"],
            serde_yaml::Value::from("front_door")
        );
        assert_ne!(events[0]["id"], events[1]["id"]);
        assert!(events[0]["created"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn log_rolls_over_past_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.yaml");
        let event_log = Arc::new(EventLog::open(&path, 300, 2).unwrap());
        let context = context(dir.path(), &event_log);

        for index in 0..12 {
            context.record_event("Tick", &json!({ "index": index })).unwrap();
        }

        let backup = |index: usize| PathBuf::from(format!("{}.{}", path.display(), index));
        assert!(backup(1).exists());
        assert!(backup(2).exists());
        assert!(!backup(3).exists());

        // Every file is still a valid list, and the newest event is in the current file.
        let current = read_events(&path).unwrap();
        let older = read_events(&backup(1)).unwrap();
        assert!(!older.is_empty());
        assert_eq!(current.last().unwrap()["args"]["index"], serde_yaml::Value::from(11));
        assert!(fs::metadata(&path).unwrap().len() <= 300);
    }

    #[test]
    fn missing_event_log_is_a_no_op() {
        let context = PipelineContext::new("backyard", "/nonexistent", None);
        assert!(context.record_event("Detection Event", &json!({})).is_ok());
    }
}
