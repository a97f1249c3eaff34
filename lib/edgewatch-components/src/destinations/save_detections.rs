use std::{
    fs::{self, File},
    io::{BufWriter, Write as _},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{Local, NaiveDateTime};
use edgewatch_config::deser::Seconds;
use edgewatch_core::{
    element::{single, PipeElement, SampleOutputs},
    sample::{Detection, ImageFrame, InferenceMeta, Sample},
};
use edgewatch_error::{ErrorContext as _, GenericError};
use image::{DynamicImage, ImageFormat};
use metrics::{counter, Counter};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::{debug, info, warn};

use crate::timeline::PipelineContext;

const DETECTIONS_DIR: &str = "detections";
const FILE_TIME_FORMAT: &str = "%Y%m%d-%H%M%S%.6f";
const EVENT_MESSAGE: &str = "Detection Event";

const fn default_positive_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_idle_interval() -> Duration {
    Duration::from_secs(600)
}

const fn default_thumbnail_size() -> u32 {
    320
}

/// Detection storage configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct SaveDetectionsConfiguration {
    /// Minimum time between two saved samples that have detections.
    #[serde_as(as = "Seconds")]
    #[serde(default = "default_positive_interval")]
    pub positive_interval: Duration,

    /// Minimum time between two saved samples without detections.
    #[serde_as(as = "Seconds")]
    #[serde(default = "default_idle_interval")]
    pub idle_interval: Duration,

    /// Largest width or height of the saved thumbnail. Smaller images are saved as is.
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

impl Default for SaveDetectionsConfiguration {
    fn default() -> Self {
        Self {
            positive_interval: default_positive_interval(),
            idle_interval: default_idle_interval(),
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

#[derive(Serialize)]
struct SavedSample<'a> {
    id: String,
    datetime: String,
    image_file_name: String,
    thumbnail_file_name: String,
    json_file_name: String,
    rel_dir: &'a str,
    inference_result: &'a [Detection],
    inference_meta: Option<&'a InferenceMeta>,
}

/// Saves images and their detections to disk, at a bounded rate.
///
/// Samples with detections are saved at most once per `positive_interval`, samples without at most once per
/// `idle_interval`, so a quiet camera still leaves an occasional trace. Every sample is forwarded unchanged, whether or
/// not it was saved.
pub struct SaveDetections {
    name: String,
    context: PipelineContext,
    config: SaveDetectionsConfiguration,
    output_dir: PathBuf,
    rel_dir: String,
    last_positive: Option<Instant>,
    last_idle: Option<Instant>,
    saved_total: Counter,
}

impl SaveDetections {
    /// Element name in pipeline definitions.
    pub const NAME: &'static str = "save_detections";

    /// Creates a new `SaveDetections`.
    ///
    /// Samples go to a new directory under `<data_dir>/detections`, named after the current time.
    ///
    /// # Errors
    ///
    /// If the output directory cannot be created, an error is returned.
    pub fn new(config: SaveDetectionsConfiguration, context: PipelineContext) -> Result<Self, GenericError> {
        let rel_dir = format!("{}/{}", DETECTIONS_DIR, Local::now().format(FILE_TIME_FORMAT));
        let output_dir = context.data_dir().join(&rel_dir);
        fs::create_dir_all(&output_dir)
            .with_error_context(|| format!("Failed to create output directory '{}'.", output_dir.display()))?;
        debug!(pipeline = %context.pipeline_name(), output_dir = %output_dir.display(), "Saving detections.");

        Ok(Self {
            name: Self::NAME.to_string(),
            saved_total: counter!("edgewatch_detections_saved_total", "pipeline" => context.pipeline_name().to_string()),
            context,
            config,
            output_dir,
            rel_dir,
            last_positive: None,
            last_idle: None,
        })
    }

    /// Directory samples are written to.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
        last.map_or(true, |last| now.duration_since(last) >= interval)
    }

    fn save(
        &self, image: &ImageFrame, detections: &[Detection], meta: Option<&InferenceMeta>,
    ) -> Result<(), GenericError> {
        let now = Local::now().naive_local();
        let prefix = now.format(FILE_TIME_FORMAT);
        let image_file_name = format!("{}-image.jpg", prefix);
        let thumbnail_file_name = format!("{}-thumbnail.jpg", prefix);
        let json_file_name = format!("{}-inference.json", prefix);

        let image = image.to_image();
        write_jpeg(&self.output_dir.join(&image_file_name), &image)?;
        let size = self.config.thumbnail_size;
        if image.width() > size || image.height() > size {
            write_jpeg(&self.output_dir.join(&thumbnail_file_name), &image.thumbnail(size, size))?;
        } else {
            write_jpeg(&self.output_dir.join(&thumbnail_file_name), &image)?;
        }

        for detection in detections {
            info!(
                pipeline = %self.context.pipeline_name(),
                label = %detection.label,
                confidence = detection.confidence,
                "Saving detection."
            );
        }

        let saved = SavedSample {
            id: uuid::Uuid::new_v4().simple().to_string(),
            datetime: iso_datetime(&now),
            image_file_name,
            thumbnail_file_name,
            json_file_name,
            rel_dir: &self.rel_dir,
            inference_result: detections,
            inference_meta: meta,
        };

        let json_path = self.output_dir.join(&saved.json_file_name);
        let file = File::create(&json_path)
            .with_error_context(|| format!("Failed to create '{}'.", json_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &saved)
            .with_error_context(|| format!("Failed to write '{}'.", json_path.display()))?;
        writer
            .flush()
            .with_error_context(|| format!("Failed to write '{}'.", json_path.display()))?;

        self.saved_total.increment(1);
        debug!(pipeline = %self.context.pipeline_name(), json = %json_path.display(), "Saved detection sample.");

        if let Err(e) = self.context.record_event(EVENT_MESSAGE, &saved) {
            warn!(pipeline = %self.context.pipeline_name(), error = %e, "Failed to record timeline event.");
        }
        Ok(())
    }
}

impl PipeElement for SaveDetections {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_sample(&mut self, sample: Sample) -> Result<SampleOutputs<'_>, GenericError> {
        let (image, detections, meta) = match &sample {
            Sample::Empty => return Ok(single(sample)),
            Sample::Image(image) => (image, &[][..], None),
            Sample::Detections(detected) => (&detected.image, &detected.detections[..], Some(&detected.meta)),
        };

        let now = Instant::now();
        let positive = !detections.is_empty();
        let (last, interval) = if positive {
            (self.last_positive, self.config.positive_interval)
        } else {
            (self.last_idle, self.config.idle_interval)
        };

        if Self::due(last, interval, now) {
            match self.save(image, detections, meta) {
                Ok(()) if positive => self.last_positive = Some(now),
                Ok(()) => self.last_idle = Some(now),
                Err(e) => warn!(element = %self.name, error = %e, "Failed to save sample."),
            }
        }

        Ok(single(sample))
    }
}

fn iso_datetime(datetime: &NaiveDateTime) -> String {
    datetime.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn write_jpeg(path: &Path, image: &DynamicImage) -> Result<(), GenericError> {
    image
        .save_with_format(path, ImageFormat::Jpeg)
        .with_error_context(|| format!("Failed to write '{}'.", path.display()))
}
