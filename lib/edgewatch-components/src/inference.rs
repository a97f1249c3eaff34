//! The seam between detection elements and whatever runs the model.
//!
//! Running a model is left to an [`InferenceProvider`], which turns a [`ModelConfiguration`] into an
//! [`InferenceEngine`]. Engines return raw class ids and scores. Turning those into labeled [`Detection`]s,
//! keeping only the most confident ones, is the job of a [`DetectionFilter`] and is the same for every engine.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use edgewatch_core::sample::{BoundingBox, Detection, ImageFrame};
use edgewatch_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing::debug;

/// A single unlabeled result from an inference engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    /// Class index, as understood by the model's labels file.
    pub class_id: u32,

    /// Confidence score, 0.0 to 1.0.
    pub score: f32,

    /// Normalized bounding box.
    pub bbox: BoundingBox,
}

/// A loaded model, ready to run.
pub trait InferenceEngine: Send {
    /// Runs the model on an image.
    ///
    /// Results do not need to be sorted or filtered.
    ///
    /// # Errors
    ///
    /// If the model cannot be run on the image, an error is returned.
    fn infer(&mut self, image: &ImageFrame) -> Result<Vec<RawDetection>, GenericError>;
}

/// Loads models.
pub trait InferenceProvider: Send + Sync {
    /// Loads the model described by `model`.
    ///
    /// # Errors
    ///
    /// If the model cannot be loaded, an error is returned.
    fn load(&self, model: &ModelConfiguration) -> Result<Box<dyn InferenceEngine>, GenericError>;
}

/// Model files.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ModelConfiguration {
    /// Model for CPU inference.
    pub tflite: PathBuf,

    /// Model compiled for an accelerator, preferred when one is available.
    #[serde(default)]
    pub edgetpu: Option<PathBuf>,
}

impl ModelConfiguration {
    /// Checks that every configured model file exists.
    ///
    /// # Errors
    ///
    /// If a model file does not exist, an error is returned.
    pub fn validate(&self) -> Result<(), GenericError> {
        for path in std::iter::once(&self.tflite).chain(self.edgetpu.as_ref()) {
            if !path.is_file() {
                return Err(generic_error!("Model file '{}' does not exist.", path.display()));
            }
        }
        Ok(())
    }
}

const fn default_confidence_threshold() -> f32 {
    0.8
}

const fn default_top_k() -> usize {
    10
}

/// Detector configuration, shared by every detection element.
#[derive(Clone, Debug, Deserialize)]
pub struct DetectorConfiguration {
    /// Model files.
    pub model: ModelConfiguration,

    /// Labels file mapping class ids to names.
    pub labels: PathBuf,

    /// Minimum score for a detection to be kept.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Maximum number of detections kept per image.
    #[serde(default = "default_top_k", alias = "top-k")]
    pub top_k: usize,
}

impl DetectorConfiguration {
    /// Builds the detection filter described by this configuration, reading the labels file.
    ///
    /// # Errors
    ///
    /// If the labels file cannot be read, an error is returned.
    pub fn filter(&self) -> Result<DetectionFilter, GenericError> {
        let labels = LabelMap::from_file(&self.labels)?;
        Ok(DetectionFilter::new(labels, self.confidence_threshold, self.top_k))
    }

    /// Validates the model files and loads the model through `provider`.
    ///
    /// # Errors
    ///
    /// If the model files are missing or the provider fails to load them, an error is returned.
    pub fn load_engine(&self, provider: &dyn InferenceProvider) -> Result<Box<dyn InferenceEngine>, GenericError> {
        self.model.validate()?;
        debug!(
            model = %self.model.tflite.display(),
            labels = %self.labels.display(),
            confidence_threshold = self.confidence_threshold,
            top_k = self.top_k,
            "Loading model."
        );
        provider.load(&self.model)
    }
}

/// Class id to label mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelMap {
    labels: HashMap<u32, String>,
}

impl LabelMap {
    /// Parses a labels file.
    ///
    /// Lines starting with a number are read as `<id> <label>`. Any other line is a label whose id is its line
    /// number, counting from zero. Blank lines are skipped but still counted.
    pub fn parse(contents: &str) -> Self {
        let labels = contents
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }

                let digits = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
                match line[..digits].parse::<u32>() {
                    Ok(id) if digits < line.len() => Some((id, line[digits..].trim().to_string())),
                    _ => Some((index as u32, line.to_string())),
                }
            })
            .filter(|(_, label)| !label.is_empty())
            .collect();

        Self { labels }
    }

    /// Reads and parses a labels file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, an error is returned.
    pub fn from_file(path: &Path) -> Result<Self, GenericError> {
        let contents = fs::read_to_string(path)
            .with_error_context(|| format!("Failed to read labels file '{}'.", path.display()))?;
        Ok(Self::parse(&contents))
    }

    /// Label for a class id.
    pub fn get(&self, class_id: u32) -> Option<&str> {
        self.labels.get(&class_id).map(String::as_str)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` if there are no labels.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Turns raw engine output into labeled detections.
#[derive(Clone, Debug)]
pub struct DetectionFilter {
    labels: LabelMap,
    confidence_threshold: f32,
    top_k: usize,
}

impl DetectionFilter {
    /// Creates a new `DetectionFilter`.
    pub fn new(labels: LabelMap, confidence_threshold: f32, top_k: usize) -> Self {
        Self {
            labels,
            confidence_threshold,
            top_k,
        }
    }

    /// Minimum score for a detection to be kept.
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Keeps the `top_k` highest scoring detections, then drops those below the threshold.
    ///
    /// Results are ordered from most to least confident. Detections whose class id has no label are dropped.
    pub fn apply(&self, mut raw: Vec<RawDetection>) -> Vec<Detection> {
        raw.sort_by(|a, b| b.score.total_cmp(&a.score));
        raw.truncate(self.top_k);

        raw.into_iter()
            .filter(|detection| detection.score >= self.confidence_threshold)
            .filter_map(|detection| match self.labels.get(detection.class_id) {
                Some(label) => Some(Detection {
                    label: label.to_string(),
                    confidence: detection.score,
                    bbox: detection.bbox,
                }),
                None => {
                    debug!(class_id = detection.class_id, "Dropping detection with unknown class id.");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use similar_asserts::assert_eq;

    use super::*;

    /// Replays scripted results, one batch per call, and records the size of every image it sees.
    pub struct ScriptedEngine {
        pub results: VecDeque<Result<Vec<RawDetection>, String>>,
        pub seen: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl ScriptedEngine {
        pub fn new(results: Vec<Result<Vec<RawDetection>, String>>) -> Self {
            Self {
                results: results.into(),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl InferenceEngine for ScriptedEngine {
        fn infer(&mut self, image: &ImageFrame) -> Result<Vec<RawDetection>, GenericError> {
            self.seen.lock().unwrap().push((image.width(), image.height()));
            match self.results.pop_front() {
                Some(Ok(results)) => Ok(results),
                Some(Err(message)) => Err(generic_error!(message)),
                None => Ok(Vec::new()),
            }
        }
    }

    pub fn raw(class_id: u32, score: f32) -> RawDetection {
        RawDetection {
            class_id,
            score,
            bbox: BoundingBox::new(0.0, 0.0, 0.5, 0.5),
        }
    }

    pub fn coco_labels() -> LabelMap {
        LabelMap::parse("0 person\n1 bicycle\n2 car\n")
    }

    #[test]
    fn labels_parse_numbered_and_plain_lines() {
        let numbered = LabelMap::parse("0  person\n17 cat\n\n  18   dog  \n");
        assert_eq!(numbered.len(), 3);
        assert_eq!(numbered.get(17), Some("cat"));
        assert_eq!(numbered.get(18), Some("dog"));

        let plain = LabelMap::parse("background\nface\n");
        assert_eq!(plain.get(0), Some("background"));
        assert_eq!(plain.get(1), Some("face"));
    }

    #[test]
    fn labels_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LabelMap::from_file(&dir.path().join("missing.txt")).is_err());

        let path = dir.path().join("labels.txt");
        fs::write(&path, "0 person\n").unwrap();
        assert_eq!(LabelMap::from_file(&path).unwrap().get(0), Some("person"));
    }

    #[test]
    fn filter_keeps_top_k_above_threshold() {
        let filter = DetectionFilter::new(coco_labels(), 0.6, 2);
        let detections = filter.apply(vec![raw(2, 0.7), raw(0, 0.9), raw(1, 0.8), raw(0, 0.3)]);

        let summary = detections
            .iter()
            .map(|d| (d.label.as_str(), d.confidence))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![("person", 0.9), ("bicycle", 0.8)]);
    }

    #[test]
    fn filter_threshold_is_inclusive_and_unknown_classes_dropped() {
        let filter = DetectionFilter::new(coco_labels(), 0.5, 10);
        let detections = filter.apply(vec![raw(0, 0.5), raw(99, 0.95), raw(2, 0.49)]);

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "person");
    }

    #[test]
    fn model_files_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let tflite = dir.path().join("model.tflite");
        fs::write(&tflite, b"model").unwrap();

        let mut model = ModelConfiguration { tflite, edgetpu: None };
        assert!(model.validate().is_ok());

        model.edgetpu = Some(dir.path().join("model_edgetpu.tflite"));
        assert!(model.validate().is_err());
    }
}
