use edgewatch_core::{
    element::{single, PipeElement, SampleOutputs},
    sample::{BoundingBox, DetectionSample, InferenceMeta, Sample},
};
use edgewatch_error::{ErrorContext as _, GenericError};
use tracing::debug;

use crate::inference::{DetectionFilter, InferenceEngine};

const PERSON_LABEL: &str = "person";

/// Detects faces inside the person boxes found by an earlier detector.
///
/// Each person box at or above this detector's confidence threshold is cropped out of the frame and analyzed on its
/// own, producing one sample per person. Samples with no person boxes are reduced to [`Sample::Empty`].
pub struct FaceDetector {
    name: String,
    engine: Box<dyn InferenceEngine>,
    filter: DetectionFilter,
}

impl FaceDetector {
    /// Element name in pipeline definitions.
    pub const NAME: &'static str = "detect_faces";

    const DISPLAY: &'static str = "Face Detection";

    /// Creates a new `FaceDetector`.
    pub fn new(engine: Box<dyn InferenceEngine>, filter: DetectionFilter) -> Self {
        Self {
            name: Self::NAME.to_string(),
            engine,
            filter,
        }
    }
}

impl PipeElement for FaceDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_sample(&mut self, sample: Sample) -> Result<SampleOutputs<'_>, GenericError> {
        let Sample::Detections(sample) = sample else {
            return Ok(single(Sample::Empty));
        };

        let threshold = self.filter.confidence_threshold();
        let people = sample
            .detections
            .iter()
            .filter(|detection| detection.label == PERSON_LABEL && detection.confidence >= threshold)
            .map(|detection| detection.bbox)
            .collect::<Vec<BoundingBox>>();
        debug!(element = %self.name, people = people.len(), "Received person boxes for face detection.");

        if people.is_empty() {
            return Ok(single(Sample::Empty));
        }

        let image = sample.image;
        Ok(Box::new(people.into_iter().map(move |bbox| -> Result<Sample, GenericError> {
            let person = image.crop(&bbox)?;
            let raw = self
                .engine
                .infer(&person)
                .error_context("Face detection inference failed.")?;
            let detections = self.filter.apply(raw);
            debug!(element = %self.name, faces = detections.len(), "Face detection complete.");

            Ok(Sample::Detections(DetectionSample {
                image: person,
                detections,
                meta: InferenceMeta {
                    display: Self::DISPLAY.to_string(),
                },
            }))
        })))
    }
}
