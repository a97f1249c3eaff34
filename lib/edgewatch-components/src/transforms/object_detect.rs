use std::time::Instant;

use edgewatch_core::{
    element::{single, PipeElement, SampleOutputs},
    sample::{DetectionSample, ImageFrame, InferenceMeta, Sample},
};
use edgewatch_error::{ErrorContext as _, GenericError};
use tracing::{debug, trace};

use crate::inference::{DetectionFilter, InferenceEngine};

/// Detects objects in images.
///
/// Every image is turned into a detection sample, even when nothing was detected, so later elements see the frame.
/// Detection samples are analyzed again and their previous results replaced.
pub struct ObjectDetector {
    name: String,
    engine: Box<dyn InferenceEngine>,
    filter: DetectionFilter,
    last_inference: Option<Instant>,
}

impl ObjectDetector {
    /// Element name in pipeline definitions.
    pub const NAME: &'static str = "detect_objects";

    const DISPLAY: &'static str = "Object Detection";

    /// Creates a new `ObjectDetector`.
    pub fn new(engine: Box<dyn InferenceEngine>, filter: DetectionFilter) -> Self {
        Self {
            name: Self::NAME.to_string(),
            engine,
            filter,
            last_inference: None,
        }
    }

    fn detect(&mut self, image: ImageFrame) -> Result<Sample, GenericError> {
        let started = Instant::now();
        let raw = self
            .engine
            .infer(&image)
            .error_context("Object detection inference failed.")?;
        let detections = self.filter.apply(raw);

        let finished = Instant::now();
        let fps = self
            .last_inference
            .map(|previous| 1.0 / finished.duration_since(previous).as_secs_f64().max(f64::EPSILON));
        self.last_inference = Some(finished);
        trace!(
            element = %self.name,
            inference_ms = finished.duration_since(started).as_secs_f64() * 1000.0,
            fps,
            detections = detections.len(),
            "Inference complete."
        );

        Ok(Sample::Detections(DetectionSample {
            image,
            detections,
            meta: InferenceMeta {
                display: Self::DISPLAY.to_string(),
            },
        }))
    }
}

impl PipeElement for ObjectDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_sample(&mut self, sample: Sample) -> Result<SampleOutputs<'_>, GenericError> {
        let image = match sample {
            Sample::Empty => return Ok(single(Sample::Empty)),
            Sample::Image(image) => image,
            Sample::Detections(previous) => {
                debug!(element = %self.name, previous = previous.detections.len(), "Replacing earlier detections.");
                previous.image
            }
        };

        self.detect(image).map(single)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use edgewatch_core::sample::PixelFormat;

    use super::*;
    use crate::inference::tests::{coco_labels, raw, ScriptedEngine};

    fn frame() -> ImageFrame {
        ImageFrame::new(4, 2, PixelFormat::Gray8, Bytes::from_static(&[0; 8])).unwrap()
    }

    fn detector(results: Vec<Result<Vec<crate::inference::RawDetection>, String>>) -> ObjectDetector {
        ObjectDetector::new(
            Box::new(ScriptedEngine::new(results)),
            DetectionFilter::new(coco_labels(), 0.6, 3),
        )
    }

    fn collect(detector: &mut ObjectDetector, sample: Sample) -> Vec<Sample> {
        detector
            .process_sample(sample)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn image_becomes_filtered_detections() {
        let mut detector = detector(vec![Ok(vec![raw(0, 0.9), raw(2, 0.4)])]);

        let outputs = collect(&mut detector, Sample::Image(frame()));
        assert_eq!(outputs.len(), 1);
        let Sample::Detections(sample) = &outputs[0] else {
            panic!("expected detections, got {}", outputs[0].kind());
        };
        assert_eq!(sample.image, frame());
        assert_eq!(sample.detections.len(), 1);
        assert_eq!(sample.detections[0].label, "person");
        assert_eq!(sample.meta.display, "Object Detection");
    }

    #[test]
    fn nothing_detected_still_forwards_frame() {
        let mut detector = detector(vec![Ok(Vec::new())]);

        let outputs = collect(&mut detector, Sample::Image(frame()));
        assert!(matches!(&outputs[..], [Sample::Detections(sample)] if sample.detections.is_empty()));
    }

    #[test]
    fn empty_marker_passes_through_without_inference() {
        let engine = ScriptedEngine::new(Vec::new());
        let seen = engine.seen.clone();
        let mut detector = ObjectDetector::new(Box::new(engine), DetectionFilter::new(coco_labels(), 0.6, 3));

        assert_eq!(collect(&mut detector, Sample::Empty), vec![Sample::Empty]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn inference_failure_drops_sample() {
        let mut detector = detector(vec![Err("tensor mismatch".to_string())]);
        assert!(detector.process_sample(Sample::Image(frame())).is_err());
    }
}
