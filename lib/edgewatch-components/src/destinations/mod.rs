//! Pipe elements that persist samples.

mod save_detections;
pub use self::save_detections::{SaveDetections, SaveDetectionsConfiguration};
