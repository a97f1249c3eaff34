//! Pipe elements that analyze samples.

mod face_detect;
pub use self::face_detect::FaceDetector;

mod object_detect;
pub use self::object_detect::ObjectDetector;
