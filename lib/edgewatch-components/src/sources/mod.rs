//! Source implementations.

/// Audio/video source backed by a worker process.
pub mod av;
pub use self::av::{AvSource, AvSourceConfiguration};
