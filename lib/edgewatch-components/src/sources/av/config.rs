use std::time::Duration;

use edgewatch_config::{
    deser::{Milliseconds, Seconds},
    ConfigurationError,
};
use edgewatch_core::sample::{ImageFrame, PixelFormat};
use serde::Deserialize;
use serde_with::serde_as;

const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

const fn default_width() -> u32 {
    640
}

const fn default_height() -> u32 {
    480
}

fn default_stop_input() -> String {
    "q".to_string()
}

const fn default_queue_capacity() -> usize {
    10
}

const fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_terminate_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_kill_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_min_healing_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_heal_recovery_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_respawn_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_niceness() -> i32 {
    10
}

fn default_command() -> Vec<String> {
    [
        "ffmpeg",
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-i",
        "{uri}",
        "-vf",
        "scale={width}:{height}",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "{pix_fmt}",
        "pipe:1",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Audio/video source configuration.
///
/// The worker command must write raw frames of exactly `width * height * bytes_per_pixel` bytes to its standard output,
/// and treat `stop_input` on its standard input as a request to exit.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct AvSourceConfiguration {
    /// Source URI handed to the worker command.
    pub uri: String,

    /// Frame width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,

    /// Pixel format of the frames.
    #[serde(default)]
    pub pixel_format: PixelFormat,

    /// Worker program and arguments.
    ///
    /// `{uri}`, `{width}`, `{height}` and `{pix_fmt}` are substituted in every argument. Defaults to an `ffmpeg`
    /// invocation decoding the URI to raw video.
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Written to the worker's standard input to ask it to stop.
    #[serde(default = "default_stop_input")]
    pub stop_input: String,

    /// Number of frames buffered between the worker and the pipeline.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a read from the sample queue waits before checking on the worker.
    #[serde_as(as = "Milliseconds")]
    #[serde(rename = "poll_timeout_ms", default = "default_poll_timeout")]
    pub poll_timeout: Duration,

    /// How long the worker gets to exit after being asked to.
    #[serde_as(as = "Seconds")]
    #[serde(rename = "stop_timeout_secs", default = "default_stop_timeout")]
    pub stop_timeout: Duration,

    /// How long the worker gets to exit after being sent `SIGTERM`.
    #[serde_as(as = "Seconds")]
    #[serde(rename = "terminate_timeout_secs", default = "default_terminate_timeout")]
    pub terminate_timeout: Duration,

    /// How long to wait for the worker to be reaped after being sent `SIGKILL`.
    #[serde_as(as = "Seconds")]
    #[serde(rename = "kill_timeout_secs", default = "default_kill_timeout")]
    pub kill_timeout: Duration,

    /// Minimum time between two heals.
    #[serde_as(as = "Seconds")]
    #[serde(rename = "min_healing_interval_secs", default = "default_min_healing_interval")]
    pub min_healing_interval: Duration,

    /// Pause after stopping the worker during a heal, before a new one is spawned.
    #[serde_as(as = "Milliseconds")]
    #[serde(rename = "heal_recovery_delay_ms", default = "default_heal_recovery_delay")]
    pub heal_recovery_delay: Duration,

    /// Pause before spawning a new worker after the previous one ended or failed to spawn.
    #[serde_as(as = "Milliseconds")]
    #[serde(rename = "respawn_delay_ms", default = "default_respawn_delay")]
    pub respawn_delay: Duration,

    /// Scheduling priority adjustment applied to the worker.
    #[serde(default = "default_niceness")]
    pub niceness: i32,
}

impl AvSourceConfiguration {
    /// Creates a new `AvSourceConfiguration` for the given URI, with every other setting at its default.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            width: default_width(),
            height: default_height(),
            pixel_format: PixelFormat::default(),
            command: default_command(),
            stop_input: default_stop_input(),
            queue_capacity: default_queue_capacity(),
            poll_timeout: default_poll_timeout(),
            stop_timeout: default_stop_timeout(),
            terminate_timeout: default_terminate_timeout(),
            kill_timeout: default_kill_timeout(),
            min_healing_interval: default_min_healing_interval(),
            heal_recovery_delay: default_heal_recovery_delay(),
            respawn_delay: default_respawn_delay(),
            niceness: default_niceness(),
        }
    }

    /// Checks settings that deserialize fine but cannot be run.
    ///
    /// # Errors
    ///
    /// If the frame geometry has no pixels, an error is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 {
                return Err(ConfigurationError::InvalidValue {
                    field: field.to_string(),
                    reason: "frame dimensions must be non-zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Size in bytes of a single frame.
    pub fn frame_len(&self) -> usize {
        ImageFrame::frame_len(self.width, self.height, self.pixel_format)
    }

    /// Worker program and arguments with placeholders substituted.
    pub fn command_line(&self) -> Vec<String> {
        let width = self.width.to_string();
        let height = self.height.to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{uri}", &self.uri)
                    .replace("{width}", &width)
                    .replace("{height}", &height)
                    .replace("{pix_fmt}", self.pixel_format.ffmpeg_name())
            })
            .collect()
    }

    /// Upper bound on how long stopping a worker can take.
    pub fn shutdown_budget(&self) -> Duration {
        self.stop_timeout + self.terminate_timeout + self.kill_timeout + SHUTDOWN_MARGIN
    }
}
