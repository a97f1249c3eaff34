//! The contract every long-running unit implements.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use edgewatch_error::GenericError;
use serde::Serialize;

/// Coarse health of a managed unit.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Making progress.
    Ok,

    /// Some part of the unit stalled and is being healed.
    Degraded,

    /// Some part of the unit stalled for longer than healing can be expected to fix.
    Failed,
}

/// A health report: the latest sign of progress and a status label.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HealthStatus {
    /// When the unit last made progress.
    pub latest_heartbeat: Instant,

    /// Status label.
    pub status: ServiceStatus,
}

impl HealthStatus {
    /// Creates a new `HealthStatus`.
    pub const fn new(latest_heartbeat: Instant, status: ServiceStatus) -> Self {
        Self {
            latest_heartbeat,
            status,
        }
    }

    /// Time elapsed since the latest heartbeat.
    pub fn lapse(&self) -> Duration {
        self.latest_heartbeat.elapsed()
    }
}

/// Start, stop, health check and heal: the uniform interface of a supervised unit.
///
/// Supervisors only ever interact with units through this trait.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Name of the unit.
    fn name(&self) -> &str;

    /// Runs the unit.
    ///
    /// Depending on the unit, this either returns once it has launched its own execution contexts, or runs until the
    /// unit is stopped.
    ///
    /// # Errors
    ///
    /// If the unit fails in a way it cannot recover from internally, an error is returned. Callers may start it again.
    async fn start(&self) -> Result<(), GenericError>;

    /// Stops the unit.
    ///
    /// Safe to call at any time and more than once. Returns after a bounded delay.
    async fn stop(&self);

    /// Reports the latest heartbeat and status.
    async fn healthcheck(&self) -> HealthStatus;

    /// Attempts to bring a stalled unit back to health.
    async fn heal(&self);
}
