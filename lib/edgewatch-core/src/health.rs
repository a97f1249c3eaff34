//! Two-threshold health policy and the polling loop that applies it.

use std::{future::Future, time::Duration};

use edgewatch_config::HealthConfiguration;
use tokio::{pin, select, time::interval};
use tracing::{debug, error, warn};

use crate::service::{HealthStatus, ManagedService};

/// How a heartbeat lapse is judged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthVerdict {
    /// Recent enough.
    Healthy,

    /// Past the warning threshold: worth healing.
    Unresponsive,

    /// Past the terminal threshold: reported, not healed.
    Terminal,
}

/// Warning and terminal thresholds for heartbeat lapses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HealthPolicy {
    warn_threshold: Duration,
    terminal_threshold: Duration,
}

impl HealthPolicy {
    /// Creates a new `HealthPolicy`.
    pub const fn new(warn_threshold: Duration, terminal_threshold: Duration) -> Self {
        Self {
            warn_threshold,
            terminal_threshold,
        }
    }

    /// Policy applied to individual pipelines.
    pub fn for_pipelines(config: &HealthConfiguration) -> Self {
        Self::new(config.warn_threshold, config.terminal_threshold)
    }

    /// Policy applied to the server as a whole.
    ///
    /// The server is only healed once nothing in it has made progress for the process threshold. It has no terminal
    /// state of its own.
    pub fn for_process(config: &HealthConfiguration) -> Self {
        Self::new(config.process_heartbeat_threshold, Duration::MAX)
    }

    /// Judges a lapse since the latest heartbeat.
    pub fn evaluate(&self, lapse: Duration) -> HealthVerdict {
        if lapse > self.terminal_threshold {
            HealthVerdict::Terminal
        } else if lapse > self.warn_threshold {
            HealthVerdict::Unresponsive
        } else {
            HealthVerdict::Healthy
        }
    }
}

/// Applies a [`HealthPolicy`] to managed services.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    policy: HealthPolicy,
    poll_interval: Duration,
}

impl HealthMonitor {
    /// Creates a new `HealthMonitor`.
    pub const fn new(policy: HealthPolicy, poll_interval: Duration) -> Self {
        Self { policy, poll_interval }
    }

    /// Checks a service once, healing it if it is unresponsive.
    pub async fn check(&self, service: &dyn ManagedService) -> (HealthStatus, HealthVerdict) {
        let health = service.healthcheck().await;
        let lapse = health.lapse();
        let verdict = self.policy.evaluate(lapse);

        match verdict {
            HealthVerdict::Healthy => {}
            HealthVerdict::Unresponsive => {
                warn!(service = service.name(), lapse_secs = lapse.as_secs_f64(), "No heartbeat for a while. Healing.");
                service.heal().await;
            }
            HealthVerdict::Terminal => {
                // TODO: recreate the service from its configuration instead of only reporting it.
                error!(service = service.name(), lapse_secs = lapse.as_secs_f64(), "No heartbeat for too long. Service is in an unrecoverable state and will not be healed automatically.");
            }
        }

        (health, verdict)
    }

    /// Checks the service every poll interval until `shutdown` resolves.
    pub async fn run<F>(&self, service: &dyn ManagedService, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        pin!(shutdown);
        let mut ticker = interval(self.poll_interval);

        loop {
            select! {
                _ = &mut shutdown => {
                    debug!(service = service.name(), "Health monitor shutting down.");
                    break;
                }
                _ = ticker.tick() => {
                    let (health, verdict) = self.check(service).await;
                    debug!(service = service.name(), status = ?health.status, ?verdict, "Health check complete.");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Instant,
    };

    use async_trait::async_trait;
    use edgewatch_error::GenericError;
    use tokio::sync::oneshot;

    use super::*;
    use crate::service::ServiceStatus;

    struct StaleService {
        lapse: Duration,
        heals: AtomicUsize,
    }

    #[async_trait]
    impl ManagedService for StaleService {
        fn name(&self) -> &str {
            "stale"
        }

        async fn start(&self) -> Result<(), GenericError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn healthcheck(&self) -> HealthStatus {
            HealthStatus::new(Instant::now() - self.lapse, ServiceStatus::Ok)
        }

        async fn heal(&self) {
            self.heals.fetch_add(1, Ordering::SeqCst);
        }
    }

    const POLICY: HealthPolicy = HealthPolicy::new(Duration::from_secs(10), Duration::from_secs(60));

    #[test]
    fn thresholds_are_exclusive() {
        assert_eq!(POLICY.evaluate(Duration::from_secs(10)), HealthVerdict::Healthy);
        assert_eq!(POLICY.evaluate(Duration::from_secs(11)), HealthVerdict::Unresponsive);
        assert_eq!(POLICY.evaluate(Duration::from_secs(60)), HealthVerdict::Unresponsive);
        assert_eq!(POLICY.evaluate(Duration::from_secs(61)), HealthVerdict::Terminal);
    }

    #[test]
    fn process_policy_never_turns_terminal() {
        let policy = HealthPolicy::for_process(&HealthConfiguration::default());
        assert_eq!(policy.evaluate(Duration::from_secs(179)), HealthVerdict::Healthy);
        assert_eq!(policy.evaluate(Duration::from_secs(181)), HealthVerdict::Unresponsive);
        assert_eq!(policy.evaluate(Duration::from_secs(86_400)), HealthVerdict::Unresponsive);
    }

    #[tokio::test]
    async fn terminal_services_are_not_healed() {
        let monitor = HealthMonitor::new(POLICY, Duration::from_secs(1));

        let stalled = StaleService {
            lapse: Duration::from_secs(20),
            heals: AtomicUsize::new(0),
        };
        assert_eq!(monitor.check(&stalled).await.1, HealthVerdict::Unresponsive);
        assert_eq!(stalled.heals.load(Ordering::SeqCst), 1);

        let dead = StaleService {
            lapse: Duration::from_secs(120),
            heals: AtomicUsize::new(0),
        };
        assert_eq!(monitor.check(&dead).await.1, HealthVerdict::Terminal);
        assert_eq!(dead.heals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_checks_every_interval_until_shutdown() {
        let monitor = HealthMonitor::new(POLICY, Duration::from_secs(1));
        let service = Arc::new(StaleService {
            lapse: Duration::from_secs(30),
            heals: AtomicUsize::new(0),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_service = Arc::clone(&service);
        let task = tokio::spawn(async move {
            monitor
                .run(task_service.as_ref(), async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        // First tick fires immediately, then once per second.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(service.heals.load(Ordering::SeqCst), 3);
    }
}
