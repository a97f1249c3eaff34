//! Supervising many pipelines at once.

use std::{future::Future, sync::Arc, time::Instant};

use async_trait::async_trait;
use edgewatch_config::HealthConfiguration;
use edgewatch_error::GenericError;
use futures::future::join_all;
use tracing::{debug, error, info};

use crate::{
    health::{HealthMonitor, HealthPolicy, HealthVerdict},
    job::{RuntimeConfiguration, ServiceJob},
    service::{HealthStatus, ManagedService, ServiceStatus},
};

const SERVER_NAME: &str = "pipeline_server";

/// Runs every configured pipeline on its own job and heals the ones that stall.
///
/// The server is itself a [`ManagedService`]: its heartbeat is the oldest heartbeat across its pipelines, so an outer
/// supervisor can apply the same two-threshold policy to the process as a whole.
pub struct PipelineServer {
    jobs: Vec<ServiceJob>,
    pipeline_monitor: HealthMonitor,
    process_monitor: HealthMonitor,
}

impl PipelineServer {
    /// Creates a new `PipelineServer` with one job per pipeline.
    pub fn new<I>(pipelines: I, config: &HealthConfiguration, runtime: RuntimeConfiguration) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ManagedService>>,
    {
        let jobs = pipelines
            .into_iter()
            .map(|pipeline| ServiceJob::new(pipeline).with_runtime(runtime.clone()))
            .collect();

        Self {
            jobs,
            pipeline_monitor: HealthMonitor::new(HealthPolicy::for_pipelines(config), config.poll_interval),
            process_monitor: HealthMonitor::new(HealthPolicy::for_process(config), config.poll_interval),
        }
    }

    /// Number of managed pipelines.
    pub fn pipeline_count(&self) -> usize {
        self.jobs.len()
    }

    /// Names of the managed pipelines, in configuration order.
    pub fn pipeline_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(ServiceJob::name)
    }

    /// Starts every pipeline, supervises them until `shutdown` resolves, then stops them.
    ///
    /// # Errors
    ///
    /// If the pipelines cannot be started, an error is returned.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), GenericError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        self.process_monitor.run(self, shutdown).await;
        self.stop().await;
        Ok(())
    }
}

#[async_trait]
impl ManagedService for PipelineServer {
    fn name(&self) -> &str {
        SERVER_NAME
    }

    async fn start(&self) -> Result<(), GenericError> {
        let mut started = 0;
        for job in &self.jobs {
            match job.start().await {
                Ok(()) => started += 1,
                Err(e) => error!(pipeline = job.name(), error = %e, "Failed to start pipeline."),
            }
        }

        info!(started, configured = self.jobs.len(), "Pipeline server started.");
        Ok(())
    }

    async fn stop(&self) {
        info!("Stopping all pipelines.");
        join_all(self.jobs.iter().map(ServiceJob::stop)).await;
        info!("All pipelines stopped.");
    }

    async fn healthcheck(&self) -> HealthStatus {
        let mut oldest: Option<Instant> = None;
        let mut status = ServiceStatus::Ok;

        for job in &self.jobs {
            if !job.is_running() {
                debug!(pipeline = job.name(), "Pipeline not running. Skipping health check.");
                continue;
            }

            let (health, verdict) = self.pipeline_monitor.check(job.service().as_ref()).await;
            let verdict_status = match verdict {
                HealthVerdict::Healthy => ServiceStatus::Ok,
                HealthVerdict::Unresponsive => ServiceStatus::Degraded,
                HealthVerdict::Terminal => ServiceStatus::Failed,
            };

            status = status.max(health.status).max(verdict_status);
            oldest = Some(oldest.map_or(health.latest_heartbeat, |o| o.min(health.latest_heartbeat)));
        }

        HealthStatus::new(oldest.unwrap_or_else(Instant::now), status)
    }

    async fn heal(&self) {
        // Pipelines are healed individually by the health check.
        error!("Pipeline server has made no progress for too long. Healing the server as a whole is not supported.");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use tokio::time::{sleep, timeout};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        element::{tests::Recorder, ElementState, PipeElement},
        pipeline::{tests::StubSource, Pipeline},
    };

    /// A pipeline stand-in whose heartbeat is set by the test.
    struct MockPipeline {
        heartbeat: Mutex<Instant>,
        heals: AtomicUsize,
        stopped: CancellationToken,
    }

    impl MockPipeline {
        fn stalled_for(lapse: Duration) -> Arc<Self> {
            Arc::new(Self {
                heartbeat: Mutex::new(Instant::now() - lapse),
                heals: AtomicUsize::new(0),
                stopped: CancellationToken::new(),
            })
        }

        fn recover(&self) {
            *self.heartbeat.lock().unwrap() = Instant::now();
        }
    }

    #[async_trait]
    impl ManagedService for MockPipeline {
        fn name(&self) -> &str {
            "mock_pipeline"
        }

        async fn start(&self) -> Result<(), GenericError> {
            self.stopped.cancelled().await;
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.cancel();
        }

        async fn healthcheck(&self) -> HealthStatus {
            HealthStatus::new(*self.heartbeat.lock().unwrap(), ServiceStatus::Ok)
        }

        async fn heal(&self) {
            self.heals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn server_for(pipelines: Vec<Arc<dyn ManagedService>>) -> PipelineServer {
        PipelineServer::new(
            pipelines,
            &HealthConfiguration::default(),
            RuntimeConfiguration::single_threaded(),
        )
    }

    #[tokio::test]
    async fn stalled_pipeline_is_healed_once_per_poll_until_it_recovers() {
        let pipeline = MockPipeline::stalled_for(Duration::from_secs(15));
        let server = server_for(vec![pipeline.clone() as Arc<dyn ManagedService>]);
        server.start().await.unwrap();

        for poll in 1..=3 {
            let health = server.healthcheck().await;
            assert_eq!(health.status, ServiceStatus::Degraded);
            assert!(health.lapse() >= Duration::from_secs(15));
            assert_eq!(pipeline.heals.load(Ordering::SeqCst), poll);
        }

        pipeline.recover();
        let health = server.healthcheck().await;
        assert_eq!(health.status, ServiceStatus::Ok);
        assert_eq!(pipeline.heals.load(Ordering::SeqCst), 3);

        timeout(Duration::from_secs(5), server.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_pipeline_is_reported_not_healed() {
        let healthy = MockPipeline::stalled_for(Duration::from_secs(1));
        let dead = MockPipeline::stalled_for(Duration::from_secs(120));
        let server = server_for(vec![healthy.clone() as Arc<dyn ManagedService>, dead.clone()]);
        server.start().await.unwrap();

        let health = server.healthcheck().await;
        assert_eq!(health.status, ServiceStatus::Failed);
        assert!(health.lapse() >= Duration::from_secs(120));
        assert_eq!(dead.heals.load(Ordering::SeqCst), 0);
        assert_eq!(healthy.heals.load(Ordering::SeqCst), 0);

        timeout(Duration::from_secs(5), server.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_pipelines_are_skipped() {
        let pipeline = MockPipeline::stalled_for(Duration::from_secs(15));
        let server = server_for(vec![pipeline.clone() as Arc<dyn ManagedService>]);
        assert_eq!(server.pipeline_count(), 1);

        // Never started.
        let health = server.healthcheck().await;
        assert_eq!(health.status, ServiceStatus::Ok);
        assert!(health.lapse() < Duration::from_secs(1));

        server.start().await.unwrap();
        timeout(Duration::from_secs(5), server.stop()).await.unwrap();
        server.healthcheck().await;
        assert_eq!(pipeline.heals.load(Ordering::SeqCst), 0);

        // Stopping again is harmless.
        timeout(Duration::from_secs(5), server.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn runs_real_pipelines_until_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let elements: Vec<Box<dyn PipeElement>> = vec![Box::new(Recorder {
            name: "counter".to_string(),
            log: Arc::clone(&log),
        })];
        let pipeline = Arc::new(Pipeline::new("e2e", Arc::new(StubSource::new(vec![1, 2, 3])), elements));

        let server = Arc::new(PipelineServer::new(
            vec![pipeline.clone() as Arc<dyn ManagedService>],
            &HealthConfiguration::default(),
            RuntimeConfiguration::default(),
        ));
        assert_eq!(server.pipeline_names().collect::<Vec<_>>(), vec!["e2e"]);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            async move { server.run(shutdown.cancelled_owned()).await }
        });

        timeout(Duration::from_secs(5), async {
            while log.lock().unwrap().len() < 3 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.healthcheck().await.status, ServiceStatus::Ok);

        shutdown.cancel();
        timeout(Duration::from_secs(10), task).await.unwrap().unwrap().unwrap();
        assert!(pipeline.elements().iter().all(|r| r.state == ElementState::Stopped));
        assert_eq!(log.lock().unwrap().len(), 3);
    }
}
