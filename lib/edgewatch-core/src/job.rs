//! Running managed services on dedicated threads.
//!
//! Each [`ServiceJob`] owns an OS thread with its own Tokio runtime, so a unit that blocks its context while processing
//! samples cannot stall any other unit, or the supervisor that polls them.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
    thread::JoinHandle,
    time::Duration,
};

use edgewatch_error::{generic_error, GenericError};
use tokio::{
    select,
    sync::{oneshot, Mutex},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::service::ManagedService;

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a dedicated Tokio runtime.
#[derive(Clone, Debug)]
pub struct RuntimeConfiguration {
    worker_threads: usize,
}

impl RuntimeConfiguration {
    /// Creates a new single-threaded `RuntimeConfiguration`, based on Tokio's "current thread" runtime.
    pub const fn single_threaded() -> Self {
        Self { worker_threads: 1 }
    }

    /// Creates a new multi-threaded `RuntimeConfiguration` with the given number of worker threads.
    ///
    /// Units that run blocking work in place (such as a pipeline walking samples through its elements) need at least
    /// two workers so their background tasks keep making progress.
    pub const fn multi_threaded(worker_threads: usize) -> Self {
        Self { worker_threads }
    }

    fn build(&self, job_name: &str) -> io::Result<tokio::runtime::Runtime> {
        if self.worker_threads <= 1 {
            return tokio::runtime::Builder::new_current_thread().enable_all().build();
        }

        let job_name = job_name.to_string();
        let thread_id = Arc::new(AtomicUsize::new(0));
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(self.worker_threads)
            .thread_name_fn(move || {
                let new_thread_id = thread_id.fetch_add(1, Ordering::SeqCst);
                format!("{}-job-{:02}", job_name, new_thread_id)
            })
            .build()
    }
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self::multi_threaded(2)
    }
}

/// Resolves once a job's thread has finished, joining it.
struct JobHandle {
    done_rx: oneshot::Receiver<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Future for JobHandle {
    type Output = Result<(), GenericError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.done_rx).poll(cx));

        // The thread has either signalled completion or is unwinding, so joining returns promptly.
        let joined = self.thread_handle.take().map(JoinHandle::join);
        Poll::Ready(match (result, joined) {
            (Ok(()), _) => Ok(()),
            (Err(_), Some(Err(_))) => Err(generic_error!("job thread panicked")),
            (Err(_), _) => Err(generic_error!("job thread exited without signalling completion")),
        })
    }
}

/// Runs a managed service on a dedicated thread and forwards stop and heal requests to it.
///
/// The service's `start` is invoked repeatedly until the job is stopped, so a unit whose run loop returns or fails is
/// simply started again after a short delay.
pub struct ServiceJob {
    service: Arc<dyn ManagedService>,
    runtime: RuntimeConfiguration,
    restart_delay: Duration,
    stop: CancellationToken,
    finished: Arc<AtomicBool>,
    handle: Mutex<Option<JobHandle>>,
}

impl ServiceJob {
    /// Creates a new, not yet started `ServiceJob`.
    pub fn new(service: Arc<dyn ManagedService>) -> Self {
        Self {
            service,
            runtime: RuntimeConfiguration::default(),
            restart_delay: DEFAULT_RESTART_DELAY,
            stop: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Sets the runtime configuration of the job's thread.
    pub fn with_runtime(mut self, runtime: RuntimeConfiguration) -> Self {
        self.runtime = runtime;
        self
    }

    /// Sets the pause between consecutive starts of the service.
    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    /// Name of the managed service.
    pub fn name(&self) -> &str {
        self.service.name()
    }

    /// The managed service.
    pub fn service(&self) -> &Arc<dyn ManagedService> {
        &self.service
    }

    /// Returns `true` if the job's thread was started and has not finished.
    pub fn is_running(&self) -> bool {
        match self.handle.try_lock() {
            Ok(handle) => handle.is_some() && !self.finished.load(Ordering::Acquire),
            // Only held while starting or stopping.
            Err(_) => !self.finished.load(Ordering::Acquire),
        }
    }

    /// Spawns the job's thread and runtime.
    ///
    /// # Errors
    ///
    /// If the job was already started or stopped, the thread cannot be spawned, or the runtime cannot be built, an
    /// error is returned.
    pub async fn start(&self) -> Result<(), GenericError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() || self.stop.is_cancelled() {
            return Err(generic_error!("Job '{}' was already started.", self.name()));
        }

        let (init_tx, init_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let name = self.name().to_string();
        let service = Arc::clone(&self.service);
        let runtime_config = self.runtime.clone();
        let restart_delay = self.restart_delay;
        let stop = self.stop.clone();
        let finished = Arc::clone(&self.finished);

        let thread_name = format!("{}-job-rt", name);
        let thread_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match runtime_config.build(&name) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = init_tx.send(Err(generic_error!("Failed to build runtime for job '{}': {}", name, e)));
                        finished.store(true, Ordering::Release);
                        let _ = done_tx.send(());
                        return;
                    }
                };

                if init_tx.send(Ok(())).is_err() {
                    finished.store(true, Ordering::Release);
                    return;
                }

                runtime.block_on(run_until_stopped(service, stop, restart_delay));
                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

                finished.store(true, Ordering::Release);
                let _ = done_tx.send(());
            })
            .map_err(|e| generic_error!("Failed to spawn job thread '{}': {}", thread_name, e))?;

        let job_handle = JobHandle {
            done_rx,
            thread_handle: Some(thread_handle),
        };

        match init_rx.await {
            Ok(Ok(())) => {
                *handle = Some(job_handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = job_handle.await;
                Err(e)
            }
            Err(_) => {
                let _ = job_handle.await;
                Err(generic_error!("Job '{}' exited before its runtime was initialized.", self.name()))
            }
        }
    }

    /// Stops the service and waits for the job's thread to finish.
    ///
    /// Safe to call more than once, and on a job that was never started.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.service.stop().await;

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(()) => debug!(job = self.name(), "Job stopped."),
                Err(e) => warn!(job = self.name(), error = %e, "Job did not stop cleanly."),
            }
        }
    }

    /// Forwards a heal request to the service.
    pub async fn heal(&self) {
        self.service.heal().await;
    }
}

async fn run_until_stopped(service: Arc<dyn ManagedService>, stop: CancellationToken, restart_delay: Duration) {
    info!(job = service.name(), "Job started.");

    while !stop.is_cancelled() {
        match service.start().await {
            Ok(()) => debug!(job = service.name(), "Service returned."),
            Err(e) => error!(job = service.name(), error = %e, "Service failed."),
        }

        select! {
            _ = stop.cancelled() => break,
            _ = sleep(restart_delay) => {
                info!(job = service.name(), "Restarting service.");
            }
        }
    }

    info!(job = service.name(), "Job finished.");
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Instant};

    use async_trait::async_trait;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

    use super::*;
    use crate::service::{HealthStatus, ServiceStatus};

    #[derive(Clone, Copy)]
    enum StartBehavior {
        /// Runs until stopped.
        RunUntilStopped,
        /// Returns immediately.
        ReturnImmediately,
        /// Fails immediately.
        Fail,
    }

    struct MockService {
        behavior: StartBehavior,
        starts: AtomicUsize,
        stops: AtomicUsize,
        heals: AtomicUsize,
        stopped: CancellationToken,
    }

    impl MockService {
        fn new(behavior: StartBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                heals: AtomicUsize::new(0),
                stopped: CancellationToken::new(),
            })
        }
    }

    #[async_trait]
    impl ManagedService for MockService {
        fn name(&self) -> &str {
            "mock"
        }

        async fn start(&self) -> Result<(), GenericError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                StartBehavior::RunUntilStopped => {
                    self.stopped.cancelled().await;
                    Ok(())
                }
                StartBehavior::ReturnImmediately => Ok(()),
                StartBehavior::Fail => Err(generic_error!("mock failure")),
            }
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stopped.cancel();
        }

        async fn healthcheck(&self) -> HealthStatus {
            HealthStatus::new(Instant::now(), ServiceStatus::Ok)
        }

        async fn heal(&self) {
            self.heals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_service_until_stopped() {
        let service = MockService::new(StartBehavior::RunUntilStopped);
        let job = ServiceJob::new(service.clone());
        assert!(!job.is_running());

        job.start().await.unwrap();
        assert!(job.is_running());
        assert!(job.start().await.is_err());

        job.heal().await;
        assert_eq!(service.heals.load(Ordering::SeqCst), 1);

        timeout(Duration::from_secs(5), job.stop()).await.unwrap();
        assert!(!job.is_running());
        assert_eq!(service.starts.load(Ordering::SeqCst), 1);

        // Stopping again is a no-op apart from forwarding to the service.
        timeout(Duration::from_secs(5), job.stop()).await.unwrap();
        assert_eq!(service.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn restarts_service_that_returns_or_fails() {
        for behavior in [StartBehavior::ReturnImmediately, StartBehavior::Fail] {
            let service = MockService::new(behavior);
            let job = ServiceJob::new(service.clone())
                .with_runtime(RuntimeConfiguration::single_threaded())
                .with_restart_delay(Duration::from_millis(10));

            job.start().await.unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while service.starts.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            timeout(Duration::from_secs(5), job.stop()).await.unwrap();

            assert!(service.starts.load(Ordering::SeqCst) >= 3);
        }
    }

    #[test]
    fn job_handle_resolves_on_completion_signal() {
        let (done_tx, done_rx) = oneshot::channel();
        let mut handle = tokio_test::task::spawn(JobHandle {
            done_rx,
            thread_handle: None,
        });
        assert_pending!(handle.poll());

        done_tx.send(()).unwrap();
        assert!(handle.is_woken());
        assert_ready_ok!(handle.poll());
    }

    #[test]
    fn job_handle_fails_when_thread_vanishes() {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let mut handle = tokio_test::task::spawn(JobHandle {
            done_rx,
            thread_handle: None,
        });

        drop(done_tx);
        assert_ready_err!(handle.poll());
    }

    #[tokio::test]
    async fn stop_before_start_prevents_start() {
        let service = MockService::new(StartBehavior::RunUntilStopped);
        let job = ServiceJob::new(service.clone());

        job.stop().await;
        assert!(job.start().await.is_err());
        assert_eq!(service.starts.load(Ordering::SeqCst), 0);
    }
}
