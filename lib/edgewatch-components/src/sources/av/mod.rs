//! Audio/video source.
//!
//! Ingestion runs in a separate worker process (by default `ffmpeg` decoding the source URI to raw frames). The
//! source owns the worker's whole lifecycle: it respawns workers that die or run out of input, stops them with an
//! escalating sequence that cannot deadlock on the frame queue, and restarts them on request at a bounded rate.
//!
//! All worker and healing state belongs to the run loop. Other contexts talk to it through a command channel and
//! observe it through a [`SourceStatus`] snapshot.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use edgewatch_core::{
    element::ElementActivity,
    heartbeat::Heartbeat,
    sample::{ImageFrame, Sample},
    service::{HealthStatus, ManagedService, ServiceStatus},
    source::{HealOutcome, Source, SourceContext},
};
use edgewatch_error::{generic_error, GenericError};
use metrics::{counter, Counter};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    select,
    sync::{mpsc, oneshot, watch},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod config;
pub use self::config::AvSourceConfiguration;

mod queue;
use self::queue::Received;

mod worker;
pub use self::worker::{ShutdownOutcome, WorkerError, WorkerProcess};

const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Requests handled by the run loop.
enum SourceCommand {
    Heal { reply: oneshot::Sender<HealOutcome> },
}

enum LoopEvent {
    Command(Option<SourceCommand>),
    Received(Received),
}

/// Snapshot of a source's state, published by its run loop.
#[derive(Clone, Debug)]
pub struct SourceStatus {
    /// Whether the run loop is active.
    pub running: bool,

    /// When the worker was last restarted by a heal. Starts out as the time the source was created.
    pub latest_healing: Instant,

    /// Process ID of the current worker, if there is one.
    pub worker_pid: Option<u32>,

    /// Number of workers spawned so far.
    pub workers_spawned: u64,

    /// Number of heals performed so far.
    pub heals: u64,
}

struct Telemetry {
    frames_dropped: Arc<AtomicU64>,
    frames_dropped_total: Counter,
    workers_spawned_total: Counter,
    heals_total: Counter,
    invalid_frames_total: Counter,
}

impl Telemetry {
    fn new(source: &str) -> Self {
        let source = source.to_string();
        Self {
            frames_dropped: Arc::new(AtomicU64::new(0)),
            frames_dropped_total: counter!("edgewatch_source_frames_dropped_total", "source" => source.clone()),
            workers_spawned_total: counter!("edgewatch_source_workers_spawned_total", "source" => source.clone()),
            heals_total: counter!("edgewatch_source_heals_total", "source" => source.clone()),
            invalid_frames_total: counter!("edgewatch_source_invalid_frames_total", "source" => source),
        }
    }
}

/// State owned by a single run of the ingestion loop.
struct RunState {
    worker: Option<WorkerProcess>,
    latest_healing: Instant,
}

/// Audio/video source backed by a worker process.
pub struct AvSource {
    name: String,
    config: AvSourceConfiguration,
    stop: CancellationToken,
    commands_tx: mpsc::Sender<SourceCommand>,
    commands_rx: Mutex<Option<mpsc::Receiver<SourceCommand>>>,
    status_tx: watch::Sender<SourceStatus>,
    last_frame: Heartbeat,
    standalone_activity: Arc<ElementActivity>,
    telemetry: Telemetry,
}

impl AvSource {
    /// Creates a new `AvSource`.
    pub fn new(name: impl Into<String>, config: AvSourceConfiguration) -> Self {
        let name = name.into();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(SourceStatus {
            running: false,
            latest_healing: Instant::now(),
            worker_pid: None,
            workers_spawned: 0,
            heals: 0,
        });

        Self {
            standalone_activity: Arc::new(ElementActivity::new(name.clone())),
            telemetry: Telemetry::new(&name),
            name,
            config,
            stop: CancellationToken::new(),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            status_tx,
            last_frame: Heartbeat::new(),
        }
    }

    /// Source configuration.
    pub fn config(&self) -> &AvSourceConfiguration {
        &self.config
    }

    /// Latest published status.
    pub fn status(&self) -> SourceStatus {
        self.status_tx.borrow().clone()
    }

    /// Number of frames dropped because the pipeline was not keeping up.
    pub fn frames_dropped(&self) -> u64 {
        self.telemetry.frames_dropped.load(Ordering::Relaxed)
    }

    /// Asks the run loop to restart the worker, subject to the minimum healing interval.
    ///
    /// Requests are handled one at a time, so concurrent requests collapse into a single restart.
    pub async fn request_heal(&self) -> HealOutcome {
        if !self.status_tx.borrow().running || self.stop.is_cancelled() {
            return HealOutcome::NotRunning;
        }

        let (reply, reply_rx) = oneshot::channel();
        if self.commands_tx.send(SourceCommand::Heal { reply }).await.is_err() {
            return HealOutcome::NotRunning;
        }

        select! {
            outcome = reply_rx => outcome.unwrap_or(HealOutcome::NotRunning),
            _ = self.stop.cancelled() => HealOutcome::NotRunning,
        }
    }

    /// Stops the source and waits, for a bounded time, for its run loop to finish.
    ///
    /// Stopping is final. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.stop.cancel();

        let mut status = self.status_tx.subscribe();
        let budget = self.config.shutdown_budget();
        match timeout(budget, status.wait_for(|status| !status.running)).await {
            Ok(_) => debug!(source = %self.name, "Source stopped."),
            Err(_) => warn!(source = %self.name, budget_secs = budget.as_secs_f64(), "Source did not stop in time."),
        };
    }

    async fn ingest(&self, context: &mut SourceContext<'_>) -> Result<(), GenericError> {
        let mut commands = self
            .commands_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| generic_error!("Source '{}' is already running.", self.name))?;

        let mut state = RunState {
            worker: None,
            latest_healing: self.status_tx.borrow().latest_healing,
        };
        self.status_tx.send_modify(|status| status.running = true);
        info!(source = %self.name, uri = %self.config.uri, "Source started.");

        while !self.stop.is_cancelled() {
            let Some(worker) = state.worker.as_mut() else {
                match self.spawn_worker() {
                    Ok(worker) => state.worker = Some(worker),
                    Err(e) => {
                        error!(source = %self.name, error = %e, "Failed to spawn worker process.");
                        self.idle(self.config.respawn_delay, &mut commands, &mut state).await;
                    }
                }
                continue;
            };

            let event = select! {
                biased;
                _ = self.stop.cancelled() => break,
                command = commands.recv() => LoopEvent::Command(command),
                received = worker.next_frame(self.config.poll_timeout) => LoopEvent::Received(received),
            };

            match event {
                LoopEvent::Command(Some(command)) => self.handle_command(command, &mut state).await,
                LoopEvent::Command(None) => {}
                LoopEvent::Received(Received::Frame(data)) => self.deliver(data, context),
                LoopEvent::Received(Received::Timeout) => {
                    if worker.has_exited() {
                        info!(source = %self.name, pid = worker.pid(), "Worker process exited.");
                        self.replace_worker(&mut commands, &mut state).await;
                    }
                }
                LoopEvent::Received(Received::Closed) => {
                    info!(source = %self.name, pid = worker.pid(), "Worker reached end of input.");
                    self.replace_worker(&mut commands, &mut state).await;
                }
            }
        }

        self.retire_worker(&mut state).await;

        // Nobody will answer queued requests anymore.
        while let Ok(SourceCommand::Heal { reply }) = commands.try_recv() {
            let _ = reply.send(HealOutcome::NotRunning);
        }
        *self.commands_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(commands);

        self.status_tx.send_modify(|status| status.running = false);
        info!(source = %self.name, "Source stopped.");
        Ok(())
    }

    fn spawn_worker(&self) -> Result<WorkerProcess, WorkerError> {
        let worker = WorkerProcess::spawn(
            &self.name,
            &self.config,
            Arc::clone(&self.telemetry.frames_dropped),
            self.telemetry.frames_dropped_total.clone(),
        )?;

        self.telemetry.workers_spawned_total.increment(1);
        self.status_tx.send_modify(|status| {
            status.worker_pid = worker.pid();
            status.workers_spawned += 1;
        });
        Ok(worker)
    }

    /// Retires a worker that ended on its own, pausing before the loop spawns the next one.
    async fn replace_worker(&self, commands: &mut mpsc::Receiver<SourceCommand>, state: &mut RunState) {
        self.retire_worker(state).await;
        self.idle(self.config.respawn_delay, commands, state).await;
    }

    async fn retire_worker(&self, state: &mut RunState) {
        if let Some(worker) = state.worker.take() {
            let pid = worker.pid();
            let outcome = worker.shutdown().await;
            debug!(source = %self.name, pid, ?outcome, "Worker process retired.");
            self.status_tx.send_modify(|status| status.worker_pid = None);
        }
    }

    /// Waits for `duration` while still answering commands. Returns early on stop.
    async fn idle(&self, duration: Duration, commands: &mut mpsc::Receiver<SourceCommand>, state: &mut RunState) {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => return,
                Some(command) = commands.recv() => self.handle_command(command, state).await,
            }
        }
    }

    async fn handle_command(&self, command: SourceCommand, state: &mut RunState) {
        match command {
            SourceCommand::Heal { reply } => {
                let outcome = self.heal_worker(state).await;
                let _ = reply.send(outcome);
            }
        }
    }

    async fn heal_worker(&self, state: &mut RunState) -> HealOutcome {
        let since_latest = state.latest_healing.elapsed();
        if since_latest < self.config.min_healing_interval {
            debug!(
                source = %self.name,
                since_latest_secs = since_latest.as_secs_f64(),
                "Healed recently. Skipping heal."
            );
            return HealOutcome::TooSoon;
        }

        state.latest_healing = Instant::now();
        let latest_healing = state.latest_healing;
        self.status_tx.send_modify(|status| status.latest_healing = latest_healing);
        info!(source = %self.name, "Healing source by restarting its worker process.");

        self.retire_worker(state).await;
        select! {
            _ = self.stop.cancelled() => {}
            _ = sleep(self.config.heal_recovery_delay) => {}
        }

        self.telemetry.heals_total.increment(1);
        self.status_tx.send_modify(|status| status.heals += 1);
        HealOutcome::Healed
    }

    fn deliver(&self, data: bytes::Bytes, context: &mut SourceContext<'_>) {
        self.last_frame.beat();

        let image = match ImageFrame::new(self.config.width, self.config.height, self.config.pixel_format, data) {
            Ok(image) => image,
            Err(e) => {
                self.telemetry.invalid_frames_total.increment(1);
                warn!(source = %self.name, error = %e, "Dropping invalid frame.");
                return;
            }
        };

        // The downstream chain runs synchronously. Keep the runtime's other tasks, including the worker's output
        // reader, moving while it does.
        let sample = Sample::Image(image);
        if Handle::current().runtime_flavor() == RuntimeFlavor::MultiThread {
            tokio::task::block_in_place(|| context.dispatch(sample));
        } else {
            context.dispatch(sample);
        }
    }
}

#[async_trait]
impl Source for AvSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut context: SourceContext<'_>) -> Result<(), GenericError> {
        self.ingest(&mut context).await
    }

    async fn stop(&self) {
        self.shutdown().await;
    }

    async fn heal(&self) -> HealOutcome {
        self.request_heal().await
    }
}

/// Runs the source on its own, without a downstream chain.
#[async_trait]
impl ManagedService for AvSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), GenericError> {
        let context = SourceContext::new(Arc::clone(&self.standalone_activity), None);
        Source::run(self, context).await
    }

    async fn stop(&self) {
        self.shutdown().await;
    }

    async fn healthcheck(&self) -> HealthStatus {
        let status = if self.status_tx.borrow().worker_pid.is_some() {
            ServiceStatus::Ok
        } else {
            ServiceStatus::Degraded
        };
        HealthStatus::new(self.last_frame.last(), status)
    }

    async fn heal(&self) {
        let outcome = self.request_heal().await;
        debug!(source = %self.name, ?outcome, "Heal requested.");
    }
}
