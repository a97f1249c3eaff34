use std::{
    io,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use metrics::Counter;
use serde::Serialize;
use snafu::{ResultExt as _, Snafu};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::{sleep, timeout_at, Instant},
};
use tracing::{debug, error, info, warn};

use super::{
    config::AvSourceConfiguration,
    queue::{sample_queue, FrameReceiver, FrameSender, Offer, Received},
};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Worker process errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum WorkerError {
    /// No program configured.
    #[snafu(display("Worker command is empty."))]
    EmptyCommand,

    /// The configured frame geometry has no pixels.
    #[snafu(display("Worker frames must not be empty, got {}x{}.", width, height))]
    EmptyFrame {
        /// Configured frame width.
        width: u32,

        /// Configured frame height.
        height: u32,
    },

    /// The program could not be started.
    #[snafu(display("Failed to spawn worker '{}': {}", program, source))]
    Spawn {
        /// Program that failed to start.
        program: String,

        /// Underlying error.
        source: io::Error,
    },

    /// A standard stream of the worker was not captured.
    #[snafu(display("Worker {} was not captured.", stream))]
    MissingStream {
        /// Stream name.
        stream: &'static str,
    },
}

/// How a worker ended up stopping.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// It had already exited on its own.
    AlreadyExited,

    /// It exited when asked to.
    Stopped,

    /// It exited after `SIGTERM`.
    Terminated,

    /// It exited after `SIGKILL`.
    Killed,

    /// It was still around after `SIGKILL`.
    Survived,
}

/// An ingestion process and the tasks pumping its output.
///
/// Frames read from the worker's standard output land in a bounded queue owned by this handle. Its standard error is
/// forwarded to the log. The worker runs in its own process group so that signals reach anything it spawns.
pub struct WorkerProcess {
    source: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stop_input: Vec<u8>,
    stop_timeout: Duration,
    terminate_timeout: Duration,
    kill_timeout: Duration,
    frames: FrameReceiver,
    end_of_input: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    stderr_forwarder: JoinHandle<()>,
}

impl WorkerProcess {
    /// Spawns a worker as configured.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the frame geometry is empty, the command is empty, or the process cannot be started, an error is returned.
    pub fn spawn(
        source: &str, config: &AvSourceConfiguration, dropped: Arc<AtomicU64>, dropped_total: Counter,
    ) -> Result<Self, WorkerError> {
        // A zero-length read completes without waiting, so the frame reader would never yield.
        if config.frame_len() == 0 {
            return Err(WorkerError::EmptyFrame {
                width: config.width,
                height: config.height,
            });
        }

        let command_line = config.command_line();
        let (program, args) = command_line.split_first().ok_or(WorkerError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_process(&mut command, config.niceness);

        let mut child = command.spawn().context(Spawn { program })?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(WorkerError::MissingStream { stream: "stdout" })?;
        let stderr = child.stderr.take().ok_or(WorkerError::MissingStream { stream: "stderr" })?;

        let (frames_tx, frames) = sample_queue(config.queue_capacity, dropped, dropped_total);
        let end_of_input = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_frames(
            source.to_string(),
            stdout,
            config.frame_len(),
            frames_tx,
            Arc::clone(&end_of_input),
        ));
        let stderr_forwarder = tokio::spawn(forward_stderr(source.to_string(), pid, stderr));

        info!(source, pid, program = %program, "Spawned worker process.");

        Ok(Self {
            source: source.to_string(),
            pid,
            child,
            stdin,
            stop_input: config.stop_input.as_bytes().to_vec(),
            stop_timeout: config.stop_timeout,
            terminate_timeout: config.terminate_timeout,
            kill_timeout: config.kill_timeout,
            frames,
            end_of_input,
            reader,
            stderr_forwarder,
        })
    }

    /// Process ID of the worker.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns `true` once the worker's output has ended.
    pub fn end_of_input(&self) -> bool {
        self.end_of_input.load(Ordering::Acquire)
    }

    /// Waits up to `wait` for the next frame.
    pub async fn next_frame(&mut self, wait: Duration) -> Received {
        self.frames.recv_timeout(wait).await
    }

    /// Returns `true` if the worker process has exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)) | Err(_))
    }

    /// Stops the worker, escalating from a polite request to `SIGTERM` to `SIGKILL`.
    ///
    /// The frame queue is drained the whole time so the worker can never block on a full queue while it is being asked
    /// to exit. Each step waits for its own bounded timeout, so this always returns.
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        let outcome = self.escalate().await;
        self.release();

        match outcome {
            ShutdownOutcome::Survived => {
                error!(source = %self.source, pid = self.pid, "Worker process survived SIGKILL.")
            }
            outcome => debug!(source = %self.source, pid = self.pid, ?outcome, "Worker process stopped."),
        }
        outcome
    }

    async fn escalate(&mut self) -> ShutdownOutcome {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(source = %self.source, pid = self.pid, %status, "Worker process already exited.");
            return ShutdownOutcome::AlreadyExited;
        }

        let deadline = Instant::now() + self.stop_timeout;
        if let Some(mut stdin) = self.stdin.take() {
            match timeout_at(deadline, stdin.write_all(&self.stop_input)).await {
                Ok(Ok(())) => debug!(source = %self.source, pid = self.pid, "Asked worker process to stop."),
                Ok(Err(e)) => debug!(source = %self.source, pid = self.pid, error = %e, "Failed to ask worker process to stop."),
                Err(_) => debug!(source = %self.source, pid = self.pid, "Timed out asking worker process to stop."),
            }
            // Dropping stdin closes it.
        }
        if self.wait_draining(deadline).await {
            return ShutdownOutcome::Stopped;
        }

        warn!(source = %self.source, pid = self.pid, "Worker process did not stop in time. Sending SIGTERM.");
        self.terminate();
        if self.wait_draining(Instant::now() + self.terminate_timeout).await {
            return ShutdownOutcome::Terminated;
        }

        warn!(source = %self.source, pid = self.pid, "Worker process ignored SIGTERM. Sending SIGKILL.");
        self.kill();
        if self.wait_draining(Instant::now() + self.kill_timeout).await {
            return ShutdownOutcome::Killed;
        }

        ShutdownOutcome::Survived
    }

    /// Polls for exit until `deadline`, draining the queue in between. Never blocks on the process itself.
    async fn wait_draining(&mut self, deadline: Instant) -> bool {
        loop {
            let drained = self.frames.drain();
            if drained > 0 {
                debug!(source = %self.source, pid = self.pid, drained, "Drained frames from stopping worker.");
            }

            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log_exit(&self.source, self.pid, status);
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(source = %self.source, pid = self.pid, error = %e, "Failed to check worker process status.");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);

        #[cfg(not(unix))]
        self.kill();
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);

        if let Err(e) = self.child.start_kill() {
            debug!(source = %self.source, pid = self.pid, error = %e, "Failed to kill worker process.");
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        let Some(pid) = self.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return;
        };

        // SAFETY: `kill` has no memory safety requirements. The worker leads its own process group and has not been
        // reaped, so the group ID still refers to it.
        if unsafe { libc::kill(-pid, signal) } != 0 {
            let e = io::Error::last_os_error();
            debug!(source = %self.source, pid, signal, error = %e, "Failed to signal worker process group.");
        }
    }

    fn release(&mut self) {
        self.frames.close();
        self.frames.drain();
        self.reader.abort();
        self.stderr_forwarder.abort();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // The child itself is killed on drop.
        self.reader.abort();
        self.stderr_forwarder.abort();
    }
}

fn log_exit(source: &str, pid: Option<u32>, status: ExitStatus) {
    if status.success() {
        debug!(source, pid, %status, "Worker process exited.");
    } else {
        info!(source, pid, %status, "Worker process exited with failure.");
    }
}

#[cfg(unix)]
fn configure_process(command: &mut Command, niceness: i32) {
    use std::os::unix::process::CommandExt as _;

    // SAFETY: only async-signal-safe calls are made between fork and exec.
    unsafe {
        command.as_std_mut().pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            // A failed priority change is not worth refusing to start over.
            let _ = libc::nice(niceness);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn configure_process(_command: &mut Command, _niceness: i32) {}

async fn read_frames(
    source: String, mut stdout: ChildStdout, frame_len: usize, frames: FrameSender, end_of_input: Arc<AtomicBool>,
) {
    loop {
        let mut frame = BytesMut::zeroed(frame_len);
        match stdout.read_exact(&mut frame).await {
            Ok(_) => {
                if frames.offer(frame.freeze()) == Offer::Closed {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(source, "Worker output ended.");
                break;
            }
            Err(e) => {
                warn!(source, error = %e, "Failed to read worker output.");
                break;
            }
        }
    }

    end_of_input.store(true, Ordering::Release);
}

async fn forward_stderr(source: String, pid: Option<u32>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(source, pid, "worker: {}", line);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;

    fn script_config(script: &str) -> AvSourceConfiguration {
        let mut config = AvSourceConfiguration::from_uri("test://worker");
        config.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        config.width = 2;
        config.height = 2;
        config.pixel_format = edgewatch_core::sample::PixelFormat::Gray8;
        config.stop_timeout = Duration::from_secs(1);
        config.terminate_timeout = Duration::from_secs(1);
        config.kill_timeout = Duration::from_secs(1);
        config
    }

    fn spawn(config: &AvSourceConfiguration) -> WorkerProcess {
        WorkerProcess::spawn("test", config, Arc::new(AtomicU64::new(0)), Counter::noop()).unwrap()
    }

    #[tokio::test]
    async fn reads_fixed_size_frames_until_end_of_output() {
        let mut worker = spawn(&script_config("head -c 12 /dev/zero"));

        for _ in 0..3 {
            match worker.next_frame(Duration::from_secs(5)).await {
                Received::Frame(frame) => assert_eq!(frame.len(), 4),
                other => panic!("expected frame, got {:?}", other),
            }
        }
        assert_eq!(worker.next_frame(Duration::from_secs(5)).await, Received::Closed);
        assert!(worker.end_of_input());

        // The shell may still be on its way out when the output closes.
        let outcome = worker.shutdown().await;
        assert!(matches!(outcome, ShutdownOutcome::AlreadyExited | ShutdownOutcome::Stopped));
    }

    #[tokio::test]
    async fn cooperative_worker_stops_when_asked() {
        let worker = spawn(&script_config("read line; exit 0"));
        assert!(worker.pid().is_some());

        assert_eq!(worker.shutdown().await, ShutdownOutcome::Stopped);
    }

    #[tokio::test]
    async fn worker_ignoring_stop_request_is_terminated() {
        let worker = spawn(&script_config("while true; do sleep 0.1; done"));

        assert_eq!(worker.shutdown().await, ShutdownOutcome::Terminated);
    }

    #[tokio::test]
    async fn worker_ignoring_sigterm_is_killed_within_bounded_time() {
        let config = script_config("trap '' TERM; while true; do sleep 0.1; done");
        let worker = spawn(&config);

        let started = StdInstant::now();
        assert_eq!(worker.shutdown().await, ShutdownOutcome::Killed);
        assert!(started.elapsed() < config.shutdown_budget());
        assert!(started.elapsed() >= config.stop_timeout + config.terminate_timeout);
    }

    #[tokio::test]
    async fn chatty_worker_does_not_block_shutdown() {
        // Writes far more than the queue holds and never reads its input.
        let mut config = script_config("trap '' TERM; while true; do head -c 4096 /dev/zero; done");
        config.queue_capacity = 2;
        let dropped = Arc::new(AtomicU64::new(0));
        let worker = WorkerProcess::spawn("test", &config, Arc::clone(&dropped), Counter::noop()).unwrap();

        sleep(Duration::from_millis(200)).await;
        let started = StdInstant::now();
        assert_eq!(worker.shutdown().await, ShutdownOutcome::Killed);
        assert!(started.elapsed() < config.shutdown_budget());
        assert!(dropped.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let mut config = script_config("true");
        config.command.clear();

        let result = WorkerProcess::spawn("test", &config, Arc::new(AtomicU64::new(0)), Counter::noop());
        assert!(matches!(result, Err(WorkerError::EmptyCommand)));
    }

    #[tokio::test]
    async fn zero_sized_frames_are_rejected_before_spawning() {
        let mut config = script_config("head -c 4 /dev/zero; sleep 30");
        config.width = 0;

        let result = WorkerProcess::spawn("test", &config, Arc::new(AtomicU64::new(0)), Counter::noop());
        assert!(matches!(result, Err(WorkerError::EmptyFrame { width: 0, height: 2 })));
    }
}
