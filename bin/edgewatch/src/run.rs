use std::{sync::Arc, time::Instant};

use edgewatch_components::{registry::PipelineBuilder, timeline::EventLog};
use edgewatch_config::{EdgewatchConfiguration, GenericConfiguration};
use edgewatch_core::{job::RuntimeConfiguration, server::PipelineServer, service::ManagedService};
use edgewatch_error::{generic_error, ErrorContext as _, GenericError};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    sync::oneshot,
};
use tracing::{error, info};

/// Entrypoint for the `run` command.
pub async fn handle_run_command(started: Instant, configuration: &GenericConfiguration) -> Result<(), GenericError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        process_id = std::process::id(),
        "edgewatch starting..."
    );

    let config = configuration
        .as_typed::<EdgewatchConfiguration>()
        .error_context("Failed to load engine configuration.")?;

    let event_log = EventLog::from_configuration(&config.timeline, &config.data_dir)
        .error_context("Failed to open timeline event log.")?;
    let pipelines = PipelineBuilder::new(&config)
        .with_event_log(Arc::new(event_log))
        .build_all();
    if pipelines.is_empty() {
        return Err(generic_error!("No pipelines could be built from the configuration."));
    }

    let server = PipelineServer::new(
        pipelines
            .into_iter()
            .map(|pipeline| Arc::new(pipeline) as Arc<dyn ManagedService>),
        &config.health,
        RuntimeConfiguration::default(),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    spawn_signal_handlers(shutdown_tx).error_context("Failed to configure signal handlers.")?;

    info!(
        pipelines = server.pipeline_count(),
        data_dir = %config.data_dir.display(),
        init_time_ms = started.elapsed().as_millis() as u64,
        "edgewatch started."
    );

    server
        .run(async move {
            // Also resolves if the signal handler task is gone.
            let _ = shutdown_rx.await;
        })
        .await
}

fn spawn_signal_handlers(shutdown_tx: oneshot::Sender<()>) -> Result<(), GenericError> {
    let mut sigint_handler = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
    let mut sigterm_handler = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

    tokio::spawn(async move {
        select! {
            _ = sigint_handler.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm_handler.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }

        if shutdown_tx.send(()).is_err() {
            error!("Failed to send shutdown signal.");
        }
    });

    Ok(())
}
