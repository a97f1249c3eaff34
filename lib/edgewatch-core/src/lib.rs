//! The pipeline execution and self-healing engine.
//!
//! Samples flow from a [`Source`][source::Source] through a chain of [`PipeElement`][element::PipeElement]s. Every
//! long-running unit implements [`ManagedService`][service::ManagedService], runs on its own
//! [`ServiceJob`][job::ServiceJob], and is watched by a [`HealthMonitor`][health::HealthMonitor] that heals it when it
//! stops making progress.
#![deny(warnings)]
#![deny(missing_docs)]

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument as _;

pub mod element;
pub mod health;
pub mod heartbeat;
pub mod job;
pub mod pipeline;
pub mod sample;
pub mod server;
pub mod service;
pub mod source;

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// Thin wrapper over [`tokio::spawn`] that attaches the task to the current `tracing` span.
pub fn spawn_traced<F, R>(f: F) -> JoinHandle<R>
where
    F: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    tokio::spawn(f.in_current_span())
}
