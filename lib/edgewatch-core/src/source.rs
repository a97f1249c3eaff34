//! The head of a pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use edgewatch_error::GenericError;
use serde::Serialize;

use crate::{
    element::{ElementActivity, ElementNode},
    sample::Sample,
};

/// Result of a heal request against a source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealOutcome {
    /// The source was restarted.
    Healed,

    /// The previous heal happened too recently; nothing was done.
    TooSoon,

    /// The source is not running, so there was nothing to heal.
    NotRunning,
}

/// Where a running source delivers its samples.
pub struct SourceContext<'a> {
    activity: Arc<ElementActivity>,
    downstream: Option<&'a mut ElementNode>,
}

impl<'a> SourceContext<'a> {
    /// Creates a new `SourceContext`.
    pub fn new(activity: Arc<ElementActivity>, downstream: Option<&'a mut ElementNode>) -> Self {
        Self { activity, downstream }
    }

    /// Activity of the source itself.
    pub fn activity(&self) -> &Arc<ElementActivity> {
        &self.activity
    }

    /// Walks a sample through the whole downstream chain.
    ///
    /// Blocks the calling context until every element has handled the sample.
    pub fn dispatch(&mut self, sample: Sample) {
        self.activity.beat();
        if let Some(downstream) = self.downstream.as_deref_mut() {
            downstream.receive_next_sample(sample);
        }
        self.activity.record_processed();
        self.activity.beat();
    }
}

/// A pipeline head: produces samples until stopped.
#[async_trait]
pub trait Source: Send + Sync {
    /// Name of the source element.
    fn name(&self) -> &str;

    /// Produces samples into `context` until the source is stopped.
    ///
    /// # Errors
    ///
    /// If the source cannot run at all, an error is returned.
    async fn run(&self, context: SourceContext<'_>) -> Result<(), GenericError>;

    /// Stops the source, causing [`run`][Self::run] to return.
    ///
    /// Stopping is final for a source instance. Safe to call more than once.
    async fn stop(&self);

    /// Restarts whatever the source ingests from, subject to the source's own rate limiting.
    async fn heal(&self) -> HealOutcome;
}
