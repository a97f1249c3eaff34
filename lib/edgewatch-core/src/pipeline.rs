//! Pipelines: a source, its chain of elements, and the heartbeat that proves samples still reach the end.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

use async_trait::async_trait;
use edgewatch_error::{generic_error, GenericError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    element::{ElementActivity, ElementNode, ElementState, HealthChecker, PipeElement},
    heartbeat::Heartbeat,
    service::{HealthStatus, ManagedService, ServiceStatus},
    source::{HealOutcome, Source, SourceContext},
    spawn_traced,
};

enum ChainState {
    /// Nodes in order, not linked yet.
    Unassembled(Vec<ElementNode>),

    /// Linked chain, ready to run.
    Assembled(ElementNode),

    /// Currently owned by a running `start`.
    InUse,
}

/// Point-in-time view of one element of a pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct ElementReport {
    /// Element name.
    pub name: String,

    /// Lifecycle state.
    #[serde(serialize_with = "serialize_state")]
    pub state: ElementState,

    /// Seconds since the element last did anything.
    pub idle_secs: f64,
}

fn serialize_state<S: serde::Serializer>(state: &ElementState, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(match state {
        ElementState::Stopped => "stopped",
        ElementState::Running => "running",
    })
}

/// A source followed by an ordered chain of elements, ending in a [`HealthChecker`].
///
/// The pipeline heartbeat is beaten whenever a sample makes it to the end of the chain, and whenever a heal is
/// launched or completes. Healing is single-flight: while a heal is in progress, further requests are ignored.
pub struct Pipeline {
    name: String,
    source: Arc<dyn Source>,
    source_activity: Arc<ElementActivity>,
    activities: Vec<Arc<ElementActivity>>,
    heartbeat: Arc<Heartbeat>,
    chain: Mutex<ChainState>,
    healing: Arc<AtomicBool>,
}

impl Pipeline {
    /// Creates a new `Pipeline`.
    ///
    /// `elements` are linked in the given order when the pipeline first starts.
    pub fn new(name: impl Into<String>, source: Arc<dyn Source>, elements: Vec<Box<dyn PipeElement>>) -> Self {
        let heartbeat = Arc::new(Heartbeat::new());
        let mut nodes = elements.into_iter().map(ElementNode::new).collect::<Vec<_>>();
        nodes.push(ElementNode::new(Box::new(HealthChecker::new(Arc::clone(&heartbeat)))));

        let activities = nodes.iter().map(|node| Arc::clone(node.activity())).collect();

        Self {
            name: name.into(),
            source_activity: Arc::new(ElementActivity::new(source.name())),
            source,
            activities,
            heartbeat,
            chain: Mutex::new(ChainState::Unassembled(nodes)),
            healing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pipeline name.
    pub fn pipeline_name(&self) -> &str {
        &self.name
    }

    /// Records progress now.
    pub fn heartbeat(&self) -> Instant {
        self.heartbeat.beat()
    }

    /// Time of the latest heartbeat.
    pub fn last_heartbeat(&self) -> Instant {
        self.heartbeat.last()
    }

    /// Returns `true` while a heal is in progress.
    pub fn is_healing(&self) -> bool {
        self.healing.load(Ordering::Acquire)
    }

    /// Reports every element, source first and health checker last.
    pub fn elements(&self) -> Vec<ElementReport> {
        std::iter::once(&self.source_activity)
            .chain(self.activities.iter())
            .map(|activity| ElementReport {
                name: activity.name().to_string(),
                state: activity.state(),
                idle_secs: activity.last_activity().elapsed().as_secs_f64(),
            })
            .collect()
    }

    /// Launches a heal of the source in the background, unless one is already running.
    ///
    /// Returns the handle of the launched heal, or `None` if the request was ignored. Must be called from within a
    /// Tokio runtime.
    pub fn launch_heal(&self) -> Option<JoinHandle<HealOutcome>> {
        if self
            .healing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(pipeline = %self.name, "Heal already in progress. Ignoring request.");
            return None;
        }

        // Keeps the health check from asking again while the heal is launched.
        self.heartbeat.beat();

        let guard = HealingGuard(Arc::clone(&self.healing));
        let source = Arc::clone(&self.source);
        let heartbeat = Arc::clone(&self.heartbeat);
        let name = self.name.clone();

        Some(spawn_traced(async move {
            let _guard = guard;

            info!(pipeline = %name, "Healing pipeline.");
            let outcome = source.heal().await;
            heartbeat.beat();

            match outcome {
                HealOutcome::Healed => info!(pipeline = %name, "Pipeline healed."),
                HealOutcome::TooSoon => debug!(pipeline = %name, "Previous heal too recent. Skipped."),
                HealOutcome::NotRunning => warn!(pipeline = %name, "Source not running. Nothing to heal."),
            }
            outcome
        }))
    }

    fn take_chain(&self) -> Result<ElementNode, GenericError> {
        let mut chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut *chain, ChainState::InUse) {
            ChainState::Assembled(head) => Ok(head),
            ChainState::Unassembled(nodes) => {
                let head = nodes
                    .into_iter()
                    .rev()
                    .reduce(|next, mut node| {
                        node.connect_to_next(next);
                        node
                    })
                    .ok_or_else(|| generic_error!("Pipeline '{}' has no elements.", self.name))?;
                debug!(pipeline = %self.name, chain = ?head, "Assembled element chain.");
                Ok(head)
            }
            ChainState::InUse => Err(generic_error!("Pipeline '{}' is already running.", self.name)),
        }
    }

    fn restore_chain(&self, head: ElementNode) {
        *self.chain.lock().unwrap_or_else(PoisonError::into_inner) = ChainState::Assembled(head);
    }
}

struct HealingGuard(Arc<AtomicBool>);

impl Drop for HealingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl ManagedService for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), GenericError> {
        let mut head = self.take_chain()?;

        self.source_activity.set_state(ElementState::Running);
        head.set_state(ElementState::Running);
        self.heartbeat.beat();
        info!(pipeline = %self.name, source = self.source.name(), "Pipeline started.");

        let context = SourceContext::new(Arc::clone(&self.source_activity), Some(&mut head));
        let result = self.source.run(context).await;

        head.set_state(ElementState::Stopped);
        self.source_activity.set_state(ElementState::Stopped);
        self.restore_chain(head);
        info!(pipeline = %self.name, "Pipeline stopped.");

        result
    }

    async fn stop(&self) {
        debug!(pipeline = %self.name, "Stopping pipeline.");
        self.source.stop().await;
    }

    async fn healthcheck(&self) -> HealthStatus {
        let status = if self.is_healing() {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Ok
        };
        HealthStatus::new(self.heartbeat.last(), status)
    }

    async fn heal(&self) {
        let _ = self.launch_heal();
    }
}
