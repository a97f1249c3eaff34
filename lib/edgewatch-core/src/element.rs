//! Pipe elements and the chain that links them.

use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::Instant;

use edgewatch_error::GenericError;
use metrics::{counter, Counter};
use tracing::{trace, warn};

use crate::{heartbeat::Heartbeat, sample::Sample};

/// Samples produced by a single call to [`PipeElement::process_sample`].
///
/// Outputs are pulled lazily: each one is walked to the end of the chain before the next one is produced. An `Err`
/// item drops that output and any remaining ones from the same call.
pub type SampleOutputs<'a> = Box<dyn Iterator<Item = Result<Sample, GenericError>> + Send + 'a>;

/// Wraps a single sample as [`SampleOutputs`].
pub fn single(sample: Sample) -> SampleOutputs<'static> {
    Box::new(std::iter::once(Ok(sample)))
}

/// Produces no outputs.
pub fn nothing() -> SampleOutputs<'static> {
    Box::new(std::iter::empty())
}

/// A unit of stream processing.
pub trait PipeElement: Send {
    /// Name of the element, used in logs and health reports.
    fn name(&self) -> &str;

    /// Processes one sample, producing zero or more samples for the next element.
    ///
    /// Elements that have nothing to report for a sample should still emit [`Sample::Empty`] so that activity keeps
    /// reaching the end of the chain.
    ///
    /// # Errors
    ///
    /// Returning an error drops the sample. It is logged and processing continues with the next sample.
    fn process_sample(&mut self, sample: Sample) -> Result<SampleOutputs<'_>, GenericError>;
}

/// Lifecycle state of an element.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ElementState {
    /// Not receiving samples.
    Stopped = 0,

    /// Part of a running pipeline.
    Running = 1,
}

/// Shared view of an element's liveness and counters.
///
/// The element itself lives inside the chain, owned by whatever context runs the pipeline. This is the part other
/// contexts may read.
pub struct ElementActivity {
    name: String,
    state: AtomicU8,
    heartbeat: Heartbeat,
    processed: AtomicU64,
    failed: AtomicU64,
    processed_total: Counter,
    failed_total: Counter,
}

impl ElementActivity {
    /// Creates a new `ElementActivity` for an element with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            processed_total: counter!("edgewatch_element_samples_processed_total", "element" => name.clone()),
            failed_total: counter!("edgewatch_element_samples_failed_total", "element" => name.clone()),
            name,
            state: AtomicU8::new(ElementState::Stopped as u8),
            heartbeat: Heartbeat::new(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ElementState {
        match self.state.load(Ordering::Acquire) {
            1 => ElementState::Running,
            _ => ElementState::Stopped,
        }
    }

    /// Sets the lifecycle state.
    pub fn set_state(&self, state: ElementState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Records activity now.
    pub fn beat(&self) -> Instant {
        self.heartbeat.beat()
    }

    /// Time of the latest activity.
    pub fn last_activity(&self) -> Instant {
        self.heartbeat.last()
    }

    /// Number of samples processed successfully.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Number of samples dropped because processing failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processed_total.increment(1);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.failed_total.increment(1);
    }
}

impl std::fmt::Debug for ElementActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementActivity")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("processed", &self.processed())
            .field("failed", &self.failed())
            .finish()
    }
}

/// A link in a pipeline's chain of elements.
///
/// Each node owns the next one, so a chain is always a simple path from head to tail.
pub struct ElementNode {
    element: Box<dyn PipeElement>,
    activity: Arc<ElementActivity>,
    next: Option<Box<ElementNode>>,
}

impl ElementNode {
    /// Creates a new, unconnected `ElementNode`.
    pub fn new(element: Box<dyn PipeElement>) -> Self {
        let activity = Arc::new(ElementActivity::new(element.name()));
        Self {
            element,
            activity,
            next: None,
        }
    }

    /// Shared activity handle for this element.
    pub fn activity(&self) -> &Arc<ElementActivity> {
        &self.activity
    }

    /// Sets the node samples are forwarded to, replacing any previous one.
    pub fn connect_to_next(&mut self, next: ElementNode) {
        self.next = Some(Box::new(next));
    }

    /// The next node, if any.
    pub fn next(&self) -> Option<&ElementNode> {
        self.next.as_deref()
    }

    /// Activity handles of this node and every node after it, in order.
    pub fn activities(&self) -> Vec<Arc<ElementActivity>> {
        let mut activities = Vec::new();
        let mut node = Some(self);
        while let Some(current) = node {
            activities.push(Arc::clone(&current.activity));
            node = current.next();
        }
        activities
    }

    /// Sets the state of this node and every node after it.
    pub fn set_state(&self, state: ElementState) {
        let mut node = Some(self);
        while let Some(current) = node {
            current.activity.set_state(state);
            node = current.next();
        }
    }

    /// Processes a sample and walks every output through the rest of the chain.
    ///
    /// Processing is depth-first: each output reaches the tail before the next output is pulled. Failures are
    /// contained to the sample that caused them.
    pub fn receive_next_sample(&mut self, sample: Sample) {
        self.activity.beat();

        let kind = sample.kind();
        let outputs = match self.element.process_sample(sample) {
            Ok(outputs) => outputs,
            Err(e) => {
                self.activity.record_failure();
                warn!(element = %self.activity.name, sample = kind, error = %e, "Failed to process sample. Dropping it.");
                return;
            }
        };

        for output in outputs {
            match output {
                Ok(output) => {
                    if let Some(next) = self.next.as_deref_mut() {
                        next.receive_next_sample(output);
                    } else {
                        trace!(element = %self.activity.name, sample = output.kind(), "End of chain reached.");
                    }
                }
                Err(e) => {
                    self.activity.record_failure();
                    warn!(element = %self.activity.name, sample = kind, error = %e, "Failed to produce output sample. Dropping remaining outputs.");
                    return;
                }
            }
            self.activity.beat();
        }

        self.activity.record_processed();
    }
}

impl std::fmt::Debug for ElementNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementNode")
            .field("name", &self.activity.name)
            .field("next", &self.next)
            .finish()
    }
}

/// Terminal element that records a pipeline heartbeat for every sample it receives, empty ones included.
pub struct HealthChecker {
    heartbeat: Arc<Heartbeat>,
}

impl HealthChecker {
    /// Name the health checker reports under.
    pub const NAME: &'static str = "health_check";

    /// Creates a new `HealthChecker` beating the given heartbeat.
    pub fn new(heartbeat: Arc<Heartbeat>) -> Self {
        Self { heartbeat }
    }
}

impl PipeElement for HealthChecker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn process_sample(&mut self, _sample: Sample) -> Result<SampleOutputs<'_>, GenericError> {
        self.heartbeat.beat();
        Ok(nothing())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use edgewatch_error::generic_error;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::sample::{ImageFrame, PixelFormat};

    /// A 1x1 grayscale frame whose single pixel carries `index`.
    pub fn indexed_sample(index: u8) -> Sample {
        Sample::Image(ImageFrame::new(1, 1, PixelFormat::Gray8, Bytes::copy_from_slice(&[index])).unwrap())
    }

    pub fn sample_index(sample: &Sample) -> Option<u8> {
        sample.image().map(|image| image.data()[0])
    }

    /// Records `(element, sample index)` for every sample, then passes it through.
    pub struct Recorder {
        pub name: String,
        pub log: Arc<Mutex<Vec<(String, Option<u8>)>>>,
    }

    impl PipeElement for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn process_sample(&mut self, sample: Sample) -> Result<SampleOutputs<'_>, GenericError> {
            self.log.lock().unwrap().push((self.name.clone(), sample_index(&sample)));
            Ok(single(sample))
        }
    }

    /// Fails on samples with the given index.
    pub struct FailOn {
        pub index: u8,
    }

    impl PipeElement for FailOn {
        fn name(&self) -> &str {
            "fail_on"
        }

        fn process_sample(&mut self, sample: Sample) -> Result<SampleOutputs<'_>, GenericError> {
            if sample_index(&sample) == Some(self.index) {
                return Err(generic_error!("cannot handle sample {}", self.index));
            }
            Ok(single(sample))
        }
    }

    /// Emits the incoming sample `copies` times.
    struct FanOut {
        copies: usize,
    }

    impl PipeElement for FanOut {
        fn name(&self) -> &str {
            "fan_out"
        }

        fn process_sample(&mut self, sample: Sample) -> Result<SampleOutputs<'_>, GenericError> {
            Ok(Box::new(std::iter::repeat(sample).take(self.copies).map(Ok)))
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<(String, Option<u8>)>>>) -> ElementNode {
        ElementNode::new(Box::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
        }))
    }

    #[test]
    fn samples_walk_chain_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut second = recorder("second", &log);
        second.connect_to_next(recorder("third", &log));
        let mut head = recorder("first", &log);
        head.connect_to_next(second);

        let activities = head.activities();
        let mut previous_beats = activities.iter().map(|a| a.last_activity()).collect::<Vec<_>>();
        for index in 0..3 {
            head.receive_next_sample(indexed_sample(index));

            let beats = activities.iter().map(|a| a.last_activity()).collect::<Vec<_>>();
            assert!(beats.iter().zip(&previous_beats).all(|(now, before)| now >= before));
            previous_beats = beats;
        }

        let expected = (0..3)
            .flat_map(|i| ["first", "second", "third"].map(|name| (name.to_string(), Some(i))))
            .collect::<Vec<_>>();
        assert_eq!(*log.lock().unwrap(), expected);
        assert!(activities.iter().all(|a| a.processed() == 3));
    }

    #[test]
    fn failed_sample_does_not_stop_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut head = ElementNode::new(Box::new(FailOn { index: 2 }));
        head.connect_to_next(recorder("sink", &log));

        for index in 1..=3 {
            head.receive_next_sample(indexed_sample(index));
        }

        let seen = log.lock().unwrap().iter().map(|(_, i)| *i).collect::<Vec<_>>();
        assert_eq!(seen, vec![Some(1), Some(3)]);
        assert_eq!(head.activity().failed(), 1);
        assert_eq!(head.activity().processed(), 2);
    }

    #[test]
    fn outputs_are_forwarded_depth_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut head = ElementNode::new(Box::new(FanOut { copies: 3 }));
        head.connect_to_next(recorder("sink", &log));

        head.receive_next_sample(indexed_sample(7));
        head.receive_next_sample(Sample::Empty);

        let seen = log.lock().unwrap().iter().map(|(_, i)| *i).collect::<Vec<_>>();
        assert_eq!(seen, vec![Some(7), Some(7), Some(7), None, None, None]);
    }

    #[test]
    fn health_checker_beats_on_empty_samples() {
        let heartbeat = Arc::new(Heartbeat::new());
        let before = heartbeat.last();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut node = ElementNode::new(Box::new(HealthChecker::new(Arc::clone(&heartbeat))));
        node.receive_next_sample(Sample::Empty);

        assert!(heartbeat.last() > before);
        assert_eq!(node.activity().name(), HealthChecker::NAME);
    }

    #[test]
    fn state_applies_to_whole_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut head = recorder("first", &log);
        head.connect_to_next(recorder("second", &log));

        head.set_state(ElementState::Running);
        assert!(head.activities().iter().all(|a| a.state() == ElementState::Running));

        head.set_state(ElementState::Stopped);
        assert!(head.activities().iter().all(|a| a.state() == ElementState::Stopped));
    }
}
