//! Turns pipeline definitions into runnable pipelines.
//!
//! The set of element types is closed: see [`ElementKind`]. Building happens in two steps. Planning resolves source
//! references and validates every element's parameters without touching anything outside the process, which is all
//! `check-config` needs. Building then constructs the elements of a plan, loading models and creating output
//! directories as it goes.
//!
//! A bad element never takes down its pipeline: it is logged and left out, and the rest of the chain is built without
//! it. The only fatal problem for a pipeline is not starting with a source.

use std::{fmt, str::FromStr, sync::Arc};

use edgewatch_config::{value::Value, ConfigurationError, EdgewatchConfiguration, ElementDefinition};
use edgewatch_core::{element::PipeElement, pipeline::Pipeline, source::Source};
use edgewatch_error::GenericError;
use serde::de::DeserializeOwned;
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, error, info, warn};

use crate::{
    destinations::{SaveDetections, SaveDetectionsConfiguration},
    inference::{DetectionFilter, DetectorConfiguration, InferenceEngine, InferenceProvider},
    sources::{AvSource, AvSourceConfiguration},
    timeline::{EventLog, PipelineContext},
    transforms::{FaceDetector, ObjectDetector},
};

/// A registry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// Element name does not match any known element type.
    #[snafu(display("Unknown pipeline element '{}'.", name))]
    UnknownElement {
        /// Name found in the pipeline definition.
        name: String,
    },

    /// Element parameters could not be deserialized.
    #[snafu(display("Invalid parameters for element '{}': {}", element, source))]
    InvalidParameters {
        /// Element type.
        element: ElementKind,

        /// The underlying configuration error.
        source: ConfigurationError,
    },

    /// A source reference names a source that is not defined.
    #[snafu(display("Source '{}' is not defined.", name))]
    UnknownSource {
        /// Referenced source name.
        name: String,
    },

    /// A source appeared after the start of the pipeline.
    #[snafu(display("Only the first element of a pipeline can be a source."))]
    MisplacedSource,

    /// The first usable element of a pipeline is not a source.
    #[snafu(display("Pipeline '{}' does not start with a source.", pipeline))]
    MissingSource {
        /// Pipeline name.
        pipeline: String,
    },

    /// A detection element was configured but there is no way to run models.
    #[snafu(display("No inference provider is available to load element '{}'.", element))]
    NoInferenceProvider {
        /// Element type.
        element: ElementKind,
    },

    /// An element was valid but could not be constructed.
    #[snafu(display("Failed to load element '{}': {}", element, source))]
    FailedToLoad {
        /// Element type.
        element: ElementKind,

        /// The underlying error.
        source: GenericError,
    },
}

/// Every element type a pipeline can be built from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ElementKind {
    /// Audio/video source.
    Source,

    /// Object detection.
    DetectObjects,

    /// Face detection on detected people.
    DetectFaces,

    /// Detection storage.
    SaveDetections,
}

impl ElementKind {
    /// Name of the element type in pipeline definitions.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::DetectObjects => ObjectDetector::NAME,
            Self::DetectFaces => FaceDetector::NAME,
            Self::SaveDetections => SaveDetections::NAME,
        }
    }
}

impl FromStr for ElementKind {
    type Err = RegistryError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        [
            Self::Source,
            Self::DetectObjects,
            Self::DetectFaces,
            Self::SaveDetections,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == name)
        .ok_or_else(|| RegistryError::UnknownElement { name: name.to_string() })
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An element whose parameters have been validated.
#[derive(Clone, Debug)]
pub enum ElementPlan {
    /// Object detection.
    DetectObjects(DetectorConfiguration),

    /// Face detection.
    DetectFaces(DetectorConfiguration),

    /// Detection storage.
    SaveDetections(SaveDetectionsConfiguration),
}

impl ElementPlan {
    /// Element type.
    pub fn kind(&self) -> ElementKind {
        match self {
            Self::DetectObjects(_) => ElementKind::DetectObjects,
            Self::DetectFaces(_) => ElementKind::DetectFaces,
            Self::SaveDetections(_) => ElementKind::SaveDetections,
        }
    }
}

/// An element left out of a pipeline, and why.
#[derive(Debug)]
pub struct SkippedElement {
    /// Position of the element in the pipeline definition.
    pub position: usize,

    /// Element name as written in the pipeline definition.
    pub name: String,

    /// Why it was left out.
    pub reason: RegistryError,
}

/// A validated pipeline, ready to be built.
#[derive(Debug)]
pub struct PipelinePlan {
    /// Pipeline name.
    pub name: String,

    /// Source name: the referenced source's name, or `source` when defined inline.
    pub source_name: String,

    /// Source configuration.
    pub source: AvSourceConfiguration,

    /// Elements following the source, in order.
    pub elements: Vec<ElementPlan>,

    /// Elements that were left out.
    pub skipped: Vec<SkippedElement>,
}

enum Resolved {
    Source { name: String, config: AvSourceConfiguration },
    Element(ElementPlan),
}

/// Builds pipelines from the engine configuration.
pub struct PipelineBuilder<'a> {
    config: &'a EdgewatchConfiguration,
    provider: Option<Arc<dyn InferenceProvider>>,
    event_log: Option<Arc<EventLog>>,
}

impl<'a> PipelineBuilder<'a> {
    /// Creates a new `PipelineBuilder` with no inference provider and no event log.
    pub fn new(config: &'a EdgewatchConfiguration) -> Self {
        Self {
            config,
            provider: None,
            event_log: None,
        }
    }

    /// Sets the provider used to load detection models.
    pub fn with_inference_provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the event log shared by every pipeline.
    pub fn with_event_log(mut self, event_log: Arc<EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// Plans every configured pipeline, in name order.
    ///
    /// Pipelines that cannot be planned are returned as errors alongside the ones that can.
    pub fn plan_all(&self) -> Vec<Result<PipelinePlan, RegistryError>> {
        self.config
            .pipelines
            .iter()
            .map(|(name, definitions)| self.plan(name, definitions))
            .collect()
    }

    /// Plans a single pipeline.
    ///
    /// Elements that cannot be resolved are logged and recorded in [`PipelinePlan::skipped`].
    ///
    /// # Errors
    ///
    /// If the first element that can be resolved is not a source, or there is none, an error is returned.
    pub fn plan(&self, pipeline: &str, definitions: &[ElementDefinition]) -> Result<PipelinePlan, RegistryError> {
        let mut source = None;
        let mut elements = Vec::new();
        let mut skipped = Vec::new();

        for (position, definition) in definitions.iter().enumerate() {
            let resolved = self.resolve(definition).and_then(|resolved| match (resolved, &source) {
                (Resolved::Source { .. }, Some(_)) => Err(RegistryError::MisplacedSource),
                (Resolved::Element(_), None) => Err(RegistryError::MissingSource {
                    pipeline: pipeline.to_string(),
                }),
                (resolved, _) => Ok(resolved),
            });

            match resolved {
                Ok(Resolved::Source { name, config }) => source = Some((name, config)),
                Ok(Resolved::Element(element)) => elements.push(element),
                Err(e @ RegistryError::MissingSource { .. }) => return Err(e),
                Err(reason) => {
                    warn!(pipeline, element = definition.name(), position, error = %reason, "Skipping pipeline element.");
                    skipped.push(SkippedElement {
                        position,
                        name: definition.name().to_string(),
                        reason,
                    });
                }
            }
        }

        let (source_name, source) = source.ok_or_else(|| RegistryError::MissingSource {
            pipeline: pipeline.to_string(),
        })?;

        Ok(PipelinePlan {
            name: pipeline.to_string(),
            source_name,
            source,
            elements,
            skipped,
        })
    }

    fn resolve(&self, definition: &ElementDefinition) -> Result<Resolved, RegistryError> {
        let kind = definition.name().parse::<ElementKind>()?;
        let resolved = match kind {
            ElementKind::Source => {
                let (name, config) = self.resolve_source(definition)?;
                Resolved::Source { name, config }
            }
            ElementKind::DetectObjects => Resolved::Element(ElementPlan::DetectObjects(params(kind, definition)?)),
            ElementKind::DetectFaces => Resolved::Element(ElementPlan::DetectFaces(params(kind, definition)?)),
            ElementKind::SaveDetections => Resolved::Element(ElementPlan::SaveDetections(params(kind, definition)?)),
        };
        Ok(resolved)
    }

    fn resolve_source(&self, definition: &ElementDefinition) -> Result<(String, AvSourceConfiguration), RegistryError> {
        match definition.params() {
            Value::String(_, name) => {
                let referenced_params = self
                    .config
                    .sources
                    .get(name)
                    .ok_or_else(|| RegistryError::UnknownSource { name: name.clone() })?;
                let referenced = ElementDefinition::new(definition.name(), referenced_params.clone());
                Ok((name.clone(), source_params(&referenced)?))
            }
            _ => Ok((ElementKind::Source.to_string(), source_params(definition)?)),
        }
    }

    /// Builds a planned pipeline.
    ///
    /// Elements that fail to load are logged and left out.
    pub fn build(&self, plan: PipelinePlan) -> Pipeline {
        let context = PipelineContext::new(&plan.name, &self.config.data_dir, self.event_log.clone());

        let elements = plan
            .elements
            .into_iter()
            .filter_map(|element| {
                let kind = element.kind();
                match self.build_element(element, &context) {
                    Ok(element) => Some(element),
                    Err(e) => {
                        error!(pipeline = %plan.name, element = %kind, error = %e, "Failed to load pipeline element. Skipping it.");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        let source: Arc<dyn Source> = Arc::new(AvSource::new(plan.source_name, plan.source));
        debug!(pipeline = %plan.name, source = source.name(), elements = elements.len(), "Built pipeline.");
        Pipeline::new(plan.name, source, elements)
    }

    fn build_element(
        &self, element: ElementPlan, context: &PipelineContext,
    ) -> Result<Box<dyn PipeElement>, RegistryError> {
        let kind = element.kind();
        let element: Box<dyn PipeElement> = match element {
            ElementPlan::DetectObjects(config) => {
                let (engine, filter) = self.load_detector(kind, &config)?;
                Box::new(ObjectDetector::new(engine, filter))
            }
            ElementPlan::DetectFaces(config) => {
                let (engine, filter) = self.load_detector(kind, &config)?;
                Box::new(FaceDetector::new(engine, filter))
            }
            ElementPlan::SaveDetections(config) => {
                Box::new(SaveDetections::new(config, context.clone()).context(FailedToLoad { element: kind })?)
            }
        };
        Ok(element)
    }

    fn load_detector(
        &self, kind: ElementKind, config: &DetectorConfiguration,
    ) -> Result<(Box<dyn InferenceEngine>, DetectionFilter), RegistryError> {
        let provider = self
            .provider
            .as_deref()
            .ok_or(RegistryError::NoInferenceProvider { element: kind })?;
        let filter = config.filter().context(FailedToLoad { element: kind })?;
        let engine = config.load_engine(provider).context(FailedToLoad { element: kind })?;
        Ok((engine, filter))
    }

    /// Plans and builds every configured pipeline.
    ///
    /// Pipelines that cannot be planned are logged and left out.
    pub fn build_all(&self) -> Vec<Pipeline> {
        self.plan_all()
            .into_iter()
            .filter_map(|plan| match plan {
                Ok(plan) => {
                    info!(pipeline = %plan.name, source = %plan.source.uri, "Loading pipeline.");
                    Some(self.build(plan))
                }
                Err(e) => {
                    error!(error = %e, "Failed to plan pipeline. Skipping it.");
                    None
                }
            })
            .collect()
    }
}

fn params<T>(kind: ElementKind, definition: &ElementDefinition) -> Result<T, RegistryError>
where
    T: DeserializeOwned,
{
    definition.params_as().context(InvalidParameters { element: kind })
}

fn source_params(definition: &ElementDefinition) -> Result<AvSourceConfiguration, RegistryError> {
    let config = params::<AvSourceConfiguration>(ElementKind::Source, definition)?;
    config
        .validate()
        .context(InvalidParameters { element: ElementKind::Source })?;
    Ok(config)
}
