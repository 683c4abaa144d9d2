use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use super::engine::Engine;
use super::graph::{Graph, GraphBuilder, GraphError, WorkflowOutput, WorkflowState};
use crate::error::WorkflowError;
use crate::state_machine::JobKind;

/// Outcome of one successful workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub output: WorkflowOutput,
    pub path: Vec<String>,
}

/// A registered workflow with its state type erased, so graphs over
/// different state types can live in one registry.
#[async_trait]
pub trait Workflow: Send + Sync {
    fn kind(&self) -> JobKind;

    fn step_names(&self) -> Vec<&'static str>;

    async fn run(&self, engine: &Engine, input: &Value) -> Result<WorkflowRun, WorkflowError>;
}

#[async_trait]
impl<S: WorkflowState> Workflow for Graph<S> {
    fn kind(&self) -> JobKind {
        Graph::kind(self)
    }

    fn step_names(&self) -> Vec<&'static str> {
        Graph::step_names(self).to_vec()
    }

    async fn run(&self, engine: &Engine, input: &Value) -> Result<WorkflowRun, WorkflowError> {
        let state = S::from_input(input).map_err(|source| WorkflowError::Step {
            step: self.entry().to_string(),
            source,
        })?;
        let execution = engine.execute(self, state).await?;
        let output = execution.state.into_output().map_err(|source| WorkflowError::Step {
            step: execution.terminal.to_string(),
            source,
        })?;
        Ok(WorkflowRun {
            output,
            path: execution.path.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("workflow {0} registered twice")]
    Duplicate(JobKind),

    #[error(transparent)]
    InvalidGraph(#[from] GraphError),
}

/// Collects workflows at startup. [`RegistryBuilder::build`] freezes it.
#[derive(Default)]
pub struct RegistryBuilder {
    workflows: BTreeMap<JobKind, Arc<dyn Workflow>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, workflow: impl Workflow + 'static) -> Result<Self, RegistryError> {
        let kind = workflow.kind();
        if self.workflows.contains_key(&kind) {
            return Err(RegistryError::Duplicate(kind));
        }
        self.workflows.insert(kind, Arc::new(workflow));
        Ok(self)
    }

    /// Validate `graph` and register it.
    pub fn register_graph<S: WorkflowState>(self, graph: GraphBuilder<S>) -> Result<Self, RegistryError> {
        self.register(graph.build()?)
    }

    pub fn build(self) -> WorkflowRegistry {
        for (kind, workflow) in &self.workflows {
            info!(%kind, steps = ?workflow.step_names(), "workflow registered");
        }
        WorkflowRegistry {
            workflows: self.workflows,
        }
    }
}

/// Read-only map from job kind to workflow, shared across workers.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<JobKind, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn lookup(&self, kind: JobKind) -> Result<Arc<dyn Workflow>, WorkflowError> {
        self.workflows
            .get(&kind)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflowType(kind.to_string()))
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.workflows.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.workflows.keys().copied()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.workflows.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::workflow::graph::step_fn;
    use serde_json::json;

    struct Echo(Value);

    impl WorkflowState for Echo {
        fn from_input(input: &Value) -> Result<Self, StepError> {
            if input.is_object() {
                Ok(Echo(input.clone()))
            } else {
                Err(StepError::InvalidInput("expected an object".into()))
            }
        }

        fn into_output(self) -> Result<WorkflowOutput, StepError> {
            Ok(WorkflowOutput::new(self.0))
        }
    }

    fn echo_graph(kind: JobKind) -> GraphBuilder<Echo> {
        Graph::builder(kind)
            .entry("start")
            .step("start", step_fn(|e: Echo| -> Result<Echo, StepError> { Ok(e) }))
            .step("done", step_fn(|e: Echo| -> Result<Echo, StepError> { Ok(e) }))
            .edge("start", "done")
    }

    #[tokio::test]
    async fn lookup_runs_registered_workflow() {
        let registry = WorkflowRegistry::builder()
            .register_graph(echo_graph(JobKind::LessonContent))
            .unwrap()
            .build();

        let workflow = registry.lookup(JobKind::LessonContent).unwrap();
        let run = workflow
            .run(&Engine::default(), &json!({"lesson_id": "l1"}))
            .await
            .unwrap();
        assert_eq!(run.output.result, json!({"lesson_id": "l1"}));
        assert_eq!(run.path, vec!["start", "done"]);
    }

    #[test]
    fn unknown_kind_fails_lookup() {
        let registry = WorkflowRegistry::builder()
            .register_graph(echo_graph(JobKind::LessonContent))
            .unwrap()
            .build();
        let err = registry.lookup(JobKind::OnboardingAssessment).err().unwrap();
        assert!(matches!(err, WorkflowError::UnknownWorkflowType(ref k) if k == "onboarding_assessment"));
        assert!(!registry.contains(JobKind::OnboardingAssessment));
    }

    #[test]
    fn duplicate_and_invalid_registrations_fail_fast() {
        let dup = WorkflowRegistry::builder()
            .register_graph(echo_graph(JobKind::LessonContent))
            .unwrap()
            .register_graph(echo_graph(JobKind::LessonContent));
        assert!(matches!(dup, Err(RegistryError::Duplicate(JobKind::LessonContent))));

        let invalid = WorkflowRegistry::builder().register_graph(echo_graph(JobKind::LessonContent).edge("done", "nowhere"));
        assert!(matches!(invalid, Err(RegistryError::InvalidGraph(GraphError::UnknownTarget { .. }))));
    }

    #[tokio::test]
    async fn bad_input_is_not_retryable() {
        let registry = WorkflowRegistry::builder()
            .register_graph(echo_graph(JobKind::LessonContent))
            .unwrap()
            .build();
        let err = registry
            .lookup(JobKind::LessonContent)
            .unwrap()
            .run(&Engine::default(), &json!("not an object"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
