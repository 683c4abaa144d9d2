//! Workflow graphs, their registry and the engine that walks them.

mod engine;
mod graph;
mod registry;

pub use engine::{DEFAULT_MAX_TRANSITIONS, Engine, Execution};
pub use graph::{
    Conditional, ContextStep, Edge, FnStep, Graph, GraphBuilder, GraphError, Route, Step,
    StepFuture, WorkflowOutput, WorkflowState, step_fn, step_with,
};
pub use registry::{RegistryBuilder, RegistryError, Workflow, WorkflowRegistry, WorkflowRun};
