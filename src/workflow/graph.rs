use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::{EngineFault, StepError};
use crate::state_machine::{JobKind, NewJob};

/// What a finished workflow hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowOutput {
    /// Stored as the job's result.
    pub result: Value,
    /// Jobs to enqueue once the result is stored.
    pub follow_ups: Vec<NewJob>,
}

impl WorkflowOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            follow_ups: Vec::new(),
        }
    }
}

/// Typed state threaded through one workflow execution.
pub trait WorkflowState: Send + Sized + 'static {
    /// Seed the state from a job's input payload.
    fn from_input(input: &Value) -> Result<Self, StepError>;

    /// Project the final state into the job result.
    fn into_output(self) -> Result<WorkflowOutput, StepError>;
}

#[async_trait]
pub trait Step<S>: Send + Sync {
    async fn run(&self, state: S) -> Result<S, StepError>;
}

pub type StepFuture<'a, S> = Pin<Box<dyn Future<Output = Result<S, StepError>> + Send + 'a>>;

/// A synchronous state transformation.
pub struct FnStep<F>(F);

pub fn step_fn<S, F>(f: F) -> FnStep<F>
where
    F: Fn(S) -> Result<S, StepError> + Send + Sync,
{
    FnStep(f)
}

#[async_trait]
impl<S, F> Step<S> for FnStep<F>
where
    S: Send + 'static,
    F: Fn(S) -> Result<S, StepError> + Send + Sync,
{
    async fn run(&self, state: S) -> Result<S, StepError> {
        (self.0)(state)
    }
}

/// An async step that borrows shared context (collaborators, limits).
pub struct ContextStep<C, F> {
    ctx: Arc<C>,
    f: F,
}

pub fn step_with<C, S, F>(ctx: &Arc<C>, f: F) -> ContextStep<C, F>
where
    C: Send + Sync + 'static,
    S: Send + 'static,
    F: for<'a> Fn(&'a C, S) -> StepFuture<'a, S> + Send + Sync,
{
    ContextStep {
        ctx: Arc::clone(ctx),
        f,
    }
}

#[async_trait]
impl<C, S, F> Step<S> for ContextStep<C, F>
where
    C: Send + Sync + 'static,
    S: Send + 'static,
    F: for<'a> Fn(&'a C, S) -> StepFuture<'a, S> + Send + Sync,
{
    async fn run(&self, state: S) -> Result<S, StepError> {
        (self.f)(self.ctx.as_ref(), state).await
    }
}

/// A finite set of outcomes a router function can pick between.
pub trait Route: Copy + PartialEq + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn label(&self) -> &'static str;
}

type Predicate<S> = Box<dyn Fn(&S) -> bool + Send + Sync>;

/// Ordered predicate branches plus an optional fallback.
pub struct Conditional<S> {
    branches: Vec<(String, Predicate<S>, &'static str)>,
    default: Option<&'static str>,
    exhaustive: bool,
}

impl<S> Conditional<S> {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            default: None,
            exhaustive: false,
        }
    }

    pub fn when(
        mut self,
        label: &str,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        to: &'static str,
    ) -> Self {
        self.branches.push((label.to_string(), Box::new(predicate), to));
        self
    }

    pub fn otherwise(mut self, to: &'static str) -> Self {
        self.default = Some(to);
        self
    }

    fn targets(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.branches.iter().map(|(_, _, to)| *to).chain(self.default)
    }
}

impl<S> Default for Conditional<S> {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Edge<S> {
    Direct(&'static str),
    Conditional(Conditional<S>),
}

impl<S> Edge<S> {
    fn targets(&self) -> Vec<&'static str> {
        match self {
            Edge::Direct(to) => vec![*to],
            Edge::Conditional(cond) => cond.targets().collect(),
        }
    }
}

/// Structural defects rejected when a graph is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("{kind}: no entry step declared")]
    MissingEntry { kind: JobKind },

    #[error("{kind}: entry step `{step}` is not declared")]
    UnknownEntry { kind: JobKind, step: String },

    #[error("{kind}: step `{step}` declared twice")]
    DuplicateStep { kind: JobKind, step: String },

    #[error("{kind}: step `{step}` has more than one outgoing edge declaration")]
    DuplicateEdge { kind: JobKind, step: String },

    #[error("{kind}: edge from undeclared step `{step}`")]
    UnknownSource { kind: JobKind, step: String },

    #[error("{kind}: edge `{from}` -> `{to}` targets an undeclared step")]
    UnknownTarget { kind: JobKind, from: String, to: String },

    #[error("{kind}: expected exactly one terminal step, found {found:?}")]
    TerminalCount { kind: JobKind, found: Vec<String> },

    #[error("{kind}: conditional edge after `{step}` covers neither every route nor declares a default")]
    UncoveredBranch { kind: JobKind, step: String },

    #[error("{kind}: steps {steps:?} are unreachable from the entry step")]
    Unreachable { kind: JobKind, steps: Vec<String> },
}

/// A validated, immutable workflow graph for one job kind.
pub struct Graph<S> {
    kind: JobKind,
    entry: &'static str,
    terminal: &'static str,
    order: Vec<&'static str>,
    steps: HashMap<&'static str, Box<dyn Step<S>>>,
    edges: HashMap<&'static str, Edge<S>>,
    max_transitions: Option<usize>,
}

impl<S> Graph<S> {
    pub fn builder(kind: JobKind) -> GraphBuilder<S>
    where
        S: Send + 'static,
    {
        GraphBuilder::new(kind)
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn entry(&self) -> &'static str {
        self.entry
    }

    pub fn terminal(&self) -> &'static str {
        self.terminal
    }

    /// Step names in declaration order.
    pub fn step_names(&self) -> &[&'static str] {
        &self.order
    }

    pub fn max_transitions(&self) -> Option<usize> {
        self.max_transitions
    }

    pub(crate) fn step(&self, name: &str) -> Option<&dyn Step<S>> {
        self.steps.get(name).map(|step| step.as_ref())
    }

    /// Resolve the step that follows `from` given the state it produced.
    pub(crate) fn next(&self, from: &str, state: &S) -> Result<&'static str, EngineFault> {
        let edge = self.edges.get(from).ok_or_else(|| EngineFault::NoMatchingEdge {
            step: from.to_string(),
        })?;
        match edge {
            Edge::Direct(to) => Ok(*to),
            Edge::Conditional(cond) => cond
                .branches
                .iter()
                .find(|(_, predicate, _)| predicate(state))
                .map(|(_, _, to)| *to)
                .or(cond.default)
                .ok_or_else(|| EngineFault::NoMatchingEdge {
                    step: from.to_string(),
                }),
        }
    }
}

impl<S> fmt::Debug for Graph<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("kind", &self.kind)
            .field("entry", &self.entry)
            .field("terminal", &self.terminal)
            .field("steps", &self.order)
            .finish()
    }
}

pub struct GraphBuilder<S> {
    kind: JobKind,
    entry: Option<&'static str>,
    order: Vec<&'static str>,
    steps: HashMap<&'static str, Box<dyn Step<S>>>,
    edges: HashMap<&'static str, Edge<S>>,
    max_transitions: Option<usize>,
    error: Option<GraphError>,
}

impl<S: Send + 'static> GraphBuilder<S> {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            entry: None,
            order: Vec::new(),
            steps: HashMap::new(),
            edges: HashMap::new(),
            max_transitions: None,
            error: None,
        }
    }

    pub fn entry(mut self, step: &'static str) -> Self {
        self.entry = Some(step);
        self
    }

    /// Lower the engine's transition ceiling for this graph.
    pub fn max_transitions(mut self, limit: usize) -> Self {
        self.max_transitions = Some(limit);
        self
    }

    pub fn step(mut self, name: &'static str, step: impl Step<S> + 'static) -> Self {
        if self.steps.insert(name, Box::new(step)).is_some() {
            self.fail(GraphError::DuplicateStep {
                kind: self.kind,
                step: name.to_string(),
            });
        } else {
            self.order.push(name);
        }
        self
    }

    pub fn edge(self, from: &'static str, to: &'static str) -> Self {
        self.add_edge(from, Edge::Direct(to))
    }

    pub fn conditional(self, from: &'static str, cond: Conditional<S>) -> Self {
        self.add_edge(from, Edge::Conditional(cond))
    }

    /// Conditional edge driven by a router over a finite [`Route`] set.
    ///
    /// Branches are tried in the order of `targets`. Mapping every variant of
    /// `R` makes the edge exhaustive and no default is needed.
    pub fn route<R: Route>(
        self,
        from: &'static str,
        router: fn(&S) -> R,
        targets: &[(R, &'static str)],
    ) -> Self {
        let mut cond = Conditional::new();
        for &(route, to) in targets {
            cond = cond.when(route.label(), move |state: &S| router(state) == route, to);
        }
        cond.exhaustive = R::ALL.iter().all(|r| targets.iter().any(|(t, _)| t == r));
        self.conditional(from, cond)
    }

    fn add_edge(mut self, from: &'static str, edge: Edge<S>) -> Self {
        if self.edges.insert(from, edge).is_some() {
            self.fail(GraphError::DuplicateEdge {
                kind: self.kind,
                step: from.to_string(),
            });
        }
        self
    }

    fn fail(&mut self, err: GraphError) {
        self.error.get_or_insert(err);
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Graph<S>, GraphError> {
        let kind = self.kind;
        if let Some(err) = self.error {
            return Err(err);
        }

        let entry = self.entry.ok_or(GraphError::MissingEntry { kind })?;
        if !self.steps.contains_key(entry) {
            return Err(GraphError::UnknownEntry {
                kind,
                step: entry.to_string(),
            });
        }

        for (from, edge) in &self.edges {
            if !self.steps.contains_key(from) {
                return Err(GraphError::UnknownSource {
                    kind,
                    step: from.to_string(),
                });
            }
            if let Some(to) = edge.targets().into_iter().find(|to| !self.steps.contains_key(to)) {
                return Err(GraphError::UnknownTarget {
                    kind,
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            if let Edge::Conditional(cond) = edge {
                if !cond.exhaustive && cond.default.is_none() {
                    return Err(GraphError::UncoveredBranch {
                        kind,
                        step: from.to_string(),
                    });
                }
            }
        }

        let terminals: Vec<&'static str> = self
            .order
            .iter()
            .copied()
            .filter(|name| !self.edges.contains_key(name))
            .collect();
        if terminals.len() != 1 {
            return Err(GraphError::TerminalCount {
                kind,
                found: terminals.iter().map(|s| s.to_string()).collect(),
            });
        }
        let terminal = terminals[0];

        let mut reached: HashSet<&'static str> = HashSet::from([entry]);
        let mut stack = vec![entry];
        while let Some(current) = stack.pop() {
            if let Some(edge) = self.edges.get(current) {
                for to in edge.targets() {
                    if reached.insert(to) {
                        stack.push(to);
                    }
                }
            }
        }
        let unreachable: Vec<String> = self
            .order
            .iter()
            .filter(|name| !reached.contains(*name))
            .map(|name| name.to_string())
            .collect();
        if !unreachable.is_empty() {
            return Err(GraphError::Unreachable {
                kind,
                steps: unreachable,
            });
        }

        Ok(Graph {
            kind,
            entry,
            terminal,
            order: self.order,
            steps: self.steps,
            edges: self.edges,
            max_transitions: self.max_transitions,
        })
    }
}
