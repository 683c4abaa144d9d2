use tracing::{debug, trace};

use super::graph::{Graph, WorkflowState};
use crate::error::{EngineFault, WorkflowError};

pub const DEFAULT_MAX_TRANSITIONS: usize = 25;

/// Result of walking a graph to its terminal step.
#[derive(Debug)]
pub struct Execution<S> {
    pub state: S,
    pub terminal: &'static str,
    /// Every step run, in order, terminal included.
    pub path: Vec<&'static str>,
}

/// Walks a graph one step at a time. Steps never run concurrently within one
/// execution.
#[derive(Debug, Clone, Copy)]
pub struct Engine {
    max_transitions: usize,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSITIONS)
    }
}

impl Engine {
    pub fn new(max_transitions: usize) -> Self {
        Self { max_transitions }
    }

    /// Effective ceiling for `graph`: a graph may lower the engine's limit
    /// but never raise it.
    pub fn limit_for<S>(&self, graph: &Graph<S>) -> usize {
        graph
            .max_transitions()
            .map_or(self.max_transitions, |limit| limit.min(self.max_transitions))
    }

    pub async fn execute<S: WorkflowState>(&self, graph: &Graph<S>, mut state: S) -> Result<Execution<S>, WorkflowError> {
        let limit = self.limit_for(graph);
        let mut current = graph.entry();
        let mut path = Vec::new();
        let mut transitions = 0usize;

        loop {
            let step = graph
                .step(current)
                .ok_or_else(|| EngineFault::UnknownStep(current.to_string()))?;

            debug!(kind = %graph.kind(), step = current, "running step");
            state = step.run(state).await.map_err(|source| WorkflowError::Step {
                step: current.to_string(),
                source,
            })?;
            path.push(current);

            if current == graph.terminal() {
                return Ok(Execution {
                    state,
                    terminal: current,
                    path,
                });
            }

            let next = graph.next(current, &state)?;
            transitions += 1;
            if transitions > limit {
                return Err(EngineFault::StepLimitExceeded { limit }.into());
            }
            trace!(kind = %graph.kind(), from = current, to = next, "transition");
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::state_machine::JobKind;
    use crate::workflow::graph::{Conditional, Route, WorkflowOutput, step_fn};
    use serde_json::{Value, json};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter {
        n: u32,
        visited: Vec<&'static str>,
    }

    impl WorkflowState for Counter {
        fn from_input(input: &Value) -> Result<Self, StepError> {
            let n = input
                .get("n")
                .and_then(Value::as_u64)
                .ok_or_else(|| StepError::InvalidInput("n is required".into()))?;
            Ok(Self {
                n: n as u32,
                visited: Vec::new(),
            })
        }

        fn into_output(self) -> Result<WorkflowOutput, StepError> {
            Ok(WorkflowOutput::new(json!({ "n": self.n })))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Loop {
        Again,
        Done,
    }

    impl Route for Loop {
        const ALL: &'static [Self] = &[Loop::Again, Loop::Done];

        fn label(&self) -> &'static str {
            match self {
                Loop::Again => "again",
                Loop::Done => "done",
            }
        }
    }

    fn until_ten(c: &Counter) -> Loop {
        if c.n >= 10 { Loop::Done } else { Loop::Again }
    }

    fn increment(mut c: Counter) -> Result<Counter, StepError> {
        c.n += 1;
        c.visited.push("increment");
        Ok(c)
    }

    fn finish(mut c: Counter) -> Result<Counter, StepError> {
        c.visited.push("finish");
        Ok(c)
    }

    fn counting_graph() -> Graph<Counter> {
        Graph::builder(JobKind::LessonContent)
            .entry("increment")
            .step("increment", step_fn(increment))
            .step("finish", step_fn(finish))
            .route(
                "increment",
                until_ten,
                &[(Loop::Done, "finish"), (Loop::Again, "increment")],
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn walks_loop_until_condition_holds() {
        let run = Engine::default()
            .execute(&counting_graph(), Counter { n: 7, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(run.terminal, "finish");
        assert_eq!(run.state.n, 10);
        assert_eq!(run.path, vec!["increment", "increment", "increment", "finish"]);
    }

    #[tokio::test]
    async fn same_input_reaches_same_terminal() {
        let graph = counting_graph();
        let engine = Engine::default();
        let a = engine.execute(&graph, Counter { n: 3, ..Default::default() }).await.unwrap();
        let b = engine.execute(&graph, Counter { n: 3, ..Default::default() }).await.unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(a.state, b.state);
    }

    #[tokio::test]
    async fn cycle_hits_transition_ceiling() {
        let err = Engine::new(5)
            .execute(&counting_graph(), Counter::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Engine(EngineFault::StepLimitExceeded { limit: 5 })
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn graph_can_lower_the_ceiling() {
        let graph = Graph::builder(JobKind::LessonContent)
            .entry("increment")
            .max_transitions(2)
            .step("increment", step_fn(increment))
            .step("finish", step_fn(finish))
            .route(
                "increment",
                until_ten,
                &[(Loop::Done, "finish"), (Loop::Again, "increment")],
            )
            .build()
            .unwrap();
        assert_eq!(Engine::default().limit_for(&graph), 2);
        assert!(Engine::default().execute(&graph, Counter::default()).await.is_err());
        assert!(
            Engine::default()
                .execute(&graph, Counter { n: 9, ..Default::default() })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn step_error_aborts_with_step_name() {
        let graph = Graph::builder(JobKind::LessonContent)
            .entry("start")
            .step("start", step_fn(increment))
            .step(
                "explode",
                step_fn(|_: Counter| -> Result<Counter, StepError> {
                    Err(StepError::Validation("bad structure".into()))
                }),
            )
            .step("finish", step_fn(finish))
            .edge("start", "explode")
            .edge("explode", "finish")
            .build()
            .unwrap();

        let err = Engine::default()
            .execute(&graph, Counter::default())
            .await
            .unwrap_err();
        match err {
            WorkflowError::Step { step, source } => {
                assert_eq!(step, "explode");
                assert!(matches!(source, StepError::Validation(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn conditional_falls_back_to_default() {
        let graph = Graph::builder(JobKind::LessonContent)
            .entry("start")
            .step("start", step_fn(increment))
            .step("big", step_fn(finish))
            .step("finish", step_fn(finish))
            .conditional(
                "start",
                Conditional::new().when("big", |c: &Counter| c.n > 100, "big").otherwise("finish"),
            )
            .edge("big", "finish")
            .build()
            .unwrap();
        assert_eq!(graph.next("start", &Counter::default()), Ok("finish"));
        assert_eq!(
            graph.next("start", &Counter { n: 101, ..Default::default() }),
            Ok("big")
        );
        assert_eq!(
            graph.next("finish", &Counter::default()),
            Err(EngineFault::NoMatchingEdge { step: "finish".into() })
        );
    }
}
