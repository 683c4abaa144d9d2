//! The four workflows the worker knows how to run.

mod json;
mod lesson_content;
mod lesson_interaction;
mod levels;
mod onboarding;
mod syllabus;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

pub use json::extract_json_object;
pub use levels::Difficulty;

use crate::collaborators::{Collaborators, ModelTier, SearchHit};
use crate::error::StepError;
use crate::workflow::{RegistryError, WorkflowRegistry};

/// Bounds applied inside workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkflowLimits {
    /// Generations allowed per run before validation gives up.
    pub max_generation_attempts: u32,
    /// Conversation turns included in interaction prompts.
    pub history_limit: usize,
    pub max_onboarding_questions: usize,
    pub search_results: usize,
}

impl Default for WorkflowLimits {
    fn default() -> Self {
        Self {
            max_generation_attempts: 3,
            history_limit: 10,
            max_onboarding_questions: 10,
            search_results: 3,
        }
    }
}

impl WorkflowLimits {
    /// Engine transitions needed by the longest run these limits permit.
    /// A lower ceiling turns exhausted regeneration into a fatal engine fault.
    pub fn required_transitions(&self) -> usize {
        let generations = self.max_generation_attempts.max(1) as usize;
        syllabus::longest_run(generations).max(lesson_content::longest_run(generations))
    }
}

/// Shared by every step of every workflow.
pub(crate) struct StepContext {
    pub collaborators: Collaborators,
    pub limits: WorkflowLimits,
}

impl StepContext {
    /// Ask the model for a JSON object. `None` when the reply holds none.
    async fn ask_json(&self, prompt: &str, tier: ModelTier) -> Result<Option<Map<String, Value>>, StepError> {
        let reply = self.collaborators.model.complete(prompt, tier).await?;
        Ok(extract_json_object(&reply))
    }
}

/// Validate and register every workflow.
pub fn default_registry(collaborators: Collaborators, limits: WorkflowLimits) -> Result<WorkflowRegistry, RegistryError> {
    let ctx = Arc::new(StepContext { collaborators, limits });
    Ok(WorkflowRegistry::builder()
        .register_graph(syllabus::graph(&ctx))?
        .register_graph(lesson_content::graph(&ctx))?
        .register_graph(lesson_interaction::graph(&ctx))?
        .register_graph(onboarding::graph(&ctx))?
        .build())
}

fn required_str(input: &Value, key: &str) -> Result<String, StepError> {
    optional_str(input, key).ok_or_else(|| StepError::InvalidInput(format!("`{key}` is required")))
}

/// A non-blank string, or a number rendered as one.
fn optional_str(input: &Value, key: &str) -> Option<String> {
    match input.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn search_context(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No search results available.".to_string();
    }
    hits.iter()
        .map(|hit| format!("Source: {}\nTitle: {}\n{}", hit.url, hit.title, hit.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FnModel, StaticSearch, collaborators};
    use crate::state_machine::JobKind;
    use serde_json::json;

    #[test]
    fn registers_every_kind() {
        let registry = default_registry(
            collaborators(Arc::new(FnModel::constant("{}")), Arc::new(StaticSearch::default())),
            WorkflowLimits::default(),
        )
        .unwrap();
        for kind in JobKind::ALL {
            assert!(registry.contains(kind), "{kind} missing");
        }
    }

    #[test]
    fn syllabus_loop_sets_the_transition_requirement() {
        assert_eq!(WorkflowLimits::default().required_transitions(), 10);
        let limits = WorkflowLimits {
            max_generation_attempts: 12,
            ..WorkflowLimits::default()
        };
        assert_eq!(limits.required_transitions(), 28);
    }

    #[test]
    fn input_strings() {
        let input = json!({"topic": "  Rust ", "blank": "  ", "user_id": 42});
        assert_eq!(required_str(&input, "topic").unwrap(), "Rust");
        assert!(required_str(&input, "blank").is_err());
        assert_eq!(optional_str(&input, "user_id").as_deref(), Some("42"));
        assert_eq!(optional_str(&input, "missing"), None);
    }
}
