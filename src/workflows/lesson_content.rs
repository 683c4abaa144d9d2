use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::levels::Difficulty;
use super::{StepContext, optional_str, required_str};
use crate::collaborators::ModelTier;
use crate::error::StepError;
use crate::state_machine::JobKind;
use crate::workflow::{Graph, GraphBuilder, Route, StepFuture, WorkflowOutput, WorkflowState, step_with};

#[derive(Debug)]
pub struct LessonContentState {
    lesson_id: String,
    topic: String,
    /// `None` for a level name outside the known scale.
    level: Option<Difficulty>,
    level_label: String,
    lesson_title: String,
    syllabus_id: Option<String>,
    syllabus: Option<Value>,
    exposition: Option<String>,
    attempts: u32,
    problems: Vec<String>,
    valid: bool,
}

impl LessonContentState {
    fn target_words(&self) -> usize {
        Difficulty::target_words(self.level)
    }
}

impl WorkflowState for LessonContentState {
    fn from_input(input: &Value) -> Result<Self, StepError> {
        let level_label = optional_str(input, "level").unwrap_or_else(|| Difficulty::Beginner.name().to_string());
        Ok(Self {
            lesson_id: required_str(input, "lesson_id")?,
            topic: required_str(input, "topic")?,
            level: Difficulty::from_key(&level_label),
            level_label,
            lesson_title: required_str(input, "lesson_title")?,
            syllabus_id: optional_str(input, "syllabus_id"),
            syllabus: None,
            exposition: None,
            attempts: 0,
            problems: Vec::new(),
            valid: false,
        })
    }

    fn into_output(self) -> Result<WorkflowOutput, StepError> {
        let exposition = self
            .exposition
            .ok_or_else(|| StepError::Validation("lesson finished without exposition".into()))?;
        Ok(WorkflowOutput::new(json!({ "exposition": exposition })))
    }
}

/// Structural check of a generated exposition. Returns its word count.
pub fn validate_exposition(text: Option<&str>, target_words: usize) -> Result<usize, Vec<String>> {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Err(vec!["exposition is empty".into()]);
    };
    let words = text.split_whitespace().count();
    let minimum = target_words / 4;
    if words < minimum {
        return Err(vec![format!(
            "exposition has {words} words, expected about {target_words}"
        )]);
    }
    Ok(words)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Validity {
    Valid,
    Invalid,
}

impl Route for Validity {
    const ALL: &'static [Self] = &[Validity::Valid, Validity::Invalid];

    fn label(&self) -> &'static str {
        match self {
            Validity::Valid => "valid",
            Validity::Invalid => "invalid",
        }
    }
}

fn validity(state: &LessonContentState) -> Validity {
    if state.valid { Validity::Valid } else { Validity::Invalid }
}

fn load_context(ctx: &StepContext, mut state: LessonContentState) -> StepFuture<'_, LessonContentState> {
    Box::pin(async move {
        if let Some(id) = &state.syllabus_id {
            state.syllabus = ctx.collaborators.content.load_syllabus(id).await?;
            if state.syllabus.is_none() {
                warn!(syllabus_id = %id, "syllabus not found, generating without outline");
            }
        }
        Ok(state)
    })
}

fn exposition_prompt(state: &LessonContentState) -> String {
    let outline = state
        .syllabus
        .as_ref()
        .and_then(|s| serde_json::to_string_pretty(s).ok())
        .unwrap_or_else(|| "(syllabus unavailable)".to_string());
    let mut prompt = format!(
        "You are an expert educator writing lesson content.\n\
         Topic: {topic}\nAudience level: {level}\n\
         Lesson: \"{title}\"\n\n\
         The lesson belongs to this syllabus:\n```json\n{outline}\n```\n\n\
         Write the main exposition for this lesson in about {words} words. \
         Explain the core concepts clearly for the audience level and assume \
         knowledge of earlier lessons. Use headings where they help. \
         Write mathematics as LaTeX.\n\n\
         Respond ONLY with a JSON object of the form {{\"exposition\": \"...\"}}.",
        topic = state.topic,
        level = state.level_label,
        title = state.lesson_title,
        words = state.target_words(),
    );
    if !state.problems.is_empty() {
        prompt.push_str("\n\nThe previous attempt was rejected: ");
        prompt.push_str(&state.problems.join("; "));
    }
    prompt
}

fn generate_exposition(ctx: &StepContext, mut state: LessonContentState) -> StepFuture<'_, LessonContentState> {
    Box::pin(async move {
        state.attempts += 1;
        let prompt = exposition_prompt(&state);
        let reply = ctx.ask_json(&prompt, ModelTier::Large).await?;
        state.exposition = reply
            .and_then(|mut obj| obj.remove("exposition"))
            .and_then(|v| v.as_str().map(str::to_string));
        debug!(lesson_id = %state.lesson_id, attempt = state.attempts, "exposition generated");
        Ok(state)
    })
}

fn validate(ctx: &StepContext, mut state: LessonContentState) -> StepFuture<'_, LessonContentState> {
    Box::pin(async move {
        match validate_exposition(state.exposition.as_deref(), state.target_words()) {
            Ok(words) => {
                debug!(lesson_id = %state.lesson_id, words, "exposition accepted");
                state.valid = true;
                state.problems.clear();
            }
            Err(problems) => {
                warn!(lesson_id = %state.lesson_id, attempt = state.attempts, ?problems, "exposition rejected");
                if state.attempts >= ctx.limits.max_generation_attempts {
                    return Err(StepError::Validation(format!(
                        "exposition still invalid after {} generations: {}",
                        state.attempts,
                        problems.join("; ")
                    )));
                }
                state.valid = false;
                state.problems = problems;
            }
        }
        Ok(state)
    })
}

fn persist(ctx: &StepContext, state: LessonContentState) -> StepFuture<'_, LessonContentState> {
    Box::pin(async move {
        let exposition = state.exposition.as_deref().unwrap_or_default();
        ctx.collaborators
            .content
            .save_lesson_content(&state.lesson_id, exposition)
            .await?;
        info!(lesson_id = %state.lesson_id, "lesson content saved");
        Ok(state)
    })
}

/// Transitions taken when the last of `generations` passes validation.
pub(super) fn longest_run(generations: usize) -> usize {
    2 * generations + 1
}

pub(crate) fn graph(ctx: &Arc<StepContext>) -> GraphBuilder<LessonContentState> {
    Graph::builder(JobKind::LessonContent)
        .entry("load_context")
        .step("load_context", step_with(ctx, load_context))
        .step("generate_exposition", step_with(ctx, generate_exposition))
        .step("validate_exposition", step_with(ctx, validate))
        .step("persist", step_with(ctx, persist))
        .edge("load_context", "generate_exposition")
        .edge("generate_exposition", "validate_exposition")
        .route(
            "validate_exposition",
            validity,
            &[(Validity::Valid, "persist"), (Validity::Invalid, "generate_exposition")],
        )
}
