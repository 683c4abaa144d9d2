use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::levels::Difficulty;
use super::{StepContext, optional_str, required_str, search_context};
use crate::collaborators::{ModelTier, SearchHit, StoredSyllabus, SyllabusKey};
use crate::error::StepError;
use crate::state_machine::{JobKind, JobOwner, NewJob};
use crate::workflow::{Graph, GraphBuilder, Route, StepFuture, WorkflowOutput, WorkflowState, step_fn, step_with};

const REQUIRED_KEYS: [&str; 5] = ["topic", "level", "duration", "learning_objectives", "modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyllabusSource {
    Existing,
    Generated,
}

#[derive(Debug)]
pub struct SyllabusState {
    topic: String,
    level: Difficulty,
    user_id: Option<String>,
    existing: Option<StoredSyllabus>,
    search_hits: Vec<SearchHit>,
    candidate: Option<Value>,
    outline: Option<Outline>,
    generation_attempts: u32,
    problems: Vec<String>,
    syllabus_id: Option<String>,
    source: Option<SyllabusSource>,
}

impl SyllabusState {
    fn key(&self) -> SyllabusKey {
        SyllabusKey::new(&self.topic, self.level.name(), self.user_id.as_deref())
    }
}

impl WorkflowState for SyllabusState {
    fn from_input(input: &Value) -> Result<Self, StepError> {
        let level = optional_str(input, "knowledge_level")
            .or_else(|| optional_str(input, "level"))
            .map(|key| Difficulty::normalize(&key))
            .unwrap_or_default();
        Ok(Self {
            topic: required_str(input, "topic")?,
            level,
            user_id: optional_str(input, "user_id"),
            existing: None,
            search_hits: Vec::new(),
            candidate: None,
            outline: None,
            generation_attempts: 0,
            problems: Vec::new(),
            syllabus_id: None,
            source: None,
        })
    }

    fn into_output(self) -> Result<WorkflowOutput, StepError> {
        let (Some(syllabus_id), Some(source)) = (self.syllabus_id, self.source) else {
            return Err(StepError::Validation("syllabus finished without an id".into()));
        };
        let syllabus = match (source, self.existing, self.candidate) {
            (SyllabusSource::Existing, Some(existing), _) => existing.syllabus,
            (SyllabusSource::Generated, _, Some(candidate)) => candidate,
            _ => return Err(StepError::Validation("syllabus finished without content".into())),
        };

        let mut output = WorkflowOutput::new(json!({
            "syllabus": syllabus,
            "syllabus_id": syllabus_id,
            "topic": self.topic,
            "knowledge_level": self.level,
            "source": source,
        }));

        // Fresh syllabi get their opening lesson written right away.
        if let (SyllabusSource::Generated, Some(outline)) = (source, self.outline) {
            let lesson_id = format!("{syllabus_id}:0:0");
            let owner = JobOwner {
                user_id: self.user_id,
                syllabus_id: Some(syllabus_id.clone()),
                lesson_id: Some(lesson_id.clone()),
            };
            output.follow_ups.push(
                NewJob::new(
                    JobKind::LessonContent,
                    json!({
                        "lesson_id": lesson_id,
                        "topic": self.topic,
                        "level": self.level,
                        "lesson_title": outline.first_lesson,
                        "syllabus_id": syllabus_id,
                    }),
                )
                .with_owner(owner),
            );
        }
        Ok(output)
    }
}

/// The parts of a validated syllabus later steps rely on.
#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    pub modules: usize,
    pub lessons: usize,
    pub first_lesson: String,
}

/// Structural check of a generated syllabus. Collects every problem rather
/// than stopping at the first one, so a regeneration prompt can cite them all.
pub fn validate_syllabus(value: &Value) -> Result<Outline, Vec<String>> {
    let Some(obj) = value.as_object() else {
        return Err(vec!["syllabus is not a JSON object".into()]);
    };

    let mut problems: Vec<String> = REQUIRED_KEYS
        .iter()
        .filter(|key| obj.get(**key).is_none_or(Value::is_null))
        .map(|key| format!("missing key `{key}`"))
        .collect();

    let modules = obj.get("modules").and_then(Value::as_array);
    let mut lessons = 0;
    let mut first_lesson = None;
    match modules {
        Some(modules) if !modules.is_empty() => {
            for (m, module) in modules.iter().enumerate() {
                if !has_title(module) {
                    problems.push(format!("module {m} has no title"));
                }
                match module.get("lessons").and_then(Value::as_array) {
                    Some(list) if !list.is_empty() => {
                        for (l, lesson) in list.iter().enumerate() {
                            if has_title(lesson) {
                                lessons += 1;
                                if first_lesson.is_none() {
                                    first_lesson = lesson["title"].as_str().map(str::to_string);
                                }
                            } else {
                                problems.push(format!("lesson {l} of module {m} has no title"));
                            }
                        }
                    }
                    _ => problems.push(format!("module {m} has no lessons")),
                }
            }
        }
        Some(_) => problems.push("`modules` is empty".into()),
        None if obj.contains_key("modules") => problems.push("`modules` is not a list".into()),
        None => {}
    }

    match first_lesson {
        Some(first_lesson) if problems.is_empty() => Ok(Outline {
            modules: modules.map_or(0, Vec::len),
            lessons,
            first_lesson,
        }),
        _ => Err(problems),
    }
}

fn has_title(value: &Value) -> bool {
    value
        .get("title")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lookup {
    Found,
    Missing,
}

impl Route for Lookup {
    const ALL: &'static [Self] = &[Lookup::Found, Lookup::Missing];

    fn label(&self) -> &'static str {
        match self {
            Lookup::Found => "found",
            Lookup::Missing => "missing",
        }
    }
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

fn lookup(state: &SyllabusState) -> Lookup {
    if state.existing.is_some() { Lookup::Found } else { Lookup::Missing }
}

fn validity(state: &SyllabusState) -> Validity {
    if state.outline.is_some() { Validity::Valid } else { Validity::Invalid }
}

fn initialize(mut state: SyllabusState) -> Result<SyllabusState, StepError> {
    state.topic = state.topic.split_whitespace().collect::<Vec<_>>().join(" ");
    info!(topic = %state.topic, level = %state.level, user = ?state.user_id, "syllabus requested");
    Ok(state)
}

fn search_existing(ctx: &StepContext, mut state: SyllabusState) -> StepFuture<'_, SyllabusState> {
    Box::pin(async move {
        state.existing = ctx.collaborators.content.find_syllabus(&state.key()).await?;
        debug!(found = state.existing.is_some(), "existing syllabus lookup");
        Ok(state)
    })
}

fn search_web(ctx: &StepContext, mut state: SyllabusState) -> StepFuture<'_, SyllabusState> {
    Box::pin(async move {
        let query = format!(
            "{} course syllabus curriculum for {} students",
            state.topic, state.level
        );
        state.search_hits = ctx
            .collaborators
            .search
            .search(&query, ctx.limits.search_results)
            .await?;
        debug!(hits = state.search_hits.len(), "web search finished");
        Ok(state)
    })
}

fn generation_prompt(state: &SyllabusState) -> String {
    let mut prompt = format!(
        "You are an expert curriculum designer creating a comprehensive syllabus for the topic: {topic}.\n\
         The learner's knowledge level is: {level}.\n\n\
         Use the following search results to keep the syllabus accurate and current:\n\n{context}\n\n\
         Include the topic, the level, a duration, 3-5 measurable learning objectives, \
         at least 2 modules and at least 3 lessons per module.\n\
         Respond ONLY with a JSON object shaped like:\n\
         {{\"topic\": \"...\", \"level\": \"{level}\", \"duration\": \"4 weeks\", \
         \"learning_objectives\": [\"...\"], \
         \"modules\": [{{\"week\": 1, \"title\": \"...\", \"lessons\": [{{\"title\": \"...\"}}]}}]}}",
        topic = state.topic,
        level = state.level,
        context = search_context(&state.search_hits),
    );
    if !state.problems.is_empty() {
        prompt.push_str("\n\nThe previous attempt was rejected: ");
        prompt.push_str(&state.problems.join("; "));
    }
    prompt
}

fn generate(ctx: &StepContext, mut state: SyllabusState) -> StepFuture<'_, SyllabusState> {
    Box::pin(async move {
        state.generation_attempts += 1;
        let prompt = generation_prompt(&state);
        state.candidate = ctx
            .ask_json(&prompt, ModelTier::Large)
            .await?
            .map(Value::Object);
        debug!(attempt = state.generation_attempts, parsed = state.candidate.is_some(), "syllabus generated");
        Ok(state)
    })
}

fn validate_structure(ctx: &StepContext, mut state: SyllabusState) -> StepFuture<'_, SyllabusState> {
    Box::pin(async move {
        let checked = match &state.candidate {
            Some(candidate) => validate_syllabus(candidate),
            None => Err(vec!["response held no JSON object".to_string()]),
        };
        match checked {
            Ok(outline) => {
                state.problems.clear();
                state.outline = Some(outline);
            }
            Err(problems) => {
                warn!(attempt = state.generation_attempts, ?problems, "generated syllabus rejected");
                if state.generation_attempts >= ctx.limits.max_generation_attempts {
                    return Err(StepError::Validation(format!(
                        "syllabus still invalid after {} generations: {}",
                        state.generation_attempts,
                        problems.join("; ")
                    )));
                }
                state.problems = problems;
                state.outline = None;
            }
        }
        Ok(state)
    })
}

fn persist(ctx: &StepContext, mut state: SyllabusState) -> StepFuture<'_, SyllabusState> {
    Box::pin(async move {
        let Some(candidate) = &state.candidate else {
            return Err(StepError::Validation("nothing to persist".into()));
        };
        let id = ctx
            .collaborators
            .content
            .save_syllabus(&state.key(), candidate)
            .await?;
        info!(syllabus_id = %id, "syllabus saved");
        state.syllabus_id = Some(id);
        state.source = Some(SyllabusSource::Generated);
        Ok(state)
    })
}

fn finalize(mut state: SyllabusState) -> Result<SyllabusState, StepError> {
    if let Some(existing) = &state.existing {
        state.syllabus_id = Some(existing.id.clone());
        state.source = Some(SyllabusSource::Existing);
    }
    Ok(state)
}

/// Transitions taken when the last of `generations` passes validation.
pub(super) fn longest_run(generations: usize) -> usize {
    2 * generations + 4
}

pub(crate) fn graph(ctx: &Arc<StepContext>) -> GraphBuilder<SyllabusState> {
    Graph::builder(JobKind::SyllabusGeneration)
        .entry("initialize")
        .step("initialize", step_fn(initialize))
        .step("search_existing", step_with(ctx, search_existing))
        .step("search_web", step_with(ctx, search_web))
        .step("generate", step_with(ctx, generate))
        .step("validate_structure", step_with(ctx, validate_structure))
        .step("persist", step_with(ctx, persist))
        .step("finalize", step_fn(finalize))
        .edge("initialize", "search_existing")
        .route(
            "search_existing",
            lookup,
            &[(Lookup::Found, "finalize"), (Lookup::Missing, "search_web")],
        )
        .edge("search_web", "generate")
        .edge("generate", "validate_structure")
        .route(
            "validate_structure",
            validity,
            &[(Validity::Valid, "persist"), (Validity::Invalid, "generate")],
        )
        .edge("persist", "finalize")
}
