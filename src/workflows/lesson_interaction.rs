use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{StepContext, optional_str, required_str};
use crate::collaborators::ModelTier;
use crate::error::StepError;
use crate::state_machine::JobKind;
use crate::workflow::{Graph, GraphBuilder, Route, StepFuture, WorkflowOutput, WorkflowState, step_fn, step_with};

const ACTIVE_EXERCISE: &str = "active_exercise";
const ACTIVE_ASSESSMENT: &str = "active_assessment";
const EXPOSITION_EXCERPT_CHARS: usize = 500;

/// What the learner wants from this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Chatting,
    RequestExercise,
    RequestAssessment,
    SubmitAnswer,
}

impl Route for Intent {
    const ALL: &'static [Self] = &[
        Intent::Chatting,
        Intent::RequestExercise,
        Intent::RequestAssessment,
        Intent::SubmitAnswer,
    ];

    fn label(&self) -> &'static str {
        match self {
            Intent::Chatting => "chatting",
            Intent::RequestExercise => "request_exercise",
            Intent::RequestAssessment => "request_assessment",
            Intent::SubmitAnswer => "submit_answer",
        }
    }
}

impl Intent {
    /// Map a free-form model label to an intent. Answers are only possible
    /// while a task is active, which the caller has already ruled out.
    fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.contains("exercise") {
            Intent::RequestExercise
        } else if label.contains("assessment") || label.contains("quiz") {
            Intent::RequestAssessment
        } else {
            Intent::Chatting
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

#[derive(Debug)]
pub struct InteractionState {
    progress_id: String,
    user_message: String,
    /// The caller flagged this turn as an answer submission.
    answer_submitted: bool,
    lesson: Map<String, Value>,
    history: Vec<Turn>,
    topic: String,
    lesson_title: String,
    exposition: String,
    level: String,
    intent: Option<Intent>,
    assistant_message: Option<String>,
    message_type: &'static str,
    interaction_mode: &'static str,
}

impl InteractionState {
    fn active_task(&self) -> Option<(&'static str, &Value)> {
        [ACTIVE_EXERCISE, ACTIVE_ASSESSMENT]
            .into_iter()
            .find_map(|key| self.lesson.get(key).filter(|v| !v.is_null()).map(|v| (key, v)))
    }

    fn recent_history(&self, limit: usize) -> String {
        let skip = self.history.len().saturating_sub(limit);
        self.history[skip..]
            .iter()
            .map(|turn| format!("{}: {}", capitalize(&turn.role), turn.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn exposition_excerpt(&self) -> String {
        self.exposition.chars().take(EXPOSITION_EXCERPT_CHARS).collect()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl WorkflowState for InteractionState {
    fn from_input(input: &Value) -> Result<Self, StepError> {
        let submission = optional_str(input, "submission_type").map(|s| s.to_lowercase());
        let answer_submitted = matches!(submission.as_deref(), Some("answer" | "assessment"))
            || optional_str(input, "current_interaction_mode").as_deref() == Some("submit_answer");

        let lesson = match input.get("lesson_state") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(obj)) => obj.clone(),
            Some(_) => return Err(StepError::InvalidInput("`lesson_state` must be an object".into())),
        };
        let history = input
            .get("history")
            .and_then(Value::as_array)
            .map(|turns| {
                turns
                    .iter()
                    .filter_map(|t| serde_json::from_value::<Turn>(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let text = |key: &str, fallback: &str| {
            optional_str(input, key)
                .or_else(|| lesson.get(key).and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| fallback.to_string())
        };

        Ok(Self {
            progress_id: required_str(input, "progress_id")?,
            user_message: input
                .get("user_message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
            answer_submitted,
            topic: text("lesson_topic", "Unknown Topic"),
            lesson_title: text("lesson_title", "Unknown Lesson"),
            exposition: text("lesson_exposition", ""),
            level: text("user_knowledge_level", "beginner"),
            history,
            lesson,
            intent: None,
            assistant_message: None,
            message_type: "chat",
            interaction_mode: "chatting",
        })
    }

    fn into_output(self) -> Result<WorkflowOutput, StepError> {
        let message = self
            .assistant_message
            .ok_or_else(|| StepError::Validation("interaction produced no reply".into()))?;
        Ok(WorkflowOutput::new(json!({
            "assistant_message": message,
            "message_type": self.message_type,
            "interaction_mode": self.interaction_mode,
            "updated_state": self.lesson,
        })))
    }
}

fn intent(state: &InteractionState) -> Intent {
    state.intent.unwrap_or(Intent::Chatting)
}

fn classify_intent(ctx: &StepContext, mut state: InteractionState) -> StepFuture<'_, InteractionState> {
    Box::pin(async move {
        if state.answer_submitted || state.active_task().is_some() {
            state.intent = Some(Intent::SubmitAnswer);
            debug!(progress_id = %state.progress_id, "active task or explicit submission, treating as answer");
            return Ok(state);
        }
        if state.user_message.is_empty() {
            state.intent = Some(Intent::Chatting);
            return Ok(state);
        }

        let prompt = format!(
            "Classify the learner's latest message in a lesson on \"{title}\" ({topic}, {level} level).\n\n\
             Lesson summary: {excerpt}\n\n\
             Recent conversation:\n{history}\n\n\
             Latest message: {message}\n\n\
             Choose one intent: \"chatting\" (questions or discussion), \
             \"request_exercise\" (asks for practice) or \"request_assessment\" (asks to be tested).\n\
             Respond ONLY with JSON: {{\"intent\": \"...\", \"reasoning\": \"...\"}}",
            title = state.lesson_title,
            topic = state.topic,
            level = state.level,
            excerpt = state.exposition_excerpt(),
            history = state.recent_history(ctx.limits.history_limit),
            message = state.user_message,
        );
        let classified = ctx
            .ask_json(&prompt, ModelTier::Fast)
            .await?
            .and_then(|obj| obj.get("intent").and_then(Value::as_str).map(Intent::from_label));
        if classified.is_none() {
            warn!(progress_id = %state.progress_id, "intent reply unparseable, defaulting to chat");
        }
        state.intent = Some(classified.unwrap_or(Intent::Chatting));
        Ok(state)
    })
}

fn generate_chat_response(ctx: &StepContext, mut state: InteractionState) -> StepFuture<'_, InteractionState> {
    Box::pin(async move {
        let prompt = format!(
            "You are a helpful and encouraging tutor explaining \"{title}\" ({topic}) \
             to a learner at the {level} level.\n\n\
             Lesson summary: {excerpt}\n\n\
             Conversation so far:\n{history}\n\n\
             Learner: {message}\n\n\
             Reply conversationally and concisely. Write mathematics as LaTeX.",
            title = state.lesson_title,
            topic = state.topic,
            level = state.level,
            excerpt = state.exposition_excerpt(),
            history = state.recent_history(ctx.limits.history_limit),
            message = state.user_message,
        );
        let reply = ctx.collaborators.model.complete(&prompt, ModelTier::Large).await?;
        state.assistant_message = Some(reply.trim().to_string());
        state.message_type = "chat";
        state.interaction_mode = "chatting";
        Ok(state)
    })
}

/// Ask the model for a new task and make it the active one.
async fn generate_task(
    ctx: &StepContext,
    state: &mut InteractionState,
    key: &'static str,
    what: &str,
    shape: &str,
) -> Result<Value, StepError> {
    let prompt = format!(
        "You are an expert tutor creating one {what} for the lesson \"{title}\" ({topic}, {level} level).\n\n\
         Lesson summary: {excerpt}\n\n\
         Respond ONLY with a JSON object shaped like:\n{shape}",
        title = state.lesson_title,
        topic = state.topic,
        level = state.level,
        excerpt = state.exposition_excerpt(),
    );
    let task = ctx
        .ask_json(&prompt, ModelTier::Large)
        .await?
        .ok_or_else(|| StepError::Validation(format!("{what} reply held no JSON object")))?;
    let prompt_text = ["question_text", "question", "instructions"]
        .iter()
        .any(|k| task.get(*k).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty()));
    if !prompt_text {
        return Err(StepError::Validation(format!("{what} has no question or instructions")));
    }

    let task = Value::Object(task);
    state.lesson.insert(ACTIVE_EXERCISE.into(), Value::Null);
    state.lesson.insert(ACTIVE_ASSESSMENT.into(), Value::Null);
    state.lesson.insert(key.into(), task.clone());
    Ok(task)
}

fn present_task(task: &Value) -> String {
    let mut text = ["question_text", "question", "instructions"]
        .iter()
        .filter_map(|k| task.get(*k).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n\n");
    if let Some(options) = task.get("options").and_then(Value::as_array) {
        for option in options {
            let id = option.get("id").and_then(Value::as_str).unwrap_or("-");
            let body = option.get("text").and_then(Value::as_str).unwrap_or_default();
            text.push_str(&format!("\n{id}) {body}"));
        }
    }
    text
}

fn generate_exercise(ctx: &StepContext, mut state: InteractionState) -> StepFuture<'_, InteractionState> {
    Box::pin(async move {
        let task = generate_task(
            ctx,
            &mut state,
            ACTIVE_EXERCISE,
            "practice exercise",
            r#"{"id": "ex_01", "type": "multiple_choice|short_answer|ordering", "instructions": "...", "options": [{"id": "A", "text": "..."}], "correct_answer_id": "A", "correct_answer": "...", "explanation": "..."}"#,
        )
        .await?;
        info!(progress_id = %state.progress_id, "exercise generated");
        state.assistant_message = Some(present_task(&task));
        state.message_type = "exercise";
        state.interaction_mode = "awaiting_answer";
        Ok(state)
    })
}

fn generate_assessment(ctx: &StepContext, mut state: InteractionState) -> StepFuture<'_, InteractionState> {
    Box::pin(async move {
        let task = generate_task(
            ctx,
            &mut state,
            ACTIVE_ASSESSMENT,
            "assessment question",
            r#"{"id": "quiz_01", "type": "multiple_choice|true_false|short_answer", "question_text": "...", "options": [{"id": "A", "text": "..."}], "correct_answer_id": "A", "correct_answer": "...", "explanation": "..."}"#,
        )
        .await?;
        info!(progress_id = %state.progress_id, "assessment question generated");
        state.assistant_message = Some(present_task(&task));
        state.message_type = "assessment";
        state.interaction_mode = "awaiting_answer";
        Ok(state)
    })
}

/// Parsed evaluation of a submitted answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub is_correct: bool,
    pub feedback: String,
    pub explanation: Option<String>,
}

fn parse_evaluation(obj: &Map<String, Value>) -> Result<Evaluation, Vec<String>> {
    let mut problems = Vec::new();
    let score = obj.get("score").and_then(Value::as_f64);
    match score {
        None => problems.push("missing numeric `score`".to_string()),
        Some(s) if !(0.0..=1.0).contains(&s) => problems.push(format!("score {s} outside 0..1")),
        Some(_) => {}
    }
    let feedback = obj.get("feedback").and_then(Value::as_str).map(str::to_string);
    if feedback.is_none() {
        problems.push("missing `feedback`".to_string());
    }
    match (score, feedback) {
        (Some(score), Some(feedback)) if problems.is_empty() => Ok(Evaluation {
            score,
            is_correct: obj
                .get("is_correct")
                .and_then(Value::as_bool)
                .unwrap_or(score >= 0.8),
            feedback,
            explanation: obj.get("explanation").and_then(Value::as_str).map(str::to_string),
        }),
        _ => Err(problems),
    }
}

fn evaluate_answer(ctx: &StepContext, mut state: InteractionState) -> StepFuture<'_, InteractionState> {
    Box::pin(async move {
        let Some((key, task)) = state.active_task().map(|(k, t)| (k, t.clone())) else {
            state.assistant_message = Some("Sorry, there wasn't an active question for me to evaluate.".into());
            state.message_type = "error";
            state.interaction_mode = "chatting";
            return Ok(state);
        };
        if state.user_message.is_empty() {
            state.assistant_message = Some("Sorry, I couldn't find your answer to evaluate.".into());
            state.message_type = "error";
            state.interaction_mode = "awaiting_answer";
            return Ok(state);
        }

        let prompt = format!(
            "You are evaluating a learner's answer in a lesson on \"{title}\" ({topic}, {level} level).\n\n\
             Task:\n{task}\n\n\
             Learner's answer: {answer}\n\n\
             Grade strictly. Respond ONLY with JSON: \
             {{\"score\": 0.0-1.0, \"is_correct\": true|false, \"feedback\": \"...\", \"explanation\": \"...\"}}",
            title = state.lesson_title,
            topic = state.topic,
            level = state.level,
            task = serde_json::to_string_pretty(&task).unwrap_or_default(),
            answer = state.user_message,
        );
        let obj = ctx
            .ask_json(&prompt, ModelTier::Large)
            .await?
            .ok_or_else(|| StepError::Validation("evaluation reply held no JSON object".into()))?;
        let evaluation = parse_evaluation(&obj).map_err(|problems| StepError::Validation(problems.join("; ")))?;
        info!(progress_id = %state.progress_id, score = evaluation.score, correct = evaluation.is_correct, "answer evaluated");

        let mut message = evaluation.feedback.clone();
        if let (false, Some(explanation)) = (evaluation.is_correct, &evaluation.explanation) {
            message.push_str("\n\n");
            message.push_str(explanation);
        }
        state.lesson.insert(key.into(), Value::Null);
        state.lesson.insert(
            "last_evaluation".into(),
            json!({ "score": evaluation.score, "is_correct": evaluation.is_correct }),
        );
        state.assistant_message = Some(message);
        state.message_type = if key == ACTIVE_EXERCISE { "exercise_feedback" } else { "assessment_feedback" };
        state.interaction_mode = "chatting";
        Ok(state)
    })
}

fn respond(mut state: InteractionState) -> Result<InteractionState, StepError> {
    state
        .lesson
        .insert("current_interaction_mode".into(), json!(state.interaction_mode));
    if let Some(intent) = state.intent {
        state.lesson.insert("last_intent".into(), json!(intent));
    }
    Ok(state)
}

pub(crate) fn graph(ctx: &Arc<StepContext>) -> GraphBuilder<InteractionState> {
    Graph::builder(JobKind::LessonInteraction)
        .entry("classify_intent")
        .step("classify_intent", step_with(ctx, classify_intent))
        .step("generate_chat_response", step_with(ctx, generate_chat_response))
        .step("generate_exercise", step_with(ctx, generate_exercise))
        .step("generate_assessment", step_with(ctx, generate_assessment))
        .step("evaluate_answer", step_with(ctx, evaluate_answer))
        .step("respond", step_fn(respond))
        .route(
            "classify_intent",
            intent,
            &[
                (Intent::SubmitAnswer, "evaluate_answer"),
                (Intent::RequestExercise, "generate_exercise"),
                (Intent::RequestAssessment, "generate_assessment"),
                (Intent::Chatting, "generate_chat_response"),
            ],
        )
        .edge("generate_chat_response", "respond")
        .edge("generate_exercise", "respond")
        .edge("generate_assessment", "respond")
        .edge("evaluate_answer", "respond")
}
