use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::levels::Difficulty;
use super::{StepContext, required_str, search_context};
use crate::collaborators::ModelTier;
use crate::error::StepError;
use crate::state_machine::JobKind;
use crate::workflow::{Graph, GraphBuilder, Route, StepFuture, WorkflowOutput, WorkflowState, step_fn, step_with};

const SKIPPED: &str = "[SKIPPED]";
const DEFAULT_DIFFICULTY: u8 = 2;
/// Consecutive results at one difficulty that move it up or down.
const STREAK: u32 = 2;

/// Assessment progress, carried between jobs by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Assessment {
    pub topic: String,
    pub questions: Vec<String>,
    pub question_difficulties: Vec<u8>,
    pub answers: Vec<String>,
    pub scores: Vec<f64>,
    pub current_question: Option<String>,
    pub target_difficulty: u8,
    pub consecutive_correct: u32,
    pub consecutive_wrong: u32,
    pub is_complete: bool,
    pub ended_early: bool,
    pub feedback: Option<String>,
    pub final_assessment: Option<FinalAssessment>,
}

impl Default for Assessment {
    fn default() -> Self {
        Self {
            topic: String::new(),
            questions: Vec::new(),
            question_difficulties: Vec::new(),
            answers: Vec::new(),
            scores: Vec::new(),
            current_question: None,
            target_difficulty: DEFAULT_DIFFICULTY,
            consecutive_correct: 0,
            consecutive_wrong: 0,
            is_complete: false,
            ended_early: false,
            feedback: None,
            final_assessment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAssessment {
    pub knowledge_level: Difficulty,
    pub score: f64,
    pub topic: String,
    pub questions: Vec<String>,
    pub responses: Vec<String>,
}

impl Assessment {
    /// Record a zero-scored result and demote after a losing streak.
    fn record_miss(&mut self, answer: String) {
        self.answers.push(answer);
        self.scores.push(0.0);
        self.consecutive_correct = 0;
        self.consecutive_wrong += 1;
        if self.consecutive_wrong >= STREAK && self.target_difficulty > Difficulty::MIN_VALUE {
            self.target_difficulty -= 1;
            self.consecutive_wrong = 0;
            self.append_feedback("Difficulty decreased.");
        }
    }

    /// Record a graded answer, promoting after a winning streak.
    fn record_score(&mut self, answer: String, score: f64) {
        if score <= 0.0 {
            self.record_miss(answer);
            return;
        }
        self.answers.push(answer);
        self.scores.push(score);
        self.consecutive_wrong = 0;
        if score >= 1.0 {
            self.consecutive_correct += 1;
            if self.consecutive_correct >= STREAK && self.target_difficulty < Difficulty::MAX_VALUE {
                self.target_difficulty += 1;
                self.consecutive_correct = 0;
                self.append_feedback("Difficulty increased due to consecutive correct answers.");
            }
        } else {
            self.consecutive_correct = 0;
        }
    }

    fn append_feedback(&mut self, note: &str) {
        self.feedback = Some(match self.feedback.take() {
            Some(existing) if !existing.is_empty() => format!("{existing} {note}"),
            _ => note.to_string(),
        });
    }

    /// The last two answers scored zero on questions at the lowest difficulty.
    fn stalled_at_minimum(&self) -> bool {
        let n = self.scores.len();
        n >= 2
            && self.scores[n - 2..].iter().all(|s| *s == 0.0)
            && self
                .question_difficulties
                .get(n - 2..n)
                .is_some_and(|d| d.iter().all(|d| *d == Difficulty::MIN_VALUE))
    }

    fn score_percentage(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f64>() / self.scores.len() as f64 * 100.0
    }
}

/// Final level from the share of points scored.
pub fn level_for_score(percentage: f64) -> Difficulty {
    if percentage >= 75.0 {
        Difficulty::Advanced
    } else if percentage >= 40.0 {
        Difficulty::GoodKnowledge
    } else {
        Difficulty::Beginner
    }
}

/// Parse a grader reply of the form `score:feedback`, e.g. `0.5:Nearly`.
pub fn parse_grade(reply: &str) -> Option<(f64, String)> {
    let (score, feedback) = reply.trim().split_once(':')?;
    let score: f64 = score.trim().parse().ok()?;
    (0.0..=1.0)
        .contains(&score)
        .then(|| (score, feedback.trim().to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Skip,
    Answer,
    FirstQuestion,
}

impl Route for Action {
    const ALL: &'static [Self] = &[Action::Skip, Action::Answer, Action::FirstQuestion];

    fn label(&self) -> &'static str {
        match self {
            Action::Skip => "skip",
            Action::Answer => "answer",
            Action::FirstQuestion => "first_question",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Progress {
    Complete,
    Continue,
}

impl Route for Progress {
    const ALL: &'static [Self] = &[Progress::Complete, Progress::Continue];

    fn label(&self) -> &'static str {
        match self {
            Progress::Complete => "complete",
            Progress::Continue => "continue",
        }
    }
}

#[derive(Debug)]
pub struct OnboardingState {
    assessment: Assessment,
    answer: Option<String>,
    skip: bool,
    action: Action,
}

impl WorkflowState for OnboardingState {
    fn from_input(input: &Value) -> Result<Self, StepError> {
        let topic = required_str(input, "topic")?;
        let mut assessment = match input.get("assessment_state") {
            None | Some(Value::Null) => Assessment::default(),
            Some(state) => serde_json::from_value(state.clone())
                .map_err(|e| StepError::InvalidInput(format!("`assessment_state`: {e}")))?,
        };
        assessment.topic = topic;
        Ok(Self {
            assessment,
            answer: input
                .get("answer")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            skip: input.get("skip").and_then(Value::as_bool).unwrap_or(false),
            action: Action::FirstQuestion,
        })
    }

    fn into_output(self) -> Result<WorkflowOutput, StepError> {
        let a = self.assessment;
        let question = if a.is_complete { None } else { a.current_question.clone() };
        Ok(WorkflowOutput::new(json!({
            "question": question,
            "difficulty": a.target_difficulty,
            "is_complete": a.is_complete,
            "feedback": a.feedback,
            "final_assessment": a.final_assessment,
            "assessment_state": a,
        })))
    }
}

fn action(state: &OnboardingState) -> Action {
    state.action
}

fn progress(state: &OnboardingState) -> Progress {
    if state.assessment.is_complete { Progress::Complete } else { Progress::Continue }
}

fn apply_answer(mut state: OnboardingState) -> Result<OnboardingState, StepError> {
    let awaiting = !state.assessment.is_complete && state.assessment.current_question.is_some();
    state.assessment.feedback = None;
    state.action = match (awaiting, state.skip, &state.answer) {
        (true, true, _) => Action::Skip,
        (true, false, Some(_)) => Action::Answer,
        _ => Action::FirstQuestion,
    };
    debug!(topic = %state.assessment.topic, action = state.action.label(), "onboarding turn");
    Ok(state)
}

fn record_skip(mut state: OnboardingState) -> Result<OnboardingState, StepError> {
    state.assessment.record_miss(SKIPPED.to_string());
    state.assessment.append_feedback("Question skipped.");
    Ok(state)
}

fn evaluate_answer(ctx: &StepContext, mut state: OnboardingState) -> StepFuture<'_, OnboardingState> {
    Box::pin(async move {
        let a = &state.assessment;
        let question = a.current_question.clone().unwrap_or_default();
        let answer = state.answer.clone().unwrap_or_default();
        let hits = ctx
            .collaborators
            .search
            .search(&format!("{} {}", a.topic, question), ctx.limits.search_results)
            .await?;
        let prompt = format!(
            "You are an expert tutor in {topic}.\n\
             Question: {question}\n\
             Answer: {answer}\n\n\
             Reference material:\n{context}\n\n\
             Evaluate the answer for correctness, allowing that only a short answer was requested. \
             \"I don't know\" is incorrect. Never mention the reference material.\n\
             Classify the answer as correct=1, partially correct=0.5 or incorrect=0 and reply as \
             `score:feedback`, for example `0:Swans cannot live in space`.",
            topic = a.topic,
            context = search_context(&hits),
        );
        let reply = ctx.collaborators.model.complete(&prompt, ModelTier::Large).await?;
        let (score, feedback) = parse_grade(&reply)
            .ok_or_else(|| StepError::Validation(format!("ungradable evaluation reply: {}", reply.trim())))?;

        state.assessment.feedback = Some(feedback);
        state.assessment.record_score(answer, score);
        debug!(score, difficulty = state.assessment.target_difficulty, "onboarding answer graded");
        Ok(state)
    })
}

fn check_progress(ctx: &StepContext, mut state: OnboardingState) -> StepFuture<'_, OnboardingState> {
    Box::pin(async move {
        let a = &mut state.assessment;
        if !a.is_complete && a.stalled_at_minimum() {
            a.is_complete = true;
            a.ended_early = true;
            a.append_feedback("Assessment ended early due to repeated incorrect answers at the lowest level.");
        }
        if !a.is_complete && a.questions.len() >= ctx.limits.max_onboarding_questions {
            a.is_complete = true;
        }
        Ok(state)
    })
}

fn generate_question(ctx: &StepContext, mut state: OnboardingState) -> StepFuture<'_, OnboardingState> {
    Box::pin(async move {
        let a = &state.assessment;
        let difficulty = Difficulty::from_value(a.target_difficulty).unwrap_or_default();
        let hits = ctx
            .collaborators
            .search
            .search(&format!("{} {} concepts", a.topic, difficulty), ctx.limits.search_results)
            .await?;
        let prompt = format!(
            "You are an expert tutor assessing a learner's understanding of {topic}.\n\
             Ask one question at {difficulty} difficulty ({value}) that needs only a short answer. \
             Do not repeat an earlier question and do not ask for the name of the topic. \
             Never mention the reference material.\n\n\
             Reference material:\n{context}\n\n\
             Questions already asked: {asked}\n\n\
             Reply as:\nDifficulty: {value}\nQuestion: <your question>",
            topic = a.topic,
            value = difficulty.value(),
            context = search_context(&hits),
            asked = if a.questions.is_empty() { "none".to_string() } else { a.questions.join(" | ") },
        );
        let reply = ctx.collaborators.model.complete(&prompt, ModelTier::Large).await?;
        let question = reply
            .lines()
            .find_map(|line| line.trim().strip_prefix("Question:"))
            .unwrap_or(reply.as_str())
            .trim()
            .to_string();
        if question.is_empty() {
            return Err(StepError::Validation("model returned an empty question".into()));
        }

        let a = &mut state.assessment;
        a.questions.push(question.clone());
        a.question_difficulties.push(difficulty.value());
        a.current_question = Some(question);
        info!(topic = %a.topic, number = a.questions.len(), difficulty = difficulty.value(), "onboarding question generated");
        Ok(state)
    })
}

fn finalize(mut state: OnboardingState) -> Result<OnboardingState, StepError> {
    let a = &mut state.assessment;
    a.is_complete = true;
    a.current_question = None;
    if a.final_assessment.is_none() {
        let score = a.score_percentage();
        let level = if a.ended_early { Difficulty::Beginner } else { level_for_score(score) };
        info!(topic = %a.topic, %level, score, "onboarding assessment finished");
        a.final_assessment = Some(FinalAssessment {
            knowledge_level: level,
            score,
            topic: a.topic.clone(),
            questions: a.questions.clone(),
            responses: a.answers.clone(),
        });
    }
    Ok(state)
}

fn respond(state: OnboardingState) -> Result<OnboardingState, StepError> {
    Ok(state)
}

pub(crate) fn graph(ctx: &Arc<StepContext>) -> GraphBuilder<OnboardingState> {
    Graph::builder(JobKind::OnboardingAssessment)
        .entry("apply_answer")
        .step("apply_answer", step_fn(apply_answer))
        .step("record_skip", step_fn(record_skip))
        .step("evaluate_answer", step_with(ctx, evaluate_answer))
        .step("check_progress", step_with(ctx, check_progress))
        .step("generate_question", step_with(ctx, generate_question))
        .step("finalize", step_fn(finalize))
        .step("respond", step_fn(respond))
        .route(
            "apply_answer",
            action,
            &[
                (Action::Skip, "record_skip"),
                (Action::Answer, "evaluate_answer"),
                (Action::FirstQuestion, "check_progress"),
            ],
        )
        .edge("record_skip", "check_progress")
        .edge("evaluate_answer", "check_progress")
        .route(
            "check_progress",
            progress,
            &[(Progress::Complete, "finalize"), (Progress::Continue, "generate_question")],
        )
        .edge("generate_question", "respond")
        .edge("finalize", "respond")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FnModel, StaticSearch, collaborators};
    use crate::workflow::{Engine, Workflow, WorkflowRun};
    use crate::workflows::WorkflowLimits;

    async fn run(model: FnModel, input: Value) -> (WorkflowRun, Arc<FnModel>) {
        let model = Arc::new(model);
        let ctx = Arc::new(StepContext {
            collaborators: collaborators(model.clone(), Arc::new(StaticSearch::with_hits(1))),
            limits: WorkflowLimits::default(),
        });
        let run = graph(&ctx)
            .build()
            .unwrap()
            .run(&Engine::default(), &input)
            .await
            .unwrap();
        (run, model)
    }

    fn asked(difficulties: &[u8], scores: &[f64]) -> Assessment {
        Assessment {
            topic: "Rust".into(),
            questions: difficulties.iter().enumerate().map(|(i, _)| format!("Q{i}")).collect(),
            question_difficulties: difficulties.to_vec(),
            answers: scores.iter().map(|_| "a".to_string()).collect(),
            scores: scores.to_vec(),
            current_question: Some(format!("Q{}", difficulties.len() - 1)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_turn_asks_a_question() {
        let (run, _) = run(
            FnModel::constant("Difficulty: 2\nQuestion: What does the borrow checker enforce?"),
            json!({"topic": "Rust"}),
        )
        .await;
        assert_eq!(run.path, vec!["apply_answer", "check_progress", "generate_question", "respond"]);
        assert_eq!(run.output.result["question"], json!("What does the borrow checker enforce?"));
        assert_eq!(run.output.result["difficulty"], json!(2));
        assert_eq!(run.output.result["is_complete"], json!(false));
        assert_eq!(run.output.result["assessment_state"]["questions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn correct_streak_promotes_difficulty() {
        let mut state = asked(&[2], &[]);
        state.consecutive_correct = 1;
        state.scores = vec![1.0];
        state.answers = vec!["a".into()];
        state.questions.push("Q1".into());
        state.question_difficulties.push(2);
        state.current_question = Some("Q1".into());

        let model = FnModel::new(|prompt, _| {
            if prompt.contains("Answer: ownership") {
                Ok("1:Correct".to_string())
            } else {
                Ok("Question: What is a lifetime?".to_string())
            }
        });
        let (run, _) = run(
            model,
            json!({"topic": "Rust", "assessment_state": state, "answer": "ownership"}),
        )
        .await;

        assert_eq!(
            run.path,
            vec!["apply_answer", "evaluate_answer", "check_progress", "generate_question", "respond"]
        );
        assert_eq!(run.output.result["difficulty"], json!(3));
        assert!(run.output.result["feedback"].as_str().unwrap().contains("Difficulty increased"));
    }

    #[test]
    fn losing_streak_demotes_but_not_below_minimum() {
        let mut a = Assessment { target_difficulty: 1, ..Default::default() };
        a.record_score("x".into(), 0.0);
        a.record_miss(SKIPPED.into());
        assert_eq!(a.target_difficulty, 0);
        a.record_miss(SKIPPED.into());
        a.record_miss(SKIPPED.into());
        assert_eq!(a.target_difficulty, 0);
    }

    #[tokio::test]
    async fn two_misses_at_minimum_end_as_beginner() {
        let mut state = asked(&[0, 0], &[0.0]);
        state.target_difficulty = 0;
        state.consecutive_wrong = 1;

        let (run, model) = run(
            FnModel::constant("unused"),
            json!({"topic": "Rust", "assessment_state": state, "skip": true}),
        )
        .await;

        assert_eq!(
            run.path,
            vec!["apply_answer", "record_skip", "check_progress", "finalize", "respond"]
        );
        assert_eq!(model.calls(), 0);
        assert_eq!(run.output.result["is_complete"], json!(true));
        assert_eq!(run.output.result["question"], Value::Null);
        assert_eq!(run.output.result["final_assessment"]["knowledge_level"], json!("Beginner"));
    }

    #[tokio::test]
    async fn question_cap_finishes_with_score_level() {
        let difficulties = vec![2u8; 10];
        let state = asked(&difficulties, &[1.0; 9]);
        let (run, _) = run(
            FnModel::constant("1:Right"),
            json!({"topic": "Rust", "assessment_state": state, "answer": "yes"}),
        )
        .await;

        assert_eq!(run.path[3], "finalize");
        let final_assessment = &run.output.result["final_assessment"];
        assert_eq!(final_assessment["knowledge_level"], json!("Advanced"));
        assert_eq!(final_assessment["score"], json!(100.0));
        assert_eq!(final_assessment["responses"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn grades_and_levels() {
        assert_eq!(parse_grade("1:Correct"), Some((1.0, "Correct".to_string())));
        assert_eq!(parse_grade(" 0.5 : Nearly there"), Some((0.5, "Nearly there".to_string())));
        assert_eq!(parse_grade("great answer"), None);
        assert_eq!(parse_grade("7:huh"), None);
        assert_eq!(level_for_score(75.0), Difficulty::Advanced);
        assert_eq!(level_for_score(40.0), Difficulty::GoodKnowledge);
        assert_eq!(level_for_score(39.9), Difficulty::Beginner);
    }
}
