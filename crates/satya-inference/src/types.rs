//! Shared request, result and outcome types.
//!
//! A request enters the orchestrator as an [`InferenceRequest`], each backend
//! attempt produces a [`GenerationResult`], and every call ends with a
//! [`FallbackOutcome`] describing which backend answered and why.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Task, Tier};

/// Requested answer size for generative backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerLength {
    VeryShort,
    Short,
    #[default]
    Medium,
    Long,
    VeryLong,
}

impl AnswerLength {
    /// Token limit for this length. Still capped by the backend's own limit.
    pub fn max_tokens(&self) -> usize {
        match self {
            Self::VeryShort => 64,
            Self::Short => 128,
            Self::Medium => 256,
            Self::Long => 512,
            Self::VeryLong => 1024,
        }
    }

    /// Instruction line inserted into generative answer prompts.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::VeryShort => {
                "Give a very brief, one-sentence answer (10-20 words). Focus on the core concept only."
            }
            Self::Short => {
                "Give a concise answer in 2-3 sentences (30-50 words). Include key points and basic explanation."
            }
            Self::Medium => {
                "Give a detailed answer in 4-6 sentences (80-120 words). Include explanation, examples, and important details."
            }
            Self::Long => {
                "Give a comprehensive answer in 8-12 sentences (150-250 words). Include detailed explanation, multiple examples, and step-by-step breakdown."
            }
            Self::VeryLong => {
                "Give an extensive answer in 15-20 sentences (300-500 words). Include comprehensive coverage, multiple perspectives, detailed examples, and thorough explanation."
            }
        }
    }
}

impl fmt::Display for AnswerLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VeryShort => write!(f, "very_short"),
            Self::Short => write!(f, "short"),
            Self::Medium => write!(f, "medium"),
            Self::Long => write!(f, "long"),
            Self::VeryLong => write!(f, "very_long"),
        }
    }
}

impl std::str::FromStr for AnswerLength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "very_short" => Ok(Self::VeryShort),
            "short" => Ok(Self::Short),
            "medium" => Ok(Self::Medium),
            "long" => Ok(Self::Long),
            "very_long" => Ok(Self::VeryLong),
            other => Err(format!("unknown answer length: {other}")),
        }
    }
}

/// One question/context pair to answer or hint at.
///
/// Created per call and owned by the orchestrator invocation that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub question: String,
    /// Retrieved passage; its relevance is the retrieval layer's concern
    pub context: String,
    pub task: Task,
    /// Only consulted by generative backends
    #[serde(default)]
    pub answer_length: AnswerLength,
}

impl InferenceRequest {
    pub fn new(question: impl Into<String>, context: impl Into<String>, task: Task) -> Self {
        Self {
            question: question.into(),
            context: context.into(),
            task,
            answer_length: AnswerLength::default(),
        }
    }

    pub fn answer(question: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(question, context, Task::Answer)
    }

    pub fn hints(question: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(question, context, Task::Hints)
    }

    pub fn with_answer_length(mut self, length: AnswerLength) -> Self {
        self.answer_length = length;
        self
    }
}

/// Where a generation result's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Span selected from the context
    Extractive,
    /// Free or templated model completion
    Generative,
    /// Adapter's apology text after both attempts came back empty
    Canned,
}

/// Output of one adapter `generate` call. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    /// Always within [0, 1]
    pub raw_confidence: f64,
    pub kind: OutputKind,
    /// Per-token log-probabilities, when the runtime reports them
    pub token_logprobs: Option<Vec<f64>>,
    pub metadata: HashMap<String, Value>,
}

impl GenerationResult {
    pub fn new(text: impl Into<String>, raw_confidence: f64, kind: OutputKind) -> Self {
        Self {
            text: text.into(),
            raw_confidence: clamp_unit(raw_confidence),
            kind,
            token_logprobs: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_logprobs(mut self, logprobs: Vec<f64>) -> Self {
        self.token_logprobs = Some(logprobs);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `metadata.backend_mode`, if the adapter recorded one.
    pub fn backend_mode(&self) -> Option<&str> {
        self.metadata.get("backend_mode").and_then(Value::as_str)
    }

    pub fn is_canned(&self) -> bool {
        self.kind == OutputKind::Canned
    }
}

/// Clamp into [0, 1]; NaN becomes 0.
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

// ============================================================================
// Orchestration outcome
// ============================================================================

/// States of the per-request escalation machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Init,
    PrimaryAttempt,
    Accept,
    Escalate,
    FallbackAttempt,
    Default,
    Done,
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::PrimaryAttempt => "PRIMARY_ATTEMPT",
            Self::Accept => "ACCEPT",
            Self::Escalate => "ESCALATE",
            Self::FallbackAttempt => "FALLBACK_ATTEMPT",
            Self::Default => "DEFAULT",
            Self::Done => "DONE",
        };
        write!(f, "{name}")
    }
}

/// Why an attempt did not produce the final response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    /// Backend artifact failed to load (backend is now unavailable)
    LoadFailed { backend: String, detail: String },
    /// Backend was disabled by an earlier load failure
    Unavailable { backend: String },
    /// Runtime failure after the adapter's internal retry
    GenerationFailed { backend: String, detail: String },
    /// Hint output failed the quality gate
    QualityRejected { backend: String, detail: String },
    /// Answer scored below the configured threshold
    LowConfidence { backend: String, confidence: f64 },
    /// Admission would exceed the memory budget
    BudgetExceeded { backend: String, detail: String },
    /// No backend configured for this task and tier
    NoBackend { task: Task, tier: Tier },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadFailed { backend, detail } => write!(f, "{backend}: load failed ({detail})"),
            Self::Unavailable { backend } => write!(f, "{backend}: unavailable"),
            Self::GenerationFailed { backend, detail } => {
                write!(f, "{backend}: generation failed ({detail})")
            }
            Self::QualityRejected { backend, detail } => {
                write!(f, "{backend}: rejected by quality gate ({detail})")
            }
            Self::LowConfidence {
                backend,
                confidence,
            } => write!(f, "{backend}: low confidence {confidence:.2}"),
            Self::BudgetExceeded { backend, detail } => {
                write!(f, "{backend}: budget exceeded ({detail})")
            }
            Self::NoBackend { task, tier } => write!(f, "no {tier} backend for {task}"),
        }
    }
}

/// Which source produced the response returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Responder {
    Backend { id: String, tier: Tier },
    /// Task-specific canned response
    Default,
}

impl fmt::Display for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { id, tier } => write!(f, "{id} ({tier})"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Final decision record of one orchestration call. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackOutcome {
    pub request_id: String,
    pub task: Task,
    pub answered_by: Responder,
    /// Whether the fallback tier was attempted
    pub fallback_triggered: bool,
    /// Visited states in order, ending with `Done`
    pub states: Vec<OrchestrationState>,
    /// One entry per rejected attempt, in order
    pub reasons: Vec<EscalationReason>,
    /// `metadata.backend_mode` of the accepted result
    pub backend_mode: Option<String>,
    pub latency_ms: u64,
}

impl FallbackOutcome {
    pub fn visited(&self, state: OrchestrationState) -> bool {
        self.states.contains(&state)
    }

    pub fn is_default(&self) -> bool {
        self.answered_by == Responder::Default
    }
}

/// Answer plus its scored confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Within [0.1, 0.95]
    pub confidence: f64,
    pub outcome: FallbackOutcome,
}

/// Exactly three study hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hints {
    pub items: [String; 3],
    pub confidence: f64,
    pub outcome: FallbackOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_confidence_clamped() {
        assert_eq!(
            GenerationResult::new("x", 1.7, OutputKind::Generative).raw_confidence,
            1.0
        );
        assert_eq!(
            GenerationResult::new("x", -0.2, OutputKind::Extractive).raw_confidence,
            0.0
        );
        assert_eq!(
            GenerationResult::new("x", f64::NAN, OutputKind::Canned).raw_confidence,
            0.0
        );
    }

    #[test]
    fn test_answer_length_parse_and_tokens() {
        assert_eq!("very-short".parse::<AnswerLength>().unwrap(), AnswerLength::VeryShort);
        assert_eq!("LONG".parse::<AnswerLength>().unwrap(), AnswerLength::Long);
        assert!("huge".parse::<AnswerLength>().is_err());
        assert_eq!(AnswerLength::default().max_tokens(), 256);
        assert_eq!(AnswerLength::VeryLong.max_tokens(), 1024);
    }

    #[test]
    fn test_backend_mode_metadata() {
        let result = GenerationResult::new("Paris", 0.8, OutputKind::Extractive)
            .with_metadata("backend_mode", "compiled_graph");
        assert_eq!(result.backend_mode(), Some("compiled_graph"));
        assert!(!result.is_canned());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(OrchestrationState::FallbackAttempt.to_string(), "FALLBACK_ATTEMPT");
        assert_eq!(
            Responder::Backend {
                id: "phi2".into(),
                tier: Tier::Fallback
            }
            .to_string(),
            "phi2 (fallback)"
        );
    }
}
