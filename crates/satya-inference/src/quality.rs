//! Quality gate for hint output.
//!
//! A conservative string check that catches output which is technically
//! valid but useless, such as the model echoing its own prompt. It adds no
//! latency or memory; it is not a semantic classifier.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::prompt::parse_hints;
use crate::types::GenerationResult;

/// Prompt fragments that must never appear in a hint (lowercase).
pub const ECHO_MARKERS: &[&str] = &[
    "context:",
    "hints:",
    "### task",
    "generate 3 short hints",
    "generate 3 concise hints",
    "learning system for grade 10 students",
    "question",
];

/// Minimum combined length of all hints, in characters.
pub const MIN_COMBINED_CHARS: usize = 30;

/// Phrases of the neutral padding hints; a list made only of these says
/// nothing about the actual passage.
pub const FILLER_MARKERS: &[&str] = &["key terms", "main idea", "concepts in the context connect"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// No usable hint text
    Empty,
    /// A hint repeats part of the prompt
    PromptEcho { marker: String },
    /// Combined hint text below the length floor
    TooShort { chars: usize },
    /// Every hint is generic padding
    FillerOnly,
    /// The adapter gave up and returned its canned text
    DegradedOutput,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "no hints"),
            Self::PromptEcho { marker } => write!(f, "prompt echo '{marker}'"),
            Self::TooShort { chars } => {
                write!(f, "{chars} chars, need {MIN_COMBINED_CHARS}")
            }
            Self::FillerOnly => write!(f, "filler only"),
            Self::DegradedOutput => write!(f, "canned output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateDecision {
    Accept,
    Reject(RejectReason),
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QualityGate;

impl QualityGate {
    pub fn new() -> Self {
        Self
    }

    /// Genericness check over a hint list.
    pub fn check_hints<S: AsRef<str>>(&self, hints: &[S]) -> GateDecision {
        let hints: Vec<&str> = hints
            .iter()
            .map(|h| h.as_ref().trim())
            .filter(|h| !h.is_empty())
            .collect();

        if hints.is_empty() {
            return GateDecision::Reject(RejectReason::Empty);
        }

        for hint in &hints {
            let lowered = hint.to_lowercase();
            if let Some(marker) = ECHO_MARKERS.iter().find(|m| lowered.contains(*m)) {
                return GateDecision::Reject(RejectReason::PromptEcho {
                    marker: marker.to_string(),
                });
            }
        }

        let chars: usize = hints.iter().map(|h| h.chars().count()).sum();
        if chars < MIN_COMBINED_CHARS {
            return GateDecision::Reject(RejectReason::TooShort { chars });
        }

        let filler_only = hints.iter().all(|hint| {
            let lowered = hint.to_lowercase();
            FILLER_MARKERS.iter().any(|m| lowered.contains(m))
        });
        if filler_only {
            return GateDecision::Reject(RejectReason::FillerOnly);
        }

        GateDecision::Accept
    }

    /// Parse a generation result into hints and check them.
    pub fn evaluate(&self, result: &GenerationResult) -> (Vec<String>, GateDecision) {
        if result.is_canned() {
            return (Vec::new(), GateDecision::Reject(RejectReason::DegradedOutput));
        }
        let hints = parse_hints(&result.text);
        let decision = self.check_hints(&hints);
        (hints, decision)
    }
}
