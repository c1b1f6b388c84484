//! Confidence scorer.
//!
//! Turns raw model signals into a comparable confidence, independent of the
//! backend that produced them. The result is a heuristic, not a calibrated
//! probability, and is always reported within [0.1, 0.95].

use serde::{Deserialize, Serialize};

use crate::types::{GenerationResult, OutputKind};

/// Lowest reported confidence.
pub const MIN_CONFIDENCE: f64 = 0.1;
/// Highest reported confidence.
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Base score of free-form generative output.
pub const GENERATIVE_BASE: f64 = 0.7;

const SHORT_WORDS: usize = 3;
const LONG_WORDS: usize = 50;
const SHORT_FACTOR: f64 = 0.6;
const LONG_FACTOR: f64 = 0.8;
const WORD_BONUS: f64 = 0.02;
const MAX_LENGTH_BONUS: f64 = 0.2;
const HEDGE_FACTOR: f64 = 0.5;

/// Uncertainty phrases, matched against lowercased text.
pub const HEDGING_PHRASES: &[&str] = &[
    "i don't know",
    "cannot answer",
    "not sure",
    "unclear",
    "sorry",
    "i'm not certain",
    "no information",
];

/// Intermediate values of one scoring pass, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub after_length: f64,
    pub after_hedging: f64,
    pub after_logprobs: f64,
    pub hedged: bool,
    pub words: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, result: &GenerationResult) -> f64 {
        self.breakdown(result).confidence
    }

    /// Run every stage in order: base, length, hedging, token
    /// probabilities, clamp.
    pub fn breakdown(&self, result: &GenerationResult) -> ScoreBreakdown {
        let base = match result.kind {
            OutputKind::Generative => GENERATIVE_BASE,
            OutputKind::Extractive => result.raw_confidence,
            OutputKind::Canned => {
                return ScoreBreakdown {
                    base: MIN_CONFIDENCE,
                    after_length: MIN_CONFIDENCE,
                    after_hedging: MIN_CONFIDENCE,
                    after_logprobs: MIN_CONFIDENCE,
                    hedged: false,
                    words: result.text.split_whitespace().count(),
                    confidence: MIN_CONFIDENCE,
                };
            }
        };
        self.score_text(&result.text, base, result.token_logprobs.as_deref())
    }

    /// Score `text` from an explicit base.
    pub fn score_text(&self, text: &str, base: f64, logprobs: Option<&[f64]>) -> ScoreBreakdown {
        let base = if base.is_nan() { 0.0 } else { base.clamp(0.0, 1.0) };
        let words = text.split_whitespace().count();
        let hedged = is_hedged(text);

        // Hedged text gets no length bonus, so the hedge factor is a hard
        // ceiling relative to the base.
        let after_length = if words < SHORT_WORDS {
            base * SHORT_FACTOR
        } else if words > LONG_WORDS {
            base * LONG_FACTOR
        } else if hedged {
            base
        } else {
            base + (words as f64 * WORD_BONUS).min(MAX_LENGTH_BONUS)
        };

        let after_hedging = if hedged {
            after_length * HEDGE_FACTOR
        } else {
            after_length
        };

        let after_logprobs = match logprobs.filter(|l| !l.is_empty()) {
            Some(logprobs) => {
                let finite: Vec<f64> = logprobs.iter().copied().filter(|l| l.is_finite()).collect();
                let avg = if finite.is_empty() {
                    f64::NEG_INFINITY
                } else {
                    finite.iter().sum::<f64>() / finite.len() as f64
                };
                (after_hedging * (1.0 + avg)).clamp(0.1, 0.9)
            }
            None => after_hedging,
        };

        let confidence = if after_logprobs.is_nan() {
            MIN_CONFIDENCE
        } else {
            after_logprobs.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
        };

        ScoreBreakdown {
            base,
            after_length,
            after_hedging,
            after_logprobs,
            hedged,
            words,
            confidence,
        }
    }
}

/// Whether `text` contains an uncertainty phrase.
pub fn is_hedged(text: &str) -> bool {
    let lowered = text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'");
    HEDGING_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}
