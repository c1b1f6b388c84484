//! Tiered orchestrator.
//!
//! Answers one request with the cheapest capable backend, escalating to the
//! fallback tier only when the primary is rejected, and falling back to a
//! canned response when both tiers are rejected.
//!
//! ```text
//! INIT → PRIMARY_ATTEMPT ─┬→ ACCEPT ──────────────────────┬→ DONE
//!                         └→ ESCALATE → FALLBACK_ATTEMPT ─┤
//!                               │             └→ ACCEPT ──┤
//!                               └──────────→ DEFAULT ─────┘
//! ```
//!
//! Attempts are strictly sequential so primary and fallback never run
//! together. Every rejection is a value ([`EscalationReason`]), never a
//! propagated error: the public API is infallible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::backend::{RuntimeRegistry, build_adapter};
use crate::config::{OrchestratorConfig, Task, Tier};
use crate::error::{InferenceError, InferenceResult};
use crate::hardware::HostResources;
use crate::lifecycle::{BackendStatus, ResourceLifecycleManager};
use crate::quality::{GateDecision, QualityGate};
use crate::scoring::ConfidenceScorer;
use crate::types::{
    Answer, EscalationReason, FallbackOutcome, GenerationResult, Hints, InferenceRequest,
    OrchestrationState, Responder,
};

/// Answer returned when every tier is rejected.
pub const DEFAULT_ANSWER: &str = "I'm having trouble processing your question. Please try again.";

/// Hints returned when every tier is rejected.
pub const DEFAULT_HINTS: [&str; 3] = [
    "Break the question into smaller parts and look for clues in the context.",
    "Think about what you already know about this topic and connect it to the question.",
    "Don't worry if it's tricky. Try to find the main idea or ask for help if you get stuck!",
];

/// Neutral hints used to pad an accepted list shorter than three.
pub const PADDING_HINTS: [&str; 3] = [
    "Look for key terms in the context related to the question.",
    "Consider how different concepts in the context connect to each other.",
    "Identify the main idea or purpose mentioned in the context.",
];

// ============================================================================
// Routing
// ============================================================================

/// Backend id per (task, tier) cell, built once from the descriptors.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<(Task, Tier), String>,
}

impl RouteTable {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let mut routes = HashMap::new();
        for descriptor in &config.backends {
            for task in &descriptor.tasks {
                routes
                    .entry((*task, descriptor.tier))
                    .or_insert_with(|| descriptor.id.clone());
            }
        }
        Self { routes }
    }

    pub fn get(&self, task: Task, tier: Tier) -> Option<&str> {
        self.routes.get(&(task, tier)).map(String::as_str)
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct OrchestratorStats {
    answer_requests: AtomicU64,
    hint_requests: AtomicU64,
    primary_accepts: AtomicU64,
    escalations: AtomicU64,
    fallback_accepts: AtomicU64,
    defaults: AtomicU64,
}

/// Point-in-time copy of [`OrchestratorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub answer_requests: u64,
    pub hint_requests: u64,
    pub primary_accepts: u64,
    pub escalations: u64,
    pub fallback_accepts: u64,
    pub defaults: u64,
}

impl OrchestratorStats {
    fn record(&self, outcome: &FallbackOutcome) {
        let requests = match outcome.task {
            Task::Answer => &self.answer_requests,
            Task::Hints => &self.hint_requests,
        };
        requests.fetch_add(1, Ordering::Relaxed);

        if outcome.visited(OrchestrationState::Escalate) {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match &outcome.answered_by {
            Responder::Backend {
                tier: Tier::Primary,
                ..
            } => &self.primary_accepts,
            Responder::Backend {
                tier: Tier::Fallback,
                ..
            } => &self.fallback_accepts,
            Responder::Default => &self.defaults,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            answer_requests: self.answer_requests.load(Ordering::Relaxed),
            hint_requests: self.hint_requests.load(Ordering::Relaxed),
            primary_accepts: self.primary_accepts.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            fallback_accepts: self.fallback_accepts.load(Ordering::Relaxed),
            defaults: self.defaults.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Result of one tier attempt.
enum Attempt {
    Accept(Accepted),
    Reject(EscalationReason),
}

struct Accepted {
    backend_id: String,
    tier: Tier,
    result: GenerationResult,
    confidence: f64,
    hints: Vec<String>,
}

pub struct TieredOrchestrator {
    config: OrchestratorConfig,
    routes: RouteTable,
    lifecycle: ResourceLifecycleManager,
    scorer: ConfidenceScorer,
    gate: QualityGate,
    stats: OrchestratorStats,
    last_responder: RwLock<Option<String>>,
}

impl TieredOrchestrator {
    /// Orchestrator over the built-in runtimes.
    pub fn from_config(config: OrchestratorConfig) -> InferenceResult<Self> {
        Self::with_runtimes(config, RuntimeRegistry::builtin())
    }

    /// Orchestrator with caller-supplied runtime loaders.
    ///
    /// Nothing is loaded here; backends load lazily on first use.
    pub fn with_runtimes(config: OrchestratorConfig, registry: RuntimeRegistry) -> InferenceResult<Self> {
        config.validate()?;

        let adapters = config
            .backends
            .iter()
            .cloned()
            .map(|descriptor| build_adapter(descriptor, &registry))
            .collect::<InferenceResult<Vec<_>>>()?;

        let budget_mb = config
            .memory_budget_mb
            .unwrap_or_else(|| HostResources::detect().default_memory_budget_mb());
        let lifecycle = ResourceLifecycleManager::new(adapters, config.residency, budget_mb);

        Ok(Self {
            routes: RouteTable::from_config(&config),
            config,
            lifecycle,
            scorer: ConfidenceScorer::new(),
            gate: QualityGate::new(),
            stats: OrchestratorStats::default(),
            last_responder: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &ResourceLifecycleManager {
        &self.lifecycle
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Answer text and confidence in [0.1, 0.95]. Never fails.
    pub async fn get_answer(&self, question: &str, context: &str) -> (String, f64) {
        let answer = self.answer(&InferenceRequest::answer(question, context)).await;
        (answer.text, answer.confidence)
    }

    /// Exactly three non-empty hints. Never fails.
    pub async fn get_hints(&self, question: &str, context: &str) -> [String; 3] {
        self.hints(&InferenceRequest::hints(question, context)).await.items
    }

    /// Answer with its full outcome record.
    pub async fn answer(&self, request: &InferenceRequest) -> Answer {
        let request = InferenceRequest {
            task: Task::Answer,
            ..request.clone()
        };
        let (accepted, outcome) = self.run(&request).await;

        match accepted {
            Some(accepted) => Answer {
                text: accepted.result.text,
                confidence: accepted.confidence,
                outcome,
            },
            None => Answer {
                text: DEFAULT_ANSWER.to_string(),
                confidence: self.config.confidence_floor,
                outcome,
            },
        }
    }

    /// Three hints with their full outcome record.
    pub async fn hints(&self, request: &InferenceRequest) -> Hints {
        let request = InferenceRequest {
            task: Task::Hints,
            ..request.clone()
        };
        let (accepted, outcome) = self.run(&request).await;

        match accepted {
            Some(accepted) => Hints {
                items: pad_hints(accepted.hints),
                confidence: accepted.confidence,
                outcome,
            },
            None => Hints {
                items: DEFAULT_HINTS.map(String::from),
                confidence: self.config.confidence_floor,
                outcome,
            },
        }
    }

    /// Drive the state machine for one request.
    async fn run(&self, request: &InferenceRequest) -> (Option<Accepted>, FallbackOutcome) {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("orchestrate", request_id = %request_id, task = %request.task);

        async {
            let started = Instant::now();
            let mut state = OrchestrationState::Init;
            let mut states = vec![state];
            let mut reasons = Vec::new();
            let mut accepted = None;
            let mut fallback_triggered = false;

            loop {
                state = match state {
                    OrchestrationState::Init => OrchestrationState::PrimaryAttempt,
                    OrchestrationState::PrimaryAttempt => {
                        match self.attempt(Tier::Primary, request).await {
                            Attempt::Accept(a) => {
                                accepted = Some(a);
                                OrchestrationState::Accept
                            }
                            Attempt::Reject(reason) => {
                                warn!(%reason, "primary rejected, escalating");
                                reasons.push(reason);
                                OrchestrationState::Escalate
                            }
                        }
                    }
                    OrchestrationState::Escalate => {
                        if self.routes.get(request.task, Tier::Fallback).is_some() {
                            fallback_triggered = true;
                            OrchestrationState::FallbackAttempt
                        } else {
                            reasons.push(EscalationReason::NoBackend {
                                task: request.task,
                                tier: Tier::Fallback,
                            });
                            OrchestrationState::Default
                        }
                    }
                    OrchestrationState::FallbackAttempt => {
                        match self.attempt(Tier::Fallback, request).await {
                            Attempt::Accept(a) => {
                                accepted = Some(a);
                                OrchestrationState::Accept
                            }
                            Attempt::Reject(reason) => {
                                warn!(%reason, "fallback rejected");
                                reasons.push(reason);
                                OrchestrationState::Default
                            }
                        }
                    }
                    OrchestrationState::Accept | OrchestrationState::Default => {
                        OrchestrationState::Done
                    }
                    OrchestrationState::Done => break,
                };
                states.push(state);
            }

            let answered_by = match &accepted {
                Some(a) => Responder::Backend {
                    id: a.backend_id.clone(),
                    tier: a.tier,
                },
                None => Responder::Default,
            };
            if let Responder::Backend { id, .. } = &answered_by {
                *self.last_responder.write() = Some(id.clone());
            }

            let outcome = FallbackOutcome {
                request_id: request_id.clone(),
                task: request.task,
                answered_by,
                fallback_triggered,
                states,
                reasons,
                backend_mode: accepted
                    .as_ref()
                    .and_then(|a| a.result.backend_mode().map(str::to_string)),
                latency_ms: started.elapsed().as_millis() as u64,
            };
            self.stats.record(&outcome);

            if outcome.is_default() {
                warn!(reasons = outcome.reasons.len(), "all tiers rejected, returning default response");
            } else {
                info!(
                    answered_by = %outcome.answered_by,
                    escalated = outcome.fallback_triggered,
                    latency_ms = outcome.latency_ms,
                    "request served"
                );
            }

            (accepted, outcome)
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, tier: Tier, request: &InferenceRequest) -> Attempt {
        let task = request.task;
        let Some(backend_id) = self.routes.get(task, tier) else {
            return Attempt::Reject(EscalationReason::NoBackend { task, tier });
        };
        let Some(descriptor) = self.lifecycle.descriptor(backend_id) else {
            return Attempt::Reject(EscalationReason::NoBackend { task, tier });
        };
        let params = descriptor.params_for(task).clone();

        let started = Instant::now();
        let result = match self.lifecycle.generate(backend_id, request, &params).await {
            Ok(result) => result,
            Err(e) => return Attempt::Reject(reason_for(backend_id, e)),
        };
        debug!(
            backend = backend_id,
            %tier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "attempt produced output"
        );

        let confidence = self.scorer.score(&result);
        let hints = match task {
            Task::Answer => {
                let below = self
                    .config
                    .answer_min_confidence
                    .filter(|_| tier == Tier::Primary)
                    .is_some_and(|threshold| confidence < threshold);
                if below {
                    return Attempt::Reject(EscalationReason::LowConfidence {
                        backend: backend_id.to_string(),
                        confidence,
                    });
                }
                Vec::new()
            }
            Task::Hints => match self.gate.evaluate(&result) {
                (hints, GateDecision::Accept) => hints,
                (_, GateDecision::Reject(reason)) => {
                    return Attempt::Reject(EscalationReason::QualityRejected {
                        backend: backend_id.to_string(),
                        detail: reason.to_string(),
                    });
                }
            },
        };

        Attempt::Accept(Accepted {
            backend_id: backend_id.to_string(),
            tier,
            result,
            confidence,
            hints,
        })
    }

    /// Diagnostics for the most recent responder, or the primary answer
    /// backend before any request has been served.
    pub fn get_model_info(&self) -> HashMap<String, Value> {
        let statuses = self.lifecycle.status();
        let current = self
            .last_responder
            .read()
            .clone()
            .or_else(|| self.routes.get(Task::Answer, Tier::Primary).map(str::to_string))
            .or_else(|| self.lifecycle.backend_ids().into_iter().next());

        let mut info = HashMap::new();
        if let Some(descriptor) = current.as_deref().and_then(|id| self.lifecycle.descriptor(id)) {
            let status = statuses.iter().find(|s| s.id == descriptor.id);
            info.insert("backend".into(), json!(descriptor.id));
            info.insert("name".into(), json!(descriptor.name));
            info.insert("version".into(), json!(descriptor.version));
            info.insert("kind".into(), json!(descriptor.kind.to_string()));
            info.insert("tier".into(), json!(descriptor.tier.to_string()));
            info.insert("quantization".into(), json!(descriptor.quantization));
            info.insert(
                "mode".into(),
                json!(status.and_then(|s| s.mode).map(|m| m.to_string())),
            );
            info.insert("max_length".into(), json!(descriptor.params.max_tokens));
            info.insert("context_window".into(), json!(descriptor.context_window));
            info.insert("temperature".into(), json!(descriptor.params.temperature));
            info.insert("top_p".into(), json!(descriptor.params.top_p));
        }

        info.insert("residency".into(), json!(self.lifecycle.policy().to_string()));
        info.insert("memory_budget_mb".into(), json!(self.lifecycle.budget_mb()));
        info.insert("resident_mb".into(), json!(self.lifecycle.resident_mb()));
        info.insert("backends".into(), json!(statuses));
        info.insert("stats".into(), json!(self.stats.snapshot()));
        info
    }

    /// Status of every configured backend.
    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.lifecycle.status()
    }

    pub fn available_backends(&self) -> Vec<String> {
        self.lifecycle.backend_ids()
    }

    /// Release backends (fallback first) until at most `target_mb` is resident.
    pub async fn relieve_pressure(&self, target_mb: u64) -> Vec<String> {
        self.lifecycle.relieve_pressure(target_mb).await
    }

    /// Release every backend, fallback tier first.
    pub async fn shutdown(&self) -> Vec<String> {
        let released = self.lifecycle.release_all().await;
        info!(?released, "orchestrator shut down");
        released
    }
}

fn reason_for(backend_id: &str, err: InferenceError) -> EscalationReason {
    let backend = backend_id.to_string();
    match err {
        InferenceError::ModelLoadFailed { reason, .. } => EscalationReason::LoadFailed {
            backend,
            detail: reason,
        },
        InferenceError::BackendUnavailable { .. } => EscalationReason::Unavailable { backend },
        InferenceError::BudgetExceeded(detail) => EscalationReason::BudgetExceeded { backend, detail },
        other => EscalationReason::GenerationFailed {
            backend,
            detail: other.to_string(),
        },
    }
}

/// Exactly three hints: truncate, or pad with neutral hints not already used.
fn pad_hints(mut hints: Vec<String>) -> [String; 3] {
    hints.retain(|h| !h.trim().is_empty());
    hints.truncate(3);
    for filler in PADDING_HINTS {
        if hints.len() == 3 {
            break;
        }
        if !hints.iter().any(|h| h == filler) {
            hints.push(filler.to_string());
        }
    }
    let mut items = hints.into_iter();
    std::array::from_fn(|i| {
        items
            .next()
            .unwrap_or_else(|| PADDING_HINTS[i].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendDescriptor, BackendKind};

    #[test]
    fn test_route_table() {
        let config = OrchestratorConfig::default_layout("/models");
        let routes = RouteTable::from_config(&config);
        assert_eq!(routes.get(Task::Answer, Tier::Primary), Some("qna"));
        assert_eq!(routes.get(Task::Hints, Tier::Primary), Some("hint"));
        assert_eq!(routes.get(Task::Answer, Tier::Fallback), Some("phi2"));
        assert_eq!(routes.get(Task::Hints, Tier::Fallback), Some("phi2"));

        let config = OrchestratorConfig::new(vec![BackendDescriptor::new(
            "qna",
            BackendKind::Extractive,
            "/m",
        )]);
        assert_eq!(RouteTable::from_config(&config).get(Task::Answer, Tier::Fallback), None);
    }

    #[test]
    fn test_pad_hints() {
        let padded = pad_hints(vec!["Mitochondria make ATP.".into()]);
        assert_eq!(padded[0], "Mitochondria make ATP.");
        assert_eq!(padded[1], PADDING_HINTS[0]);
        assert_eq!(padded[2], PADDING_HINTS[1]);

        let five: Vec<String> = (1..=5).map(|i| format!("Hint number {i}")).collect();
        assert_eq!(pad_hints(five)[2], "Hint number 3");

        let padded = pad_hints(vec![PADDING_HINTS[0].to_string(), " ".into()]);
        assert_eq!(padded, PADDING_HINTS.map(String::from));
    }

    #[test]
    fn test_reason_mapping() {
        assert!(matches!(
            reason_for("qna", InferenceError::load("qna", "missing")),
            EscalationReason::LoadFailed { .. }
        ));
        assert!(matches!(
            reason_for("phi2", InferenceError::generation("phi2", "timeout")),
            EscalationReason::GenerationFailed { .. }
        ));
        assert!(matches!(
            reason_for("phi2", InferenceError::BudgetExceeded("x".into())),
            EscalationReason::BudgetExceeded { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_artifacts_fall_through_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::default_layout(dir.path()).with_memory_budget_mb(4096);
        let orchestrator = TieredOrchestrator::from_config(config).unwrap();

        let (text, confidence) = orchestrator.get_answer("What is a cell?", "A cell is ...").await;
        assert_eq!(text, DEFAULT_ANSWER);
        assert_eq!(confidence, 0.1);

        let hints = orchestrator.get_hints("What is a cell?", "A cell is ...").await;
        assert_eq!(hints, DEFAULT_HINTS.map(String::from));

        let stats = orchestrator.stats();
        assert_eq!(stats.defaults, 2);
        assert_eq!(stats.escalations, 2);

        let info = orchestrator.get_model_info();
        assert_eq!(info["backend"], "qna");
        assert_eq!(info["backends"].as_array().unwrap().len(), 3);
    }
}
