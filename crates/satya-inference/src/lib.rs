//! # satya-inference
//!
//! Tiered offline inference for the Satya learning assistant.
//!
//! Given a question and a retrieved context passage, produces an answer or
//! exactly three study hints using the cheapest capable local model. A
//! heavier model is tried only when the cheap one fails or its output is
//! rejected, and a canned response is returned when both are rejected.
//! Every backend stays within a configured memory budget.
//!
//! ## Components
//!
//! | Module         | Role                                                 |
//! |----------------|------------------------------------------------------|
//! | `backend`      | Adapters over local model runtimes                   |
//! | `scoring`      | Heuristic confidence in [0.1, 0.95]                  |
//! | `quality`      | Accept/reject check for hint output                  |
//! | `lifecycle`    | Lazy loading, residency and release under a budget   |
//! | `orchestrator` | Primary → fallback → default state machine           |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use satya_inference::{OrchestratorConfig, TieredOrchestrator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = OrchestratorConfig::default_layout("/opt/satya/models");
//!     let orchestrator = TieredOrchestrator::from_config(config).unwrap();
//!
//!     let (answer, confidence) = orchestrator
//!         .get_answer("What do mitochondria do?", "Mitochondria produce energy.")
//!         .await;
//!     println!("{answer} ({confidence:.2})");
//!
//!     orchestrator.shutdown().await;
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod hardware;
pub mod lifecycle;
pub mod orchestrator;
pub mod quality;
pub mod scoring;
pub mod types;

pub use backend::{
    BackendAdapter, BackendHandle, ExecutionMode, NativeRuntime, Prompt, ResolvedArtifact,
    RuntimeLoader, RuntimeOutput, RuntimeRegistry,
};
pub use config::{
    BackendDescriptor, BackendKind, GenerationParams, OrchestratorConfig, ResidencyPolicy, Task,
    Tier,
};
pub use error::{InferenceError, InferenceResult};
pub use hardware::HostResources;
pub use lifecycle::{BackendStatus, Residency, ResourceLifecycleManager};
pub use orchestrator::{StatsSnapshot, TieredOrchestrator};
pub use quality::{GateDecision, QualityGate, RejectReason};
pub use scoring::{ConfidenceScorer, ScoreBreakdown};
pub use types::{
    Answer, AnswerLength, EscalationReason, FallbackOutcome, GenerationResult, Hints,
    InferenceRequest, OrchestrationState, OutputKind, Responder,
};
