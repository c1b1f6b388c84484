//! Native runtime seam.
//!
//! An adapter validates its artifact and then asks a [`RuntimeLoader`] for a
//! [`NativeRuntime`]: the object that actually turns a prompt into text. The
//! [`RuntimeRegistry`] maps each [`BackendKind`] to its loader, so a
//! deployment can swap the built-in CPU runtimes for its own.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::builtin::{LexicalSpanLoader, LlamaCliLoader, TemplateHintLoader};
use crate::config::{BackendDescriptor, BackendKind, GenerationParams, Task};
use crate::error::InferenceResult;

/// Execution strategy chosen when a backend is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Optimized graph found next to the model files
    CompiledGraph,
    /// General pipeline over the model directory
    Pipeline,
    /// Quantized single-file GGUF model
    Gguf,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompiledGraph => "compiled_graph",
            Self::Pipeline => "pipeline",
            Self::Gguf => "gguf",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact located and checked by the adapter before the runtime loads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Model directory, or the model file for GGUF artifacts
    pub path: PathBuf,
    pub mode: ExecutionMode,
    /// Bytes on disk
    pub size_bytes: u64,
}

/// Text handed to a runtime, with the raw pieces it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Fully rendered prompt for text-in/text-out runtimes
    pub text: String,
    pub question: String,
    pub context: String,
    pub task: Task,
    /// Set on the adapter's internal retry
    pub simplified: bool,
}

/// Raw output of one runtime invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeOutput {
    pub text: String,
    /// Softmax mass at the selected start and end positions (span models)
    pub span_probabilities: Option<(f64, f64)>,
    pub token_logprobs: Option<Vec<f64>>,
}

impl RuntimeOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_span_probabilities(mut self, start: f64, end: f64) -> Self {
        self.span_probabilities = Some((start, end));
        self
    }

    pub fn with_logprobs(mut self, logprobs: Vec<f64>) -> Self {
        self.token_logprobs = Some(logprobs);
        self
    }
}

/// A loaded model runtime.
///
/// Implementations must bound every `run` by `params.max_tokens`; the adapter
/// adds a wall-clock timeout on top.
#[async_trait]
pub trait NativeRuntime: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    async fn run(&self, prompt: &Prompt, params: &GenerationParams) -> InferenceResult<RuntimeOutput>;

    /// Whether `run` may be called concurrently on one instance.
    /// When false the lifecycle manager serializes calls per backend.
    fn supports_concurrent_generation(&self) -> bool {
        true
    }

    /// Release native resources. Called once when the backend is released.
    async fn shutdown(&self) {}
}

/// Creates runtimes for one backend kind.
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    async fn load(
        &self,
        descriptor: &BackendDescriptor,
        artifact: &ResolvedArtifact,
    ) -> InferenceResult<Arc<dyn NativeRuntime>>;
}

/// Loader lookup by backend kind.
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    loaders: HashMap<BackendKind, Arc<dyn RuntimeLoader>>,
}

impl RuntimeRegistry {
    /// Registry with no loaders; every kind must be registered explicitly.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in CPU runtimes: lexical span reader, template hint
    /// composer and the `llama-cli` process runner.
    pub fn builtin() -> Self {
        Self::empty()
            .with_loader(BackendKind::Extractive, Arc::new(LexicalSpanLoader))
            .with_loader(BackendKind::Seq2Seq, Arc::new(TemplateHintLoader))
            .with_loader(BackendKind::Generative, Arc::new(LlamaCliLoader))
    }

    pub fn with_loader(mut self, kind: BackendKind, loader: Arc<dyn RuntimeLoader>) -> Self {
        self.loaders.insert(kind, loader);
        self
    }

    pub fn loader(&self, kind: BackendKind) -> Option<Arc<dyn RuntimeLoader>> {
        self.loaders.get(&kind).cloned()
    }
}

impl fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.loaders.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("RuntimeRegistry").field("kinds", &kinds).finish()
    }
}
