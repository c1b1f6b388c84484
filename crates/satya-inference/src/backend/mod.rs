//! Backend adapters.
//!
//! A [`BackendAdapter`] wraps one local model runtime behind a uniform
//! load / generate / unload interface. The set of adapters is closed:
//!
//! - [`ShortFormAdapter`] for extractive and seq2seq models (model directory
//!   with `config.json`, optional compiled graph)
//! - [`GenerativeAdapter`] for larger GGUF models, used as fallback
//!
//! Adapters never keep a handle: the [`crate::lifecycle`] manager owns every
//! [`BackendHandle`] and lends it for the duration of one `generate` call.

pub mod builtin;
pub mod generative;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod prompt;
pub mod runtime;
pub mod short_form;
pub mod wordpiece;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

pub use generative::GenerativeAdapter;
pub use runtime::{
    ExecutionMode, NativeRuntime, Prompt, ResolvedArtifact, RuntimeLoader, RuntimeOutput,
    RuntimeRegistry,
};
pub use short_form::ShortFormAdapter;

use crate::config::{BackendDescriptor, BackendKind, GenerationParams};
use crate::error::{InferenceError, InferenceResult};
use crate::types::{GenerationResult, InferenceRequest, OutputKind};

/// Text returned when both generation attempts come back empty.
pub const CANNED_TEXT: &str =
    "I couldn't generate a proper answer. Please try rephrasing your question.";

/// Raw confidence attached to [`CANNED_TEXT`].
pub const CANNED_CONFIDENCE: f64 = 0.1;

/// Raw confidence of free-form generative output.
pub const GENERATIVE_BASE_CONFIDENCE: f64 = 0.7;

/// Resources of one loaded backend.
pub struct BackendHandle {
    pub backend_id: String,
    pub runtime: Arc<dyn NativeRuntime>,
    pub mode: ExecutionMode,
    /// Resolved model directory or file
    pub artifact: PathBuf,
    pub size_bytes: u64,
    pub loaded_at: DateTime<Utc>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("backend_id", &self.backend_id)
            .field("mode", &self.mode)
            .field("artifact", &self.artifact)
            .field("size_bytes", &self.size_bytes)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Uniform interface over one local model runtime.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Static descriptor, for routing and diagnostics.
    fn describe(&self) -> &BackendDescriptor;

    /// Validate the artifact and bring the runtime up.
    ///
    /// Every failure is [`InferenceError::ModelLoadFailed`].
    async fn load(&self) -> InferenceResult<BackendHandle>;

    /// Run one request. Retries once internally with a simplified prompt and
    /// cooler sampling; returns a canned result if both attempts are empty.
    async fn generate(
        &self,
        handle: &BackendHandle,
        request: &InferenceRequest,
        params: &GenerationParams,
    ) -> InferenceResult<GenerationResult>;

    /// Release the runtime behind `handle`.
    async fn unload(&self, handle: &BackendHandle) {
        handle.runtime.shutdown().await;
    }
}

/// Build the adapter variant for `descriptor.kind`.
pub fn build_adapter(
    descriptor: BackendDescriptor,
    registry: &RuntimeRegistry,
) -> InferenceResult<Arc<dyn BackendAdapter>> {
    let loader = registry.loader(descriptor.kind).ok_or_else(|| {
        InferenceError::Config(format!(
            "no runtime registered for {} backend '{}'",
            descriptor.kind, descriptor.id
        ))
    })?;

    Ok(match descriptor.kind {
        BackendKind::Extractive | BackendKind::Seq2Seq => {
            Arc::new(ShortFormAdapter::new(descriptor, loader))
        }
        BackendKind::Generative => Arc::new(GenerativeAdapter::new(descriptor, loader)),
    })
}

/// Coerce any loader error into a load failure for `backend`.
pub(crate) fn as_load_error(backend: &str, err: InferenceError) -> InferenceError {
    match err {
        err @ InferenceError::ModelLoadFailed { .. } => err,
        other => InferenceError::load(backend, other.to_string()),
    }
}

/// Shape of a cleaned attempt.
pub(crate) struct Cleaned {
    pub text: String,
    pub kind: OutputKind,
    pub raw_confidence: f64,
    pub token_logprobs: Option<Vec<f64>>,
}

/// Two-attempt generation shared by both adapters.
///
/// `render(simplified)` builds the prompt for an attempt; `clean` turns raw
/// runtime output into a result, or `None` when it is effectively empty.
pub(crate) async fn generate_with_retry<R, C>(
    descriptor: &BackendDescriptor,
    handle: &BackendHandle,
    params: &GenerationParams,
    render: R,
    clean: C,
) -> InferenceResult<GenerationResult>
where
    R: Fn(bool) -> Prompt,
    C: Fn(RuntimeOutput) -> Option<Cleaned>,
{
    let started = Instant::now();
    let backend = descriptor.id.as_str();

    let first = run_once(descriptor, handle, &render(false), params).await;
    let first_failure = match first {
        Ok(output) => match clean(output) {
            Some(cleaned) => return Ok(finish(cleaned, handle, backend, 1, started)),
            None => "empty output".to_string(),
        },
        Err(e) => e.to_string(),
    };

    warn!(backend, reason = %first_failure, "generation attempt failed, retrying with simplified prompt");

    let retry_params = params.simplified();
    let output = run_once(descriptor, handle, &render(true), &retry_params).await?;
    match clean(output) {
        Some(cleaned) => Ok(finish(cleaned, handle, backend, 2, started)),
        None => {
            warn!(backend, "both attempts produced empty output, returning canned text");
            let canned = Cleaned {
                text: CANNED_TEXT.to_string(),
                kind: OutputKind::Canned,
                raw_confidence: CANNED_CONFIDENCE,
                token_logprobs: None,
            };
            Ok(finish(canned, handle, backend, 2, started))
        }
    }
}

async fn run_once(
    descriptor: &BackendDescriptor,
    handle: &BackendHandle,
    prompt: &Prompt,
    params: &GenerationParams,
) -> InferenceResult<RuntimeOutput> {
    let timeout = descriptor.timeout();
    match tokio::time::timeout(timeout, handle.runtime.run(prompt, params)).await {
        Ok(result) => result.map_err(|e| match e {
            err @ InferenceError::GenerationFailed { .. } => err,
            other => InferenceError::generation(&descriptor.id, other.to_string()),
        }),
        Err(_) => Err(InferenceError::generation(
            &descriptor.id,
            format!("timed out after {}s", timeout.as_secs()),
        )),
    }
}

fn finish(
    cleaned: Cleaned,
    handle: &BackendHandle,
    backend: &str,
    attempts: u32,
    started: Instant,
) -> GenerationResult {
    let latency_ms = started.elapsed().as_millis() as u64;
    debug!(backend, attempts, latency_ms, kind = ?cleaned.kind, "generation finished");

    let mut result = GenerationResult::new(cleaned.text, cleaned.raw_confidence, cleaned.kind)
        .with_metadata("backend_mode", handle.mode.as_str())
        .with_metadata("backend", backend)
        .with_metadata("attempts", attempts)
        .with_metadata("latency_ms", latency_ms);
    if let Some(logprobs) = cleaned.token_logprobs {
        result = result.with_logprobs(logprobs);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Task;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted outputs in order.
    struct Scripted {
        outputs: Mutex<VecDeque<InferenceResult<RuntimeOutput>>>,
        prompts: Mutex<Vec<(bool, f32)>>,
    }

    impl Scripted {
        fn new(outputs: Vec<InferenceResult<RuntimeOutput>>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NativeRuntime for Scripted {
        fn mode(&self) -> ExecutionMode {
            ExecutionMode::Pipeline
        }

        async fn run(&self, prompt: &Prompt, params: &GenerationParams) -> InferenceResult<RuntimeOutput> {
            self.prompts.lock().push((prompt.simplified, params.temperature));
            self.outputs
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(RuntimeOutput::default()))
        }
    }

    fn handle(runtime: Arc<Scripted>) -> BackendHandle {
        BackendHandle {
            backend_id: "t".into(),
            runtime,
            mode: ExecutionMode::Pipeline,
            artifact: PathBuf::from("/m"),
            size_bytes: 0,
            loaded_at: Utc::now(),
        }
    }

    fn render(simplified: bool) -> Prompt {
        Prompt {
            text: "p".into(),
            question: "q".into(),
            context: "c".into(),
            task: Task::Answer,
            simplified,
        }
    }

    fn clean(output: RuntimeOutput) -> Option<Cleaned> {
        let text = output.text.trim().to_string();
        (text.len() >= 2).then_some(Cleaned {
            text,
            kind: OutputKind::Generative,
            raw_confidence: GENERATIVE_BASE_CONFIDENCE,
            token_logprobs: None,
        })
    }

    fn descriptor() -> BackendDescriptor {
        BackendDescriptor::new("t", BackendKind::Generative, "/m")
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let runtime = Scripted::new(vec![Ok(RuntimeOutput::text("Water moves."))]);
        let h = handle(runtime.clone());
        let params = GenerationParams::default();
        let result = generate_with_retry(&descriptor(), &h, &params, render, clean)
            .await
            .unwrap();

        assert_eq!(result.text, "Water moves.");
        assert_eq!(result.metadata["attempts"], 1);
        assert_eq!(result.backend_mode(), Some("pipeline"));
        assert_eq!(runtime.prompts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_uses_simplified_prompt_and_cooler_sampling() {
        let runtime = Scripted::new(vec![
            Err(InferenceError::generation("t", "boom")),
            Ok(RuntimeOutput::text("Recovered answer")),
        ]);
        let h = handle(runtime.clone());
        let params = GenerationParams::default();
        let result = generate_with_retry(&descriptor(), &h, &params, render, clean)
            .await
            .unwrap();

        assert_eq!(result.text, "Recovered answer");
        assert_eq!(result.metadata["attempts"], 2);
        let prompts = runtime.prompts.lock();
        assert!(!prompts[0].0 && prompts[1].0);
        assert!(prompts[1].1 < prompts[0].1);
    }

    #[tokio::test]
    async fn test_two_empty_attempts_return_canned() {
        let runtime = Scripted::new(vec![Ok(RuntimeOutput::text(" ")), Ok(RuntimeOutput::text(""))]);
        let h = handle(runtime);
        let result = generate_with_retry(&descriptor(), &h, &GenerationParams::default(), render, clean)
            .await
            .unwrap();

        assert!(result.is_canned());
        assert_eq!(result.text, CANNED_TEXT);
        assert_eq!(result.raw_confidence, CANNED_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_second_failure_surfaces_generation_error() {
        let runtime = Scripted::new(vec![
            Ok(RuntimeOutput::text("")),
            Err(InferenceError::Config("runtime crashed".into())),
        ]);
        let h = handle(runtime);
        let err = generate_with_retry(&descriptor(), &h, &GenerationParams::default(), render, clean)
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::GenerationFailed { .. }));
    }

    #[test]
    fn test_build_adapter_requires_loader() {
        let descriptor = BackendDescriptor::new("qna", BackendKind::Extractive, "/m");
        assert!(build_adapter(descriptor.clone(), &RuntimeRegistry::empty()).is_err());

        let adapter = build_adapter(descriptor, &RuntimeRegistry::builtin()).unwrap();
        assert_eq!(adapter.describe().id, "qna");
    }
}
